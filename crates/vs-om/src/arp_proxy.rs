//! ARP proxy configuration: an IPv4 range the forwarder answers ARP for.

use crate::cmd::{Cmd, CmdKind, RpcCore, ack_rc};
use crate::hw::{Connection, Hw, HwItem, SharedItem, clone_cell, shared};
use crate::object_base::{ObjectBase, OmObject};
use crate::om::{Listener, Om, PopulateCtx, PopulateFuture};
use crate::singular_db::SingularDb;
use crate::types::{Dependency, RcCode};
use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tracing::warn;
use vs_api::{Reply, Request};

struct ArpLinks {
    hw: Hw,
    db: Arc<SingularDb<(Ipv4Addr, Ipv4Addr), ArpProxyConfig>>,
}

/// An ARP proxy address range, keyed by (low, high).
pub struct ArpProxyConfig {
    low: Ipv4Addr,
    high: Ipv4Addr,
    /// The configured/unconfigured cell.
    config: SharedItem<bool>,
    links: OnceLock<ArpLinks>,
}

impl ArpProxyConfig {
    /// Desired state proxying the inclusive range `low..=high`.
    pub fn new(low: Ipv4Addr, high: Ipv4Addr) -> ArpProxyConfig {
        ArpProxyConfig {
            low,
            high,
            config: shared(HwItem::new(true)),
            links: OnceLock::new(),
        }
    }

    pub fn range(&self) -> (Ipv4Addr, Ipv4Addr) {
        (self.low, self.high)
    }

    pub fn is_programmed(&self) -> bool {
        self.config.lock().is_ok()
    }

    /// Find the canonical config for a range.
    pub fn find(om: &Om, low: Ipv4Addr, high: Ipv4Addr) -> Option<Arc<ArpProxyConfig>> {
        om.db.arp_proxies.find(&(low, high))
    }

    fn cmd(&self, is_add: bool) -> Arc<ArpProxyCmd> {
        Arc::new(ArpProxyCmd {
            core: RpcCore::new(self.config.clone()),
            low: self.low,
            high: self.high,
            is_add,
        })
    }
}

impl std::fmt::Display for ArpProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "arp-proxy:[low:{} high:{} {}]",
            self.low,
            self.high,
            self.config.lock().clone()
        )
    }
}

impl ObjectBase for ArpProxyConfig {
    fn sweep(&self) {
        let Some(links) = self.links.get() else {
            return;
        };
        if self.config.lock().is_ok() {
            links.hw.enqueue(self.cmd(false));
        }
    }

    fn replay(&self) {
        let Some(links) = self.links.get() else {
            return;
        };
        if self.config.lock().rc().needs_replay() {
            links.hw.enqueue(self.cmd(true));
        }
    }
}

impl OmObject for ArpProxyConfig {
    const FAMILY: &'static str = "arp-proxy";

    fn singular(&self, om: &Om) -> Arc<ArpProxyConfig> {
        om.db.arp_proxies.find_or_add((self.low, self.high), || {
            let config = ArpProxyConfig {
                low: self.low,
                high: self.high,
                config: clone_cell(&self.config),
                links: OnceLock::new(),
            };
            let _ = config.links.set(ArpLinks {
                hw: om.hw().clone(),
                db: om.db.arp_proxies.clone(),
            });
            config
        })
    }

    fn update(&self, _desired: &Self) {
        let Some(links) = self.links.get() else {
            return;
        };
        if !self.config.lock().is_ok() {
            links.hw.enqueue(self.cmd(true));
        }
    }
}

impl Drop for ArpProxyConfig {
    fn drop(&mut self) {
        let Some(links) = self.links.get() else {
            return;
        };
        self.sweep();
        links.db.release(&(self.low, self.high));
    }
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

pub(crate) struct ArpProxyCmd {
    core: RpcCore<bool>,
    low: Ipv4Addr,
    high: Ipv4Addr,
    is_add: bool,
}

impl PartialEq for ArpProxyCmd {
    fn eq(&self, other: &Self) -> bool {
        self.low == other.low && self.high == other.high && self.is_add == other.is_add
    }
}

impl Cmd for ArpProxyCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Rpc
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        conn.send(
            ctx,
            Request::ProxyArpAddDel {
                low: self.low,
                high: self.high,
                is_add: self.is_add,
            },
        )
    }

    fn deliver(&self, reply: Reply) -> crate::cmd::Delivery {
        let rc = ack_rc(&reply);
        if self.is_add {
            self.core.complete(rc);
        } else {
            if !rc.is_success() {
                warn!(cmd = %self, "arp proxy unconfig rejected");
            }
            self.core.complete(RcCode::Noop);
        }
        crate::cmd::Delivery::Done
    }

    fn abort(&self) {
        self.core.complete(RcCode::Timeout);
    }

    fn completion(&self) -> watch::Receiver<bool> {
        self.core.subscribe()
    }

    fn rc(&self) -> RcCode {
        let rc = self.core.rc();
        if !self.is_add && rc == RcCode::Noop {
            RcCode::Ok
        } else {
            rc
        }
    }
}

impl std::fmt::Display for ArpProxyCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "arp-proxy-{}: low:{} high:{} {}",
            if self.is_add { "config" } else { "unconfig" },
            self.low,
            self.high,
            self.core.item.lock().clone()
        )
    }
}

// ---------------------------------------------------------------------------
// Event handler
// ---------------------------------------------------------------------------

pub(crate) struct EventHandler;

impl Listener for EventHandler {
    fn order(&self) -> Dependency {
        Dependency::Binding
    }

    fn handle_populate<'a>(
        &'a self,
        _ctx: &'a PopulateCtx<'a>,
        _client: &'a str,
    ) -> PopulateFuture<'a> {
        // the forwarder exposes no proxy-ARP dump; ranges are client-declared
        Box::pin(async {})
    }

    fn handle_replay(&self, om: &Om) {
        om.db.arp_proxies.replay();
    }

    fn show(&self, om: &Om, out: &mut String) {
        om.db.arp_proxies.dump(out);
    }

    fn tags(&self) -> &'static [&'static str] {
        &["arp-proxy", "arp"]
    }

    fn description(&self) -> &'static str {
        "ARP Proxy"
    }
}
