//! LLDP bindings: per-interface LLDP configuration.

use crate::cmd::{Cmd, CmdKind, RpcCore, ack_rc};
use crate::hw::{Connection, Hw, HwItem, SharedItem, clone_cell, shared};
use crate::interface::Interface;
use crate::object_base::{ObjectBase, OmObject};
use crate::om::{Listener, Om, PopulateCtx, PopulateFuture};
use crate::singular_db::SingularDb;
use crate::types::{Dependency, Handle, RcCode};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tracing::warn;
use vs_api::{Reply, Request};

struct LldpLinks {
    hw: Hw,
    db: Arc<SingularDb<String, LldpBinding>>,
}

/// LLDP enabled on one interface, keyed by the interface name.  Holds the
/// interface so the binding cannot outlive it.
pub struct LldpBinding {
    itf: Arc<Interface>,
    /// The port description advertised on the interface.
    port_desc: String,
    binding: SharedItem<bool>,
    links: OnceLock<LldpLinks>,
}

impl LldpBinding {
    /// Desired state enabling LLDP on `itf`.
    pub fn new(itf: &Interface, port_desc: impl Into<String>) -> LldpBinding {
        LldpBinding {
            itf: Arc::new(itf.detached_clone()),
            port_desc: port_desc.into(),
            binding: shared(HwItem::new(true)),
            links: OnceLock::new(),
        }
    }

    pub fn itf_name(&self) -> &str {
        self.itf.name()
    }

    pub fn port_desc(&self) -> &str {
        &self.port_desc
    }

    pub fn is_programmed(&self) -> bool {
        self.binding.lock().is_ok()
    }

    /// Find the canonical binding for an interface.
    pub fn find(om: &Om, itf_name: &str) -> Option<Arc<LldpBinding>> {
        om.db.lldp_bindings.find(&itf_name.to_owned())
    }

    fn bind_cmd(&self) -> Arc<LldpBindCmd> {
        Arc::new(LldpBindCmd {
            core: RpcCore::new(self.binding.clone()),
            itf_hdl: self.itf.handle_item().clone(),
            port_desc: self.port_desc.clone(),
        })
    }

    fn unbind_cmd(&self) -> Arc<LldpUnbindCmd> {
        Arc::new(LldpUnbindCmd {
            core: RpcCore::new(self.binding.clone()),
            itf_hdl: self.itf.handle_item().clone(),
        })
    }
}

impl std::fmt::Display for LldpBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lldp-binding:[{} port-desc:{} {}]",
            self.itf.name(),
            self.port_desc,
            self.binding.lock().clone()
        )
    }
}

impl ObjectBase for LldpBinding {
    fn sweep(&self) {
        let Some(links) = self.links.get() else {
            return;
        };
        if self.binding.lock().is_ok() {
            links.hw.enqueue(self.unbind_cmd());
        }
    }

    fn replay(&self) {
        let Some(links) = self.links.get() else {
            return;
        };
        if self.binding.lock().rc().needs_replay() {
            links.hw.enqueue(self.bind_cmd());
        }
    }
}

impl OmObject for LldpBinding {
    const FAMILY: &'static str = "lldp-binding";

    fn singular(&self, om: &Om) -> Arc<LldpBinding> {
        let itf = OmObject::singular(self.itf.as_ref(), om);
        om.db
            .lldp_bindings
            .find_or_add(self.itf.name().to_owned(), || {
                let binding = LldpBinding {
                    itf,
                    port_desc: self.port_desc.clone(),
                    binding: clone_cell(&self.binding),
                    links: OnceLock::new(),
                };
                let _ = binding.links.set(LldpLinks {
                    hw: om.hw().clone(),
                    db: om.db.lldp_bindings.clone(),
                });
                binding
            })
    }

    fn update(&self, _desired: &Self) {
        let Some(links) = self.links.get() else {
            return;
        };
        if !self.binding.lock().is_ok() {
            links.hw.enqueue(self.bind_cmd());
        }
    }
}

impl Drop for LldpBinding {
    fn drop(&mut self) {
        let Some(links) = self.links.get() else {
            return;
        };
        self.sweep();
        links.db.release(&self.itf.name().to_owned());
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub(crate) struct LldpBindCmd {
    core: RpcCore<bool>,
    itf_hdl: SharedItem<Handle>,
    port_desc: String,
}

impl PartialEq for LldpBindCmd {
    fn eq(&self, other: &Self) -> bool {
        let itf_eq = Arc::ptr_eq(&self.itf_hdl, &other.itf_hdl)
            || *self.itf_hdl.lock() == *other.itf_hdl.lock();
        self.port_desc == other.port_desc && itf_eq
    }
}

impl Cmd for LldpBindCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Rpc
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        let sw_if_index = self.itf_hdl.lock().data().value();
        conn.send(
            ctx,
            Request::LldpBind {
                sw_if_index,
                port_desc: self.port_desc.clone(),
            },
        )
    }

    fn deliver(&self, reply: Reply) -> crate::cmd::Delivery {
        self.core.complete(ack_rc(&reply));
        crate::cmd::Delivery::Done
    }

    fn abort(&self) {
        self.core.complete(RcCode::Timeout);
    }

    fn completion(&self) -> watch::Receiver<bool> {
        self.core.subscribe()
    }

    fn rc(&self) -> RcCode {
        self.core.rc()
    }
}

impl std::fmt::Display for LldpBindCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lldp-bind: itf:{} port-desc:{} {}",
            self.itf_hdl.lock().data(),
            self.port_desc,
            self.core.item.lock().clone()
        )
    }
}

pub(crate) struct LldpUnbindCmd {
    core: RpcCore<bool>,
    itf_hdl: SharedItem<Handle>,
}

impl Cmd for LldpUnbindCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Rpc
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        let sw_if_index = self.itf_hdl.lock().data().value();
        conn.send(ctx, Request::LldpUnbind { sw_if_index })
    }

    fn deliver(&self, reply: Reply) -> crate::cmd::Delivery {
        let rc = ack_rc(&reply);
        if !rc.is_success() {
            warn!(cmd = %self, "lldp unbind rejected");
        }
        self.core.complete(RcCode::Noop);
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
        if rc == RcCode::Noop { RcCode::Ok } else { rc }
    }
}

impl std::fmt::Display for LldpUnbindCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lldp-unbind: itf:{} {}",
            self.itf_hdl.lock().data(),
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
        // the forwarder exposes no LLDP dump; bindings are client-declared
        Box::pin(async {})
    }

    fn handle_replay(&self, om: &Om) {
        om.db.lldp_bindings.replay();
    }

    fn show(&self, om: &Om, out: &mut String) {
        om.db.lldp_bindings.dump(out);
    }

    fn tags(&self) -> &'static [&'static str] {
        &["lldp"]
    }

    fn description(&self) -> &'static str {
        "LLDP Bindings"
    }
}
