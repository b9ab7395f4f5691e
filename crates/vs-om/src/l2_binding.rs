//! L2 bindings: membership of an interface in a bridge domain.
//!
//! A binding holds strong references to its interface and bridge domain, so
//! neither can be destroyed (and swept) while the binding is live.  Teardown
//! order falls out of drop order: the unbind is enqueued before any delete
//! the referenced objects enqueue.

use crate::bridge_domain::BridgeDomain;
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

struct L2Links {
    hw: Hw,
    db: Arc<SingularDb<String, L2Binding>>,
}

/// An interface-to-bridge-domain binding, keyed by the interface name.
pub struct L2Binding {
    itf: Arc<Interface>,
    bd: Arc<BridgeDomain>,
    /// The do/don't-bind cell.
    binding: SharedItem<bool>,
    links: OnceLock<L2Links>,
}

impl L2Binding {
    /// Desired state binding `itf` into `bd`.
    pub fn new(itf: &Interface, bd: &BridgeDomain) -> L2Binding {
        L2Binding {
            itf: Arc::new(itf.detached_clone()),
            bd: Arc::new(bd.detached_clone()),
            binding: shared(HwItem::new(true)),
            links: OnceLock::new(),
        }
    }

    pub fn itf_name(&self) -> &str {
        self.itf.name()
    }

    pub fn bd_id(&self) -> u32 {
        self.bd.id()
    }

    /// True once the forwarder has acknowledged the binding.
    pub fn is_programmed(&self) -> bool {
        self.binding.lock().is_ok()
    }

    /// Find the canonical binding for an interface.
    pub fn find(om: &Om, itf_name: &str) -> Option<Arc<L2Binding>> {
        om.db.l2_bindings.find(&itf_name.to_owned())
    }

    fn bind_cmd(&self, enable: bool) -> Arc<BindCmd> {
        Arc::new(BindCmd {
            core: RpcCore::new(self.binding.clone()),
            itf_hdl: self.itf.handle_item().clone(),
            bd_id: self.bd.id_item().clone(),
            enable,
        })
    }
}

impl std::fmt::Display for L2Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "l2-binding:[{} bd:{} {}]",
            self.itf.name(),
            self.bd.id(),
            self.binding.lock().clone()
        )
    }
}

impl ObjectBase for L2Binding {
    fn sweep(&self) {
        let Some(links) = self.links.get() else {
            return;
        };
        if self.binding.lock().is_ok() {
            links.hw.enqueue(self.bind_cmd(false));
        }
    }

    fn replay(&self) {
        let Some(links) = self.links.get() else {
            return;
        };
        if self.binding.lock().rc().needs_replay() {
            links.hw.enqueue(self.bind_cmd(true));
        }
    }
}

impl OmObject for L2Binding {
    const FAMILY: &'static str = "l2-binding";

    fn singular(&self, om: &Om) -> Arc<L2Binding> {
        // resolve the referenced objects to their canonical instances first
        let itf = OmObject::singular(self.itf.as_ref(), om);
        let bd = OmObject::singular(self.bd.as_ref(), om);
        om.db
            .l2_bindings
            .find_or_add(self.itf.name().to_owned(), || {
                let binding = L2Binding {
                    itf,
                    bd,
                    binding: clone_cell(&self.binding),
                    links: OnceLock::new(),
                };
                let _ = binding.links.set(L2Links {
                    hw: om.hw().clone(),
                    db: om.db.l2_bindings.clone(),
                });
                binding
            })
    }

    fn update(&self, _desired: &Self) {
        let Some(links) = self.links.get() else {
            return;
        };
        if !self.binding.lock().is_ok() {
            links.hw.enqueue(self.bind_cmd(true));
        }
    }
}

impl Drop for L2Binding {
    fn drop(&mut self) {
        let Some(links) = self.links.get() else {
            return;
        };
        self.sweep();
        links.db.release(&self.itf.name().to_owned());
    }
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// Program (or unprogram) bridge membership; handles are read at issue
/// time, after the referenced creates have completed.
pub(crate) struct BindCmd {
    core: RpcCore<bool>,
    itf_hdl: SharedItem<Handle>,
    bd_id: SharedItem<u32>,
    enable: bool,
}

impl PartialEq for BindCmd {
    fn eq(&self, other: &Self) -> bool {
        let itf_eq = Arc::ptr_eq(&self.itf_hdl, &other.itf_hdl)
            || *self.itf_hdl.lock() == *other.itf_hdl.lock();
        let bd_eq =
            Arc::ptr_eq(&self.bd_id, &other.bd_id) || *self.bd_id.lock() == *other.bd_id.lock();
        self.enable == other.enable && itf_eq && bd_eq
    }
}

impl Cmd for BindCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Rpc
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        let sw_if_index = self.itf_hdl.lock().data().value();
        let bd_id = *self.bd_id.lock().data();
        conn.send(
            ctx,
            Request::L2InterfaceSetBridge {
                sw_if_index,
                bd_id,
                enable: self.enable,
            },
        )
    }

    fn deliver(&self, reply: Reply) -> crate::cmd::Delivery {
        let rc = ack_rc(&reply);
        if self.enable {
            self.core.complete(rc);
        } else {
            if !rc.is_success() {
                warn!(cmd = %self, "l2 unbind rejected");
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
        if !self.enable && rc == RcCode::Noop {
            RcCode::Ok
        } else {
            rc
        }
    }
}

impl std::fmt::Display for BindCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "l2-{}: itf:{} bd:{} {}",
            if self.enable { "bind" } else { "unbind" },
            self.itf_hdl.lock().data(),
            self.bd_id.lock().data(),
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
        // bindings are discovered from the bridge-domain dump's member list
        Box::pin(async {})
    }

    fn handle_replay(&self, om: &Om) {
        om.db.l2_bindings.replay();
    }

    fn show(&self, om: &Om, out: &mut String) {
        om.db.l2_bindings.dump(out);
    }

    fn tags(&self) -> &'static [&'static str] {
        &["l2", "l2-binding"]
    }

    fn description(&self) -> &'static str {
        "L2 Bindings"
    }
}
