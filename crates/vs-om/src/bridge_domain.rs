//! Bridge domains: L2 forwarding domains keyed by their client-assigned id.

use crate::cmd::{Cmd, CmdKind, DumpCore, RpcCore, ack_rc};
use crate::hw::{Connection, Hw, HwItem, SharedItem, clone_cell, shared};
use crate::interface::Interface;
use crate::l2_binding::L2Binding;
use crate::object_base::{ObjectBase, OmObject};
use crate::om::{Listener, Om, PopulateCtx, PopulateFuture};
use crate::singular_db::SingularDb;
use crate::types::{Dependency, Handle, RcCode};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tracing::{debug, warn};
use vs_api::{Reply, Request};

struct BdLinks {
    hw: Hw,
    db: Arc<SingularDb<u32, BridgeDomain>>,
}

/// A bridge domain in the forwarder.
pub struct BridgeDomain {
    /// The id we assign and the forwarder's result for it.
    id: SharedItem<u32>,
    links: OnceLock<BdLinks>,
}

impl BridgeDomain {
    /// Desired state for a bridge domain.
    pub fn new(id: u32) -> BridgeDomain {
        BridgeDomain {
            id: shared(HwItem::new(id)),
            links: OnceLock::new(),
        }
    }

    pub fn id(&self) -> u32 {
        *self.id.lock().data()
    }

    /// True once the forwarder has acknowledged the domain.
    pub fn is_programmed(&self) -> bool {
        self.id.lock().is_ok()
    }

    pub(crate) fn id_item(&self) -> &SharedItem<u32> {
        &self.id
    }

    /// Find the canonical bridge domain by id.
    pub fn find(om: &Om, id: u32) -> Option<Arc<BridgeDomain>> {
        om.db.bridge_domains.find(&id)
    }

    /// Dump every live bridge domain into the stream provided.
    pub fn dump(om: &Om, out: &mut String) {
        om.db.bridge_domains.dump(out);
    }

    pub(crate) fn detached_clone(&self) -> BridgeDomain {
        BridgeDomain {
            id: clone_cell(&self.id),
            links: OnceLock::new(),
        }
    }

    fn interned(&self, om: &Om) -> BridgeDomain {
        let bd = self.detached_clone();
        let _ = bd.links.set(BdLinks {
            hw: om.hw().clone(),
            db: om.db.bridge_domains.clone(),
        });
        bd
    }
}

impl std::fmt::Display for BridgeDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bridge-domain:[{}]", self.id.lock().clone())
    }
}

impl ObjectBase for BridgeDomain {
    fn sweep(&self) {
        let Some(links) = self.links.get() else {
            return;
        };
        if self.id.lock().is_ok() {
            links.hw.enqueue(Arc::new(BdDeleteCmd {
                core: RpcCore::new(self.id.clone()),
            }));
        }
    }

    fn replay(&self) {
        let Some(links) = self.links.get() else {
            return;
        };
        if self.id.lock().rc().needs_replay() {
            links.hw.enqueue(Arc::new(BdCreateCmd {
                core: RpcCore::new(self.id.clone()),
            }));
        }
    }
}

impl OmObject for BridgeDomain {
    const FAMILY: &'static str = "bridge-domain";

    fn singular(&self, om: &Om) -> Arc<BridgeDomain> {
        om.db.bridge_domains.find_or_add(self.id(), || self.interned(om))
    }

    fn update(&self, _desired: &Self) {
        let Some(links) = self.links.get() else {
            return;
        };
        // the desired state is always that the domain exists
        if !self.id.lock().is_ok() {
            links.hw.enqueue(Arc::new(BdCreateCmd {
                core: RpcCore::new(self.id.clone()),
            }));
        }
    }
}

impl Drop for BridgeDomain {
    fn drop(&mut self) {
        let Some(links) = self.links.get() else {
            return;
        };
        self.sweep();
        links.db.release(&self.id());
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub(crate) struct BdCreateCmd {
    core: RpcCore<u32>,
}

impl PartialEq for BdCreateCmd {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core.item, &other.core.item)
            || *self.core.item.lock() == *other.core.item.lock()
    }
}

impl Cmd for BdCreateCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Rpc
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        let bd_id = *self.core.item.lock().data();
        conn.send(ctx, Request::BridgeDomainAddDel { bd_id, is_add: true })
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

impl std::fmt::Display for BdCreateCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bridge-domain-create: {}", self.core.item.lock().clone())
    }
}

pub(crate) struct BdDeleteCmd {
    core: RpcCore<u32>,
}

impl Cmd for BdDeleteCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Rpc
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        let bd_id = *self.core.item.lock().data();
        conn.send(ctx, Request::BridgeDomainAddDel { bd_id, is_add: false })
    }

    fn deliver(&self, reply: Reply) -> crate::cmd::Delivery {
        let rc = ack_rc(&reply);
        if !rc.is_success() {
            warn!(cmd = %self, "bridge domain delete rejected");
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

impl std::fmt::Display for BdDeleteCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bridge-domain-delete: {}", self.core.item.lock().clone())
    }
}

pub(crate) struct BdDumpCmd {
    core: DumpCore,
}

impl BdDumpCmd {
    pub fn new() -> Arc<Self> {
        Arc::new(BdDumpCmd {
            core: DumpCore::new(),
        })
    }

    pub fn take_records(&self) -> Vec<Reply> {
        self.core.take_records()
    }
}

impl Cmd for BdDumpCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Dump
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        self.core.issue(conn, ctx, Request::BridgeDomainDump)
    }

    fn deliver(&self, reply: Reply) -> crate::cmd::Delivery {
        self.core.deliver(reply)
    }

    fn abort(&self) {
        self.core.finish(RcCode::Timeout);
    }

    fn completion(&self) -> watch::Receiver<bool> {
        self.core.subscribe()
    }

    fn rc(&self) -> RcCode {
        self.core.rc()
    }
}

impl std::fmt::Display for BdDumpCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("bridge-domain-dump")
    }
}

// ---------------------------------------------------------------------------
// Event handler
// ---------------------------------------------------------------------------

pub(crate) struct EventHandler;

impl Listener for EventHandler {
    fn order(&self) -> Dependency {
        Dependency::ForwardingDomain
    }

    fn handle_populate<'a>(
        &'a self,
        ctx: &'a PopulateCtx<'a>,
        client: &'a str,
    ) -> PopulateFuture<'a> {
        Box::pin(async move {
            let dump = BdDumpCmd::new();
            ctx.hw().enqueue(dump.clone());
            ctx.hw().write().await;

            for record in dump.take_records() {
                let Reply::BridgeDomainDetails { bd_id, members } = record else {
                    continue;
                };
                let bd = BridgeDomain::new(bd_id);
                debug!(bd = %bd, "dump");
                ctx.commit(client, &bd).await;

                // each member interface becomes an l2 binding; the
                // interfaces were populated at a lower dependency level
                for sw_if_index in members {
                    match Interface::find_by_handle(ctx.om(), Handle(sw_if_index)) {
                        Some(itf) => {
                            let l2 = L2Binding::new(&itf, &bd);
                            ctx.commit(client, &l2).await;
                        }
                        None => warn!(
                            bd_id,
                            sw_if_index, "bridge domain member is not a known interface"
                        ),
                    }
                }
            }
        })
    }

    fn handle_replay(&self, om: &Om) {
        om.db.bridge_domains.replay();
    }

    fn show(&self, om: &Om, out: &mut String) {
        om.db.bridge_domains.dump(out);
    }

    fn tags(&self) -> &'static [&'static str] {
        &["bd", "bridge"]
    }

    fn description(&self) -> &'static str {
        "Bridge Domains"
    }
}
