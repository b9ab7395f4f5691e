//! VLAN sub-interfaces.
//!
//! A sub-interface is an interface whose create carries the parent's
//! forwarder index and a VLAN tag; the name is synthesized as
//! `<parent>.<vlan>` so parents sort (and therefore replay) before their
//! children.

use crate::cmd::{Cmd, CmdKind, RpcCore, ack_rc};
use crate::hw::{Connection, SharedItem};
use crate::interface::{AdminState, Detail, Interface, ItfDirectory};
use crate::types::{Handle, RcCode};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;
use vs_api::{Reply, Request};

impl Interface {
    /// Desired state for a VLAN sub-interface of `parent`.
    pub fn new_vlan(parent: &Interface, state: AdminState, vlan_id: u16) -> Interface {
        let name = format!("{}.{vlan_id}", parent.name());
        Interface::with_detail(
            name,
            parent.kind(),
            Detail::Vlan {
                parent: Arc::new(parent.detached_clone()),
                vlan_id,
            },
            state,
        )
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub(crate) struct SubIfCreateCmd {
    core: RpcCore<Handle>,
    name: String,
    /// The parent's handle cell; read at issue time, after the parent's
    /// own create has completed.
    parent_hdl: SharedItem<Handle>,
    vlan_id: u16,
    directory: ItfDirectory,
}

impl SubIfCreateCmd {
    pub(crate) fn new(
        item: SharedItem<Handle>,
        name: String,
        parent_hdl: SharedItem<Handle>,
        vlan_id: u16,
        directory: ItfDirectory,
    ) -> Self {
        SubIfCreateCmd {
            core: RpcCore::new(item),
            name,
            parent_hdl,
            vlan_id,
            directory,
        }
    }
}

impl PartialEq for SubIfCreateCmd {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.vlan_id == other.vlan_id
    }
}

impl Cmd for SubIfCreateCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Rpc
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        let parent_sw_if_index = self.parent_hdl.lock().data().value();
        conn.send(
            ctx,
            Request::VlanSubifCreate {
                parent_sw_if_index,
                vlan_id: self.vlan_id,
            },
        )
    }

    fn deliver(&self, reply: Reply) -> crate::cmd::Delivery {
        match reply {
            Reply::Created { retval, sw_if_index } if retval == 0 => {
                self.directory.insert(Handle(sw_if_index), &self.name);
                self.core.complete_with(RcCode::Ok, |item| {
                    item.set_data(Handle(sw_if_index));
                });
            }
            other => {
                warn!(cmd = %self, reply = ?other, "sub-interface create rejected");
                self.core.complete(RcCode::Invalid);
            }
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
        self.core.rc()
    }
}

impl std::fmt::Display for SubIfCreateCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sub-itf-create: {} parent:{} vlan:{} {}",
            self.name,
            self.parent_hdl.lock().data(),
            self.vlan_id,
            self.core.item.lock().clone()
        )
    }
}

/// Delete awaits the forwarder's reply before the model treats the
/// sub-interface as gone; only then is its directory entry cleared.
pub(crate) struct SubIfDeleteCmd {
    core: RpcCore<Handle>,
    directory: ItfDirectory,
}

impl SubIfDeleteCmd {
    pub(crate) fn new(item: SharedItem<Handle>, directory: ItfDirectory) -> Self {
        SubIfDeleteCmd {
            core: RpcCore::new(item),
            directory,
        }
    }
}

impl Cmd for SubIfDeleteCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Rpc
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        let sw_if_index = self.core.item.lock().data().value();
        conn.send(ctx, Request::VlanSubifDelete { sw_if_index })
    }

    fn deliver(&self, reply: Reply) -> crate::cmd::Delivery {
        let rc = ack_rc(&reply);
        if !rc.is_success() {
            warn!(cmd = %self, "sub-interface delete rejected");
        }
        self.directory.remove(*self.core.item.lock().data());
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

impl std::fmt::Display for SubIfDeleteCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-itf-delete: {}", self.core.item.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::Type;

    #[test]
    fn vlan_name_sorts_after_parent() {
        let parent = Interface::new("eth0", Type::Ethernet, AdminState::Up);
        let sub = Interface::new_vlan(&parent, AdminState::Up, 100);
        assert_eq!(sub.name(), "eth0.100");
        assert_eq!(sub.kind(), Type::Ethernet);
        // replay iterates the name DB in order; the parent must come first
        assert!(parent.name() < sub.name());
    }
}
