//! TAP interfaces: a kernel-visible interface with an optional IP prefix
//! and hardware address.

use crate::cmd::{Cmd, CmdKind, RpcCore, ack_rc};
use crate::hw::{Connection, SharedItem};
use crate::interface::{AdminState, Detail, Interface, ItfDirectory, Type};
use crate::types::{Handle, RcCode};
use tokio::sync::watch;
use tracing::warn;
use vs_api::{MacAddr, Prefix, Reply, Request};

impl Interface {
    /// Desired state for a TAP interface.
    pub fn new_tap(
        name: impl Into<String>,
        state: AdminState,
        prefix: Option<Prefix>,
        mac: Option<MacAddr>,
    ) -> Interface {
        Interface::with_detail(name.into(), Type::Tap, Detail::Tap { prefix, mac }, state)
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub(crate) struct TapCreateCmd {
    core: RpcCore<Handle>,
    name: String,
    prefix: Option<Prefix>,
    mac: Option<MacAddr>,
    directory: ItfDirectory,
}

impl TapCreateCmd {
    pub(crate) fn new(
        item: SharedItem<Handle>,
        name: String,
        prefix: Option<Prefix>,
        mac: Option<MacAddr>,
        directory: ItfDirectory,
    ) -> Self {
        TapCreateCmd {
            core: RpcCore::new(item),
            name,
            prefix,
            mac,
            directory,
        }
    }
}

impl PartialEq for TapCreateCmd {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.prefix == other.prefix && self.mac == other.mac
    }
}

impl Cmd for TapCreateCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Rpc
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        conn.send(
            ctx,
            Request::TapCreate {
                name: self.name.clone(),
                prefix: self.prefix,
                mac: self.mac,
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
                warn!(cmd = %self, reply = ?other, "tap create rejected");
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

impl std::fmt::Display for TapCreateCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tap-itf-create: {} {}", self.name, self.core.item.lock().clone())?;
        if let Some(prefix) = &self.prefix {
            write!(f, " ip-prefix:{prefix}")?;
        }
        if let Some(mac) = &self.mac {
            write!(f, " mac:{mac}")?;
        }
        Ok(())
    }
}

pub(crate) struct TapDeleteCmd {
    core: RpcCore<Handle>,
    directory: ItfDirectory,
}

impl TapDeleteCmd {
    pub(crate) fn new(item: SharedItem<Handle>, directory: ItfDirectory) -> Self {
        TapDeleteCmd {
            core: RpcCore::new(item),
            directory,
        }
    }
}

impl Cmd for TapDeleteCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Rpc
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        let sw_if_index = self.core.item.lock().data().value();
        conn.send(ctx, Request::TapDelete { sw_if_index })
    }

    fn deliver(&self, reply: Reply) -> crate::cmd::Delivery {
        let rc = ack_rc(&reply);
        if !rc.is_success() {
            warn!(cmd = %self, "tap delete rejected");
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

impl std::fmt::Display for TapDeleteCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tap-itf-delete: {}", self.core.item.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_template_carries_prefix_and_mac() {
        let tap = Interface::new_tap(
            "tap0",
            AdminState::Up,
            Some(Prefix {
                addr: "10.1.1.1".parse().unwrap(),
                len: 24,
            }),
            Some(MacAddr([2, 0, 0, 0, 0, 1])),
        );
        assert_eq!(tap.kind(), Type::Tap);
        assert_eq!(tap.name(), "tap0");
        assert!(!tap.is_programmed());
    }
}
