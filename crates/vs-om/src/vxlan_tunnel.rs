//! VXLAN tunnels.
//!
//! A tunnel is an interface keyed by its endpoint triple; it is interned in
//! the endpoint DB and published into the interface name DB under a
//! synthesized name, so both identities resolve to the one canonical
//! instance.

use crate::cmd::{Cmd, CmdKind, DumpCore, RpcCore, ack_rc};
use crate::hw::{Connection, SharedItem};
use crate::interface::{AdminState, Detail, Interface, ItfDirectory, Type};
use crate::om::{Listener, Om, PopulateCtx, PopulateFuture};
use crate::types::{Dependency, Handle, RcCode};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};
use vs_api::{Reply, Request};

const VXLAN_TUNNEL_NAME: &str = "vxlan-tunnel-itf";

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// The unique key of a VXLAN tunnel.  Ordering is lexicographic over
/// (src, dst, vni).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub vni: u32,
}

impl Endpoint {
    pub fn new(src: IpAddr, dst: IpAddr, vni: u32) -> Endpoint {
        Endpoint { src, dst, vni }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ep:[src:{} dst:{} vni:{}]", self.src, self.dst, self.vni)
    }
}

/// The interface name a tunnel is published under.
pub fn mk_name(ep: &Endpoint) -> String {
    format!("{VXLAN_TUNNEL_NAME}-{}-{}:{}", ep.src, ep.dst, ep.vni)
}

impl Interface {
    /// Desired state for a VXLAN tunnel.
    pub fn new_vxlan_tunnel(src: IpAddr, dst: IpAddr, vni: u32) -> Interface {
        let endpoint = Endpoint::new(src, dst, vni);
        Interface::with_detail(
            mk_name(&endpoint),
            Type::Vxlan,
            Detail::Vxlan { endpoint },
            AdminState::Up,
        )
    }

    /// A tunnel read out of the forwarder.
    pub(crate) fn discovered_vxlan(hdl: Handle, src: IpAddr, dst: IpAddr, vni: u32) -> Interface {
        let endpoint = Endpoint::new(src, dst, vni);
        Interface::discovered_with_detail(
            hdl,
            &mk_name(&endpoint),
            Type::Vxlan,
            Detail::Vxlan { endpoint },
            AdminState::Up,
        )
    }

    /// Find the canonical tunnel by endpoint.
    pub fn find_vxlan(om: &Om, endpoint: &Endpoint) -> Option<Arc<Interface>> {
        om.db.vxlan_tunnels.find(endpoint)
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub(crate) struct VxlanCreateCmd {
    core: RpcCore<Handle>,
    name: String,
    endpoint: Endpoint,
    directory: ItfDirectory,
}

impl VxlanCreateCmd {
    pub(crate) fn new(
        item: SharedItem<Handle>,
        name: String,
        endpoint: Endpoint,
        directory: ItfDirectory,
    ) -> Self {
        VxlanCreateCmd {
            core: RpcCore::new(item),
            name,
            endpoint,
            directory,
        }
    }
}

impl PartialEq for VxlanCreateCmd {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
    }
}

impl Cmd for VxlanCreateCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Rpc
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        conn.send(
            ctx,
            Request::VxlanTunnelAddDel {
                is_add: true,
                src: self.endpoint.src,
                dst: self.endpoint.dst,
                vni: self.endpoint.vni,
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
                warn!(cmd = %self, reply = ?other, "vxlan tunnel create rejected");
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

impl std::fmt::Display for VxlanCreateCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "vxlan-tunnel-create: {} {}",
            self.core.item.lock().clone(),
            self.endpoint
        )
    }
}

pub(crate) struct VxlanDeleteCmd {
    core: RpcCore<Handle>,
    endpoint: Endpoint,
    directory: ItfDirectory,
}

impl VxlanDeleteCmd {
    pub(crate) fn new(
        item: SharedItem<Handle>,
        endpoint: Endpoint,
        directory: ItfDirectory,
    ) -> Self {
        VxlanDeleteCmd {
            core: RpcCore::new(item),
            endpoint,
            directory,
        }
    }
}

impl PartialEq for VxlanDeleteCmd {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
    }
}

impl Cmd for VxlanDeleteCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Rpc
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        conn.send(
            ctx,
            Request::VxlanTunnelAddDel {
                is_add: false,
                src: self.endpoint.src,
                dst: self.endpoint.dst,
                vni: self.endpoint.vni,
            },
        )
    }

    fn deliver(&self, reply: Reply) -> crate::cmd::Delivery {
        let rc = ack_rc(&reply);
        if !rc.is_success() {
            warn!(cmd = %self, "vxlan tunnel delete rejected");
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

impl std::fmt::Display for VxlanDeleteCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "vxlan-tunnel-delete: {} {}",
            self.core.item.lock().clone(),
            self.endpoint
        )
    }
}

pub(crate) struct VxlanDumpCmd {
    core: DumpCore,
}

impl VxlanDumpCmd {
    pub fn new() -> Arc<Self> {
        Arc::new(VxlanDumpCmd {
            core: DumpCore::new(),
        })
    }

    pub fn take_records(&self) -> Vec<Reply> {
        self.core.take_records()
    }
}

impl Cmd for VxlanDumpCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Dump
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        self.core.issue(conn, ctx, Request::VxlanTunnelDump)
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

impl std::fmt::Display for VxlanDumpCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("vxlan-tunnel-dump")
    }
}

// ---------------------------------------------------------------------------
// Event handler
// ---------------------------------------------------------------------------

pub(crate) struct EventHandler;

impl Listener for EventHandler {
    fn order(&self) -> Dependency {
        Dependency::Tunnel
    }

    fn handle_populate<'a>(
        &'a self,
        ctx: &'a PopulateCtx<'a>,
        client: &'a str,
    ) -> PopulateFuture<'a> {
        Box::pin(async move {
            let dump = VxlanDumpCmd::new();
            ctx.hw().enqueue(dump.clone());
            ctx.hw().write().await;

            for record in dump.take_records() {
                let Reply::VxlanTunnelDetails {
                    sw_if_index,
                    src,
                    dst,
                    vni,
                } = record
                else {
                    continue;
                };
                let tunnel = Interface::discovered_vxlan(Handle(sw_if_index), src, dst, vni);
                ctx.om()
                    .db
                    .itf_directory
                    .insert(Handle(sw_if_index), tunnel.name());
                debug!(tunnel = %tunnel, "dump");
                ctx.commit(client, &tunnel).await;
            }
        })
    }

    fn handle_replay(&self, _om: &Om) {
        // tunnels replay from the interface name DB
    }

    fn show(&self, om: &Om, out: &mut String) {
        om.db.vxlan_tunnels.dump(out);
    }

    fn tags(&self) -> &'static [&'static str] {
        &["vxlan"]
    }

    fn description(&self) -> &'static str {
        "VXLAN Tunnels"
    }
}
