//! Interfaces: the base family for ports, taps, VLAN sub-interfaces and
//! VXLAN tunnels.
//!
//! Every interface is keyed by name in one singular DB; tunnels are
//! additionally reachable by endpoint (see `vxlan_tunnel`).  A handle
//! directory maps forwarder-assigned indices back to names so dump records
//! referencing member interfaces can be resolved.

use crate::cmd::{ack_rc, Cmd, CmdKind, DumpCore, EventCore, RpcCore};
use crate::hw::{clone_cell, shared, Connection, Hw, HwItem, SharedItem};
use crate::object_base::{ObjectBase, OmObject};
use crate::om::{Listener, Om, PopulateCtx, PopulateFuture};
use crate::singular_db::SingularDb;
use crate::types::{Dependency, Handle, RcCode};
use crate::vxlan_tunnel::Endpoint;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use vs_api::{MacAddr, Prefix, Reply, Request};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The role of an interface, recovered from its name on dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Unknown,
    Bvi,
    Ethernet,
    Vxlan,
    AfPacket,
    Loopback,
    Local,
    Tap,
}

impl Type {
    /// Classify a forwarder interface name.
    pub fn from_name(name: &str) -> Type {
        if name.contains("Ethernet") {
            Type::Ethernet
        } else if name.contains("vxlan") {
            Type::Vxlan
        } else if name.contains("loop") {
            Type::Loopback
        } else if name.contains("host-") {
            Type::AfPacket
        } else if name.contains("local") {
            Type::Local
        } else if name.contains("tap") {
            Type::Tap
        } else if name.contains("bvi") {
            Type::Bvi
        } else {
            Type::Unknown
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Type::Unknown => "unknown",
            Type::Bvi => "bvi",
            Type::Ethernet => "ethernet",
            Type::Vxlan => "vxlan",
            Type::AfPacket => "af-packet",
            Type::Loopback => "loopback",
            Type::Local => "local",
            Type::Tap => "tap",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminState {
    Down,
    Up,
}

impl AdminState {
    pub fn from_admin_up(up: bool) -> AdminState {
        if up { AdminState::Up } else { AdminState::Down }
    }

    pub fn is_up(self) -> bool {
        self == AdminState::Up
    }
}

impl std::fmt::Display for AdminState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AdminState::Down => "down",
            AdminState::Up => "up",
        })
    }
}

// ---------------------------------------------------------------------------
// Handle directory
// ---------------------------------------------------------------------------

/// Forwarder index -> interface name.  Maintained by create/delete command
/// completions and by populate, consulted when dump records reference
/// member interfaces by index.
#[derive(Clone, Default)]
pub(crate) struct ItfDirectory {
    map: Arc<Mutex<BTreeMap<Handle, String>>>,
}

impl ItfDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, hdl: Handle, name: &str) {
        self.map.lock().insert(hdl, name.to_owned());
    }

    pub fn remove(&self, hdl: Handle) {
        self.map.lock().remove(&hdl);
    }

    pub fn name_of(&self, hdl: Handle) -> Option<String> {
        self.map.lock().get(&hdl).cloned()
    }
}

// ---------------------------------------------------------------------------
// Interface
// ---------------------------------------------------------------------------

/// Creation parameters that vary by interface role.
pub(crate) enum Detail {
    Plain,
    /// VLAN sub-interface; the canonical instance holds the canonical
    /// parent so the parent outlives its sub-interfaces.
    Vlan { parent: Arc<Interface>, vlan_id: u16 },
    Tap {
        prefix: Option<Prefix>,
        mac: Option<MacAddr>,
    },
    Vxlan { endpoint: Endpoint },
}

impl Detail {
    fn detached_clone(&self) -> Detail {
        match self {
            Detail::Plain => Detail::Plain,
            Detail::Vlan { parent, vlan_id } => Detail::Vlan {
                parent: Arc::new(parent.detached_clone()),
                vlan_id: *vlan_id,
            },
            Detail::Tap { prefix, mac } => Detail::Tap {
                prefix: *prefix,
                mac: *mac,
            },
            Detail::Vxlan { endpoint } => Detail::Vxlan {
                endpoint: endpoint.clone(),
            },
        }
    }
}

/// Links installed when an instance is interned; templates carry none, so
/// template drops are inert while canonical drops sweep and release.
pub(crate) struct ItfLinks {
    hw: Hw,
    by_name: Arc<SingularDb<String, Interface>>,
    by_endpoint: Option<Arc<SingularDb<Endpoint, Interface>>>,
    directory: ItfDirectory,
}

/// A software interface on the forwarder.
pub struct Interface {
    name: String,
    kind: Type,
    detail: Detail,
    state: SharedItem<AdminState>,
    hdl: SharedItem<Handle>,
    links: OnceLock<ItfLinks>,
}

impl Interface {
    /// Desired state for a plain interface.
    pub fn new(name: impl Into<String>, kind: Type, state: AdminState) -> Interface {
        Self::with_detail(name.into(), kind, Detail::Plain, state)
    }

    pub(crate) fn with_detail(
        name: String,
        kind: Type,
        detail: Detail,
        state: AdminState,
    ) -> Interface {
        Interface {
            name,
            kind,
            detail,
            state: shared(HwItem::new(state)),
            hdl: shared(HwItem::new(Handle::INVALID)),
            links: OnceLock::new(),
        }
    }

    /// An interface read out of the forwarder: handle known, state already
    /// programmed, so committing it enqueues nothing.
    pub(crate) fn discovered(hdl: Handle, name: &str, kind: Type, state: AdminState) -> Interface {
        Self::discovered_with_detail(hdl, name, kind, Detail::Plain, state)
    }

    pub(crate) fn discovered_with_detail(
        hdl: Handle,
        name: &str,
        kind: Type,
        detail: Detail,
        state: AdminState,
    ) -> Interface {
        Interface {
            name: name.to_owned(),
            kind,
            detail,
            state: shared(HwItem::with_rc(state, RcCode::Ok)),
            hdl: shared(HwItem::with_rc(hdl, RcCode::Ok)),
            links: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> Type {
        self.kind
    }

    pub fn handle(&self) -> Handle {
        *self.hdl.lock().data()
    }

    /// True once the forwarder has acknowledged the interface.
    pub fn is_programmed(&self) -> bool {
        self.hdl.lock().is_ok()
    }

    pub fn admin_state(&self) -> AdminState {
        *self.state.lock().data()
    }

    pub(crate) fn handle_item(&self) -> &SharedItem<Handle> {
        &self.hdl
    }

    pub(crate) fn endpoint(&self) -> Option<&Endpoint> {
        match &self.detail {
            Detail::Vxlan { endpoint } => Some(endpoint),
            _ => None,
        }
    }

    /// Find the canonical interface by name.
    pub fn find(om: &Om, name: &str) -> Option<Arc<Interface>> {
        om.db.interfaces.find(&name.to_owned())
    }

    /// Find the canonical interface by forwarder index.
    pub fn find_by_handle(om: &Om, hdl: Handle) -> Option<Arc<Interface>> {
        let name = om.db.itf_directory.name_of(hdl)?;
        om.db.interfaces.find(&name)
    }

    /// Dump every live interface into the stream provided.
    pub fn dump(om: &Om, out: &mut String) {
        om.db.interfaces.dump(out);
    }

    /// Deep copy with fresh item cells and no links; what interning stores
    /// and what bindings keep as their template reference.
    pub(crate) fn detached_clone(&self) -> Interface {
        Interface {
            name: self.name.clone(),
            kind: self.kind,
            detail: self.detail.detached_clone(),
            state: clone_cell(&self.state),
            hdl: clone_cell(&self.hdl),
            links: OnceLock::new(),
        }
    }

    fn interned(&self, om: &Om) -> Interface {
        let detail = match &self.detail {
            Detail::Vlan { parent, vlan_id } => Detail::Vlan {
                parent: OmObject::singular(parent.as_ref(), om),
                vlan_id: *vlan_id,
            },
            other => other.detached_clone(),
        };
        let itf = Interface {
            name: self.name.clone(),
            kind: self.kind,
            detail,
            state: clone_cell(&self.state),
            hdl: clone_cell(&self.hdl),
            links: OnceLock::new(),
        };
        let _ = itf.links.set(ItfLinks {
            hw: om.hw().clone(),
            by_name: om.db.interfaces.clone(),
            by_endpoint: self.endpoint().map(|_| om.db.vxlan_tunnels.clone()),
            directory: om.db.itf_directory.clone(),
        });
        itf
    }

    fn mk_create_cmd(&self, links: &ItfLinks) -> Arc<dyn Cmd> {
        match &self.detail {
            Detail::Plain => Arc::new(ItfCreateCmd {
                core: RpcCore::new(self.hdl.clone()),
                name: self.name.clone(),
                kind: self.kind,
                directory: links.directory.clone(),
            }),
            Detail::Vlan { parent, vlan_id } => {
                Arc::new(crate::sub_interface::SubIfCreateCmd::new(
                    self.hdl.clone(),
                    self.name.clone(),
                    parent.handle_item().clone(),
                    *vlan_id,
                    links.directory.clone(),
                ))
            }
            Detail::Tap { prefix, mac } => Arc::new(crate::tap_interface::TapCreateCmd::new(
                self.hdl.clone(),
                self.name.clone(),
                *prefix,
                *mac,
                links.directory.clone(),
            )),
            Detail::Vxlan { endpoint } => Arc::new(crate::vxlan_tunnel::VxlanCreateCmd::new(
                self.hdl.clone(),
                self.name.clone(),
                endpoint.clone(),
                links.directory.clone(),
            )),
        }
    }

    fn mk_delete_cmd(&self, links: &ItfLinks) -> Arc<dyn Cmd> {
        match &self.detail {
            Detail::Plain => Arc::new(ItfDeleteCmd {
                core: RpcCore::new(self.hdl.clone()),
                directory: links.directory.clone(),
            }),
            Detail::Vlan { .. } => Arc::new(crate::sub_interface::SubIfDeleteCmd::new(
                self.hdl.clone(),
                links.directory.clone(),
            )),
            Detail::Tap { .. } => Arc::new(crate::tap_interface::TapDeleteCmd::new(
                self.hdl.clone(),
                links.directory.clone(),
            )),
            Detail::Vxlan { endpoint } => Arc::new(crate::vxlan_tunnel::VxlanDeleteCmd::new(
                self.hdl.clone(),
                endpoint.clone(),
                links.directory.clone(),
            )),
        }
    }
}

impl std::fmt::Display for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "interface:[{} type:{} {} admin:{}]",
            self.name,
            self.kind,
            self.hdl.lock().clone(),
            self.state.lock().data()
        )
    }
}

impl ObjectBase for Interface {
    fn sweep(&self) {
        let Some(links) = self.links.get() else {
            return;
        };
        if self.hdl.lock().is_ok() {
            links.hw.enqueue(self.mk_delete_cmd(links));
        }
    }

    fn replay(&self) {
        let Some(links) = self.links.get() else {
            return;
        };
        if self.hdl.lock().rc().needs_replay() {
            links.hw.enqueue(self.mk_create_cmd(links));
        }
        if self.state.lock().rc().needs_replay() {
            links.hw.enqueue(Arc::new(SetFlagsCmd {
                core: RpcCore::new(self.state.clone()),
                hdl: self.hdl.clone(),
            }));
        }
    }
}

impl OmObject for Interface {
    const FAMILY: &'static str = "interface";

    fn singular(&self, om: &Om) -> Arc<Interface> {
        match self.endpoint() {
            Some(endpoint) => {
                // a tunnel lives in the endpoint DB and is published under
                // its synthesized name as well
                let sp = om
                    .db
                    .vxlan_tunnels
                    .find_or_add(endpoint.clone(), || self.interned(om));
                om.db.interfaces.add(self.name.clone(), &sp);
                sp
            }
            None => om
                .db
                .interfaces
                .find_or_add(self.name.clone(), || self.interned(om)),
        }
    }

    fn update(&self, desired: &Self) {
        let Some(links) = self.links.get() else {
            return;
        };
        // the desired state is always that the interface exists
        if !self.hdl.lock().is_ok() {
            links.hw.enqueue(self.mk_create_cmd(links));
        }
        let need_state = if Arc::ptr_eq(&self.state, &desired.state) {
            // committing the canonical itself: only the rc can demand a write
            !self.state.lock().is_ok()
        } else {
            self.state.lock().update(&desired.state.lock())
        };
        if need_state {
            links.hw.enqueue(Arc::new(SetFlagsCmd {
                core: RpcCore::new(self.state.clone()),
                hdl: self.hdl.clone(),
            }));
        }
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        let Some(links) = self.links.get() else {
            return;
        };
        self.sweep();
        let hdl = *self.hdl.lock().data();
        if hdl.is_valid() {
            links.directory.remove(hdl);
        }
        if let (Some(ep_db), Some(endpoint)) = (&links.by_endpoint, self.endpoint()) {
            ep_db.release(endpoint);
        }
        links.by_name.release(&self.name);
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub(crate) struct ItfCreateCmd {
    core: RpcCore<Handle>,
    name: String,
    kind: Type,
    directory: ItfDirectory,
}

impl PartialEq for ItfCreateCmd {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.kind == other.kind
    }
}

impl Cmd for ItfCreateCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Rpc
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        conn.send(
            ctx,
            Request::InterfaceCreate {
                name: self.name.clone(),
                kind: self.kind.to_string(),
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
                warn!(cmd = %self, reply = ?other, "interface create rejected");
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

impl std::fmt::Display for ItfCreateCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "itf-create: {} type:{} {}",
            self.name,
            self.kind,
            self.core.item.lock().clone()
        )
    }
}

pub(crate) struct ItfDeleteCmd {
    core: RpcCore<Handle>,
    directory: ItfDirectory,
}

impl Cmd for ItfDeleteCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Rpc
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        let sw_if_index = self.core.item.lock().data().value();
        conn.send(ctx, Request::InterfaceDelete { sw_if_index })
    }

    fn deliver(&self, reply: Reply) -> crate::cmd::Delivery {
        let rc = ack_rc(&reply);
        if !rc.is_success() {
            warn!(cmd = %self, "interface delete rejected");
        }
        self.directory.remove(*self.core.item.lock().data());
        // deleted state is "not programmed", whatever the forwarder said
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
        // a delete that lands leaves the item NOOP; report success upward
        let rc = self.core.rc();
        if rc == RcCode::Noop { RcCode::Ok } else { rc }
    }
}

impl std::fmt::Display for ItfDeleteCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "itf-delete: {}", self.core.item.lock().clone())
    }
}

/// Program the admin state of an existing interface.
pub(crate) struct SetFlagsCmd {
    core: RpcCore<AdminState>,
    hdl: SharedItem<Handle>,
}

impl PartialEq for SetFlagsCmd {
    fn eq(&self, other: &Self) -> bool {
        let state_eq = Arc::ptr_eq(&self.core.item, &other.core.item)
            || *self.core.item.lock() == *other.core.item.lock();
        let hdl_eq =
            Arc::ptr_eq(&self.hdl, &other.hdl) || *self.hdl.lock() == *other.hdl.lock();
        state_eq && hdl_eq
    }
}

impl Cmd for SetFlagsCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Rpc
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        let sw_if_index = self.hdl.lock().data().value();
        let admin_up = self.core.item.lock().data().is_up();
        conn.send(
            ctx,
            Request::InterfaceSetFlags {
                sw_if_index,
                admin_up,
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

impl std::fmt::Display for SetFlagsCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "itf-set-flags: {} {}",
            self.hdl.lock().data(),
            self.core.item.lock().clone()
        )
    }
}

pub(crate) struct ItfDumpCmd {
    core: DumpCore,
}

impl ItfDumpCmd {
    pub fn new() -> Arc<Self> {
        Arc::new(ItfDumpCmd {
            core: DumpCore::new(),
        })
    }

    pub fn take_records(&self) -> Vec<Reply> {
        self.core.take_records()
    }
}

impl Cmd for ItfDumpCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Dump
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        self.core.issue(conn, ctx, Request::InterfaceDump)
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

impl std::fmt::Display for ItfDumpCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("itf-dump")
    }
}

// ---------------------------------------------------------------------------
// Event subscription
// ---------------------------------------------------------------------------

/// An interface state change reported by the forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceEvent {
    pub handle: Handle,
    pub admin_up: bool,
    pub deleted: bool,
}

/// The persistent interface-event subscription.  Lives in the pending map
/// from issue until retirement; each arriving event is queued and then
/// pushed to the listener channel.
pub struct InterfaceEventsCmd {
    core: EventCore<InterfaceEvent>,
}

impl InterfaceEventsCmd {
    pub(crate) fn new(tx: mpsc::UnboundedSender<InterfaceEvent>) -> Arc<Self> {
        Arc::new(InterfaceEventsCmd {
            core: EventCore::new(tx),
        })
    }

    /// End the subscription: best-effort disable on the wire, then leave
    /// the pending map.
    pub(crate) fn retire(&self, hw: &Hw) {
        let Some(ctx) = self.core.ctx() else {
            return;
        };
        if let Some(conn) = hw.connection() {
            let _ = conn.send(ctx, Request::InterfaceEvents { enable: false });
        }
        hw.retire(ctx);
    }
}

impl Cmd for InterfaceEventsCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Event
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        let rc = conn.send(ctx, Request::InterfaceEvents { enable: true });
        if rc.is_success() {
            self.core.installed(ctx);
        }
        rc
    }

    fn deliver(&self, reply: Reply) -> crate::cmd::Delivery {
        match reply {
            Reply::InterfaceEvent {
                sw_if_index,
                admin_up,
                deleted,
            } => {
                self.core.push(InterfaceEvent {
                    handle: Handle(sw_if_index),
                    admin_up,
                    deleted,
                });
                self.core.notify();
            }
            other => warn!(reply = ?other, "unexpected reply on event subscription"),
        }
        crate::cmd::Delivery::Pending
    }

    fn abort(&self) {
        self.core.aborted();
    }

    fn completion(&self) -> watch::Receiver<bool> {
        self.core.subscribe()
    }

    fn rc(&self) -> RcCode {
        if self.core.ctx().is_some() {
            RcCode::Ok
        } else {
            RcCode::Timeout
        }
    }
}

impl std::fmt::Display for InterfaceEventsCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("itf-events")
    }
}

// ---------------------------------------------------------------------------
// Event handler
// ---------------------------------------------------------------------------

pub(crate) struct EventHandler;

impl Listener for EventHandler {
    fn order(&self) -> Dependency {
        Dependency::Interface
    }

    fn handle_populate<'a>(
        &'a self,
        ctx: &'a PopulateCtx<'a>,
        client: &'a str,
    ) -> PopulateFuture<'a> {
        Box::pin(async move {
            let dump = ItfDumpCmd::new();
            ctx.hw().enqueue(dump.clone());
            ctx.hw().write().await;

            for record in dump.take_records() {
                let Reply::InterfaceDetails {
                    sw_if_index,
                    name,
                    admin_up,
                } = record
                else {
                    continue;
                };
                let kind = Type::from_name(&name);
                // tunnels are populated by their own family; the local
                // interface belongs to the forwarder itself
                if matches!(kind, Type::Vxlan | Type::Local) {
                    continue;
                }
                let itf = Interface::discovered(
                    Handle(sw_if_index),
                    &name,
                    kind,
                    AdminState::from_admin_up(admin_up),
                );
                ctx.om().db.itf_directory.insert(Handle(sw_if_index), &name);
                debug!(itf = %itf, "dump");
                ctx.commit(client, &itf).await;
            }
        })
    }

    fn handle_replay(&self, om: &Om) {
        // tunnels are in this DB under their names, so they replay here too
        om.db.interfaces.replay();
    }

    fn show(&self, om: &Om, out: &mut String) {
        om.db.interfaces.dump(out);
    }

    fn tags(&self) -> &'static [&'static str] {
        &["interface", "itf"]
    }

    fn description(&self) -> &'static str {
        "Interfaces"
    }
}
