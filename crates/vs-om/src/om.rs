//! The OM facade: the public entry point of the object model.
//!
//! Owns the command queue, the client reference sets, the per-family
//! singular DBs and the listener registry.  Entry points are serialized by
//! one coarse lock; the receive loop never calls back in here.
//!
//! Lock order: OM -> singular DB -> command queue -> per-command.

use crate::acl::AclList;
use crate::arp_proxy::ArpProxyConfig;
use crate::bridge_domain::BridgeDomain;
use crate::client_db::ClientDb;
use crate::config::OmConfig;
use crate::hw::Hw;
use crate::inspect::Inspect;
use crate::interface::{Interface, InterfaceEvent, InterfaceEventsCmd, ItfDirectory};
use crate::l2_binding::L2Binding;
use crate::lldp_binding::LldpBinding;
use crate::object_base::OmObject;
use crate::singular_db::SingularDb;
use crate::types::{Dependency, RcCode};
use crate::vxlan_tunnel::Endpoint;
use parking_lot::Mutex;
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};
use vs_api::Transport;

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

pub type PopulateFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Per-family hooks dispatched in dependency order during populate and
/// replay, plus the introspection callback.
pub trait Listener: Send + Sync {
    /// The sortable position of this family in the dependency order.
    fn order(&self) -> Dependency;

    /// Read the family's state out of the forwarder and commit it under
    /// `client`.  Runs with the queue quiesced: dumps go out, creates for
    /// the synthesized objects are discarded.
    fn handle_populate<'a>(&'a self, ctx: &'a PopulateCtx<'a>, client: &'a str)
    -> PopulateFuture<'a>;

    /// Re-enqueue creates for every live object in the family.
    fn handle_replay(&self, om: &Om);

    /// Render the family's singular DB.
    fn show(&self, om: &Om, out: &mut String);

    /// Introspection tags resolving to this family.
    fn tags(&self) -> &'static [&'static str];

    fn description(&self) -> &'static str;
}

/// Capability handed to populate handlers: commit without re-taking the
/// OM lock the populate already holds.
pub struct PopulateCtx<'a> {
    om: &'a Om,
}

impl PopulateCtx<'_> {
    pub async fn commit<O: OmObject>(&self, client: &str, desired: &O) -> RcCode {
        self.om.commit_internal(client, desired).await
    }

    pub fn om(&self) -> &Om {
        self.om
    }

    pub fn hw(&self) -> &Hw {
        &self.om.hw
    }
}

// ---------------------------------------------------------------------------
// Databases
// ---------------------------------------------------------------------------

/// The per-family singular DBs and the handle directory, owned by the OM so
/// engine instances are independent of each other.
pub(crate) struct Databases {
    pub bridge_domains: Arc<SingularDb<u32, BridgeDomain>>,
    pub interfaces: Arc<SingularDb<String, Interface>>,
    pub vxlan_tunnels: Arc<SingularDb<Endpoint, Interface>>,
    pub l2_bindings: Arc<SingularDb<String, L2Binding>>,
    pub lldp_bindings: Arc<SingularDb<String, LldpBinding>>,
    pub arp_proxies: Arc<SingularDb<(Ipv4Addr, Ipv4Addr), ArpProxyConfig>>,
    pub acls: Arc<SingularDb<String, AclList>>,
    pub itf_directory: ItfDirectory,
}

impl Databases {
    fn new() -> Self {
        Databases {
            bridge_domains: Arc::new(SingularDb::new()),
            interfaces: Arc::new(SingularDb::new()),
            vxlan_tunnels: Arc::new(SingularDb::new()),
            l2_bindings: Arc::new(SingularDb::new()),
            lldp_bindings: Arc::new(SingularDb::new()),
            arp_proxies: Arc::new(SingularDb::new()),
            acls: Arc::new(SingularDb::new()),
            itf_directory: ItfDirectory::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Om
// ---------------------------------------------------------------------------

/// The object model.  Build one per forwarder connection.
pub struct Om {
    hw: Hw,
    /// Coarse serialization of the entry points.
    entry: tokio::sync::Mutex<()>,
    clients: Mutex<ClientDb>,
    pub(crate) db: Databases,
    listeners: Mutex<Vec<Arc<dyn Listener>>>,
    inspect: Inspect,
    epoch: AtomicU64,
    cfg: OmConfig,
    events_cmd: Mutex<Option<Arc<InterfaceEventsCmd>>>,
}

impl Default for Om {
    fn default() -> Self {
        Self::new()
    }
}

impl Om {
    pub fn new() -> Om {
        Self::with_config(OmConfig::default())
    }

    pub fn with_config(cfg: OmConfig) -> Om {
        let om = Om {
            hw: Hw::new(),
            entry: tokio::sync::Mutex::new(()),
            clients: Mutex::new(ClientDb::new()),
            db: Databases::new(),
            listeners: Mutex::new(Vec::new()),
            inspect: Inspect::new(),
            epoch: AtomicU64::new(0),
            cfg,
            events_cmd: Mutex::new(None),
        };
        for listener in crate::builtin_listeners() {
            om.register_listener(listener);
        }
        om
    }

    /// Attach the forwarder transport.  Per config, the connect round-trips
    /// a liveness ping and installs the interface event subscription.
    pub async fn connect(&self, transport: Transport) -> RcCode {
        let _entry = self.entry.lock().await;
        self.hw.connect(transport);
        if self.cfg.connect.poll && !self.hw.poll().await {
            return RcCode::Timeout;
        }
        if self.cfg.connect.interface_events {
            let (tx, _rx) = mpsc::unbounded_channel();
            self.install_interface_events(tx).await;
        }
        RcCode::Ok
    }

    /// Tear the connection down.  Pending commands fail with TIMEOUT; the
    /// in-memory model is untouched and replays on the next connect.
    pub async fn disconnect(&self) {
        let _entry = self.entry.lock().await;
        if let Some(cmd) = self.events_cmd.lock().take() {
            cmd.retire(&self.hw);
        }
        self.hw.disconnect();
    }

    /// Commit desired state under a client key: intern, diff, write, and
    /// take (or refresh) the client's reference.
    pub async fn commit<O: OmObject>(&self, client: &str, desired: &O) -> RcCode {
        let _entry = self.entry.lock().await;
        self.commit_internal(client, desired).await
    }

    async fn commit_internal<O: OmObject>(&self, client: &str, desired: &O) -> RcCode {
        let canonical = desired.singular(self);
        debug!(client, obj = %canonical, "commit");
        canonical.update(desired);
        let rc = self.hw.write().await;
        self.clients.lock().insert(client, O::FAMILY, canonical);
        rc
    }

    /// Drop every reference this client holds; objects nobody else holds
    /// are destroyed, which sweeps them from the forwarder.
    pub async fn remove(&self, client: &str) {
        let _entry = self.entry.lock().await;
        let dropped = self.clients.lock().remove_client(client);
        debug!(client, dropped, "client removed");
        self.hw.write().await;
    }

    /// Mark every reference of the client stale; commits until the next
    /// sweep refresh the objects the client still wants.
    pub async fn mark(&self, client: &str) {
        let _entry = self.entry.lock().await;
        self.clients.lock().mark(client);
    }

    /// Drop the references still stale since `mark`.
    pub async fn sweep(&self, client: &str) {
        let _entry = self.entry.lock().await;
        let dropped = self.clients.lock().sweep(client);
        debug!(client, dropped, "sweep");
        self.hw.write().await;
    }

    /// Read the forwarder's state into the model under `client`, family by
    /// family in dependency order, without re-programming anything.
    pub async fn populate(&self, client: &str) {
        let _entry = self.entry.lock().await;
        info!(client, "populate");
        let listeners = self.sorted_listeners();
        // the quiesce window covers every exit path out of the handlers
        let _quiesce = self.hw.quiesce();
        let ctx = PopulateCtx { om: self };
        for listener in listeners {
            listener.handle_populate(&ctx, client).await;
        }
    }

    /// Push the whole model back to a freshly reconnected forwarder.  Each
    /// dependency level is fully written before the next starts.
    pub async fn replay(&self) {
        let _entry = self.entry.lock().await;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!(epoch, "replay");
        for listener in self.sorted_listeners() {
            listener.handle_replay(self);
            self.hw.write().await;
        }
    }

    /// Liveness probe.
    pub async fn poll(&self) -> bool {
        let _entry = self.entry.lock().await;
        self.hw.poll().await
    }

    /// Subscribe to interface state events from the forwarder.
    pub async fn subscribe_interface_events(&self) -> mpsc::UnboundedReceiver<InterfaceEvent> {
        let _entry = self.entry.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();
        self.install_interface_events(tx).await;
        rx
    }

    async fn install_interface_events(&self, tx: mpsc::UnboundedSender<InterfaceEvent>) {
        if let Some(old) = self.events_cmd.lock().take() {
            old.retire(&self.hw);
        }
        let cmd = InterfaceEventsCmd::new(tx);
        self.hw.enqueue(cmd.clone());
        self.hw.write().await;
        *self.events_cmd.lock() = Some(cmd);
    }

    /// Register a family's event handler.  Dispatch is in ascending
    /// `order()`; ties dispatch in an unspecified order.
    pub fn register_listener(&self, listener: Arc<dyn Listener>) {
        self.inspect.register(listener.clone());
        let mut listeners = self.listeners.lock();
        listeners.push(listener);
        listeners.sort_by_key(|l| l.order());
    }

    fn sorted_listeners(&self) -> Vec<Arc<dyn Listener>> {
        self.listeners.lock().clone()
    }

    // -----------------------------------------------------------------------
    // Introspection + lookups
    // -----------------------------------------------------------------------

    /// The epoch advances on every replay.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn hw(&self) -> &Hw {
        &self.hw
    }

    /// Render the family registered under an introspection tag.
    pub fn show(&self, tag: &str) -> Option<String> {
        self.inspect.show(self, tag)
    }

    pub fn show_all(&self) -> String {
        self.inspect.show_all(self)
    }

    /// Render every client's reference set.
    pub fn dump_clients(&self) -> String {
        let mut out = String::new();
        self.clients.lock().dump(&mut out);
        out
    }

    /// Total references held by a client.
    pub fn client_ref_count(&self, client: &str) -> usize {
        self.clients.lock().ref_count(client)
    }

    pub fn find_bridge_domain(&self, id: u32) -> Option<Arc<BridgeDomain>> {
        self.db.bridge_domains.find(&id)
    }

    pub fn find_interface(&self, name: &str) -> Option<Arc<Interface>> {
        self.db.interfaces.find(&name.to_owned())
    }

    pub fn find_vxlan_tunnel(&self, endpoint: &Endpoint) -> Option<Arc<Interface>> {
        self.db.vxlan_tunnels.find(endpoint)
    }

    pub fn find_l2_binding(&self, itf_name: &str) -> Option<Arc<L2Binding>> {
        self.db.l2_bindings.find(&itf_name.to_owned())
    }

    pub fn find_acl(&self, tag: &str) -> Option<Arc<AclList>> {
        self.db.acls.find(&tag.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        level: Dependency,
        log: Arc<Mutex<Vec<Dependency>>>,
    }

    impl Listener for Recorder {
        fn order(&self) -> Dependency {
            self.level
        }
        fn handle_populate<'a>(
            &'a self,
            _ctx: &'a PopulateCtx<'a>,
            _client: &'a str,
        ) -> PopulateFuture<'a> {
            Box::pin(async move {
                self.log.lock().push(self.level);
            })
        }
        fn handle_replay(&self, _om: &Om) {
            self.log.lock().push(self.level);
        }
        fn show(&self, _om: &Om, _out: &mut String) {}
        fn tags(&self) -> &'static [&'static str] {
            &["recorder"]
        }
        fn description(&self) -> &'static str {
            "Recorder"
        }
    }

    #[tokio::test]
    async fn replay_dispatches_listeners_in_ascending_dependency_order() {
        let om = Om::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        // registered out of order on purpose
        for level in [
            Dependency::Binding,
            Dependency::Interface,
            Dependency::ForwardingDomain,
        ] {
            om.register_listener(Arc::new(Recorder {
                level,
                log: log.clone(),
            }));
        }
        om.replay().await;
        let seen: Vec<Dependency> = log
            .lock()
            .iter()
            .copied()
            .filter(|l| {
                matches!(
                    l,
                    Dependency::Binding | Dependency::Interface | Dependency::ForwardingDomain
                )
            })
            .collect();
        assert_eq!(
            seen,
            vec![
                Dependency::Interface,
                Dependency::ForwardingDomain,
                Dependency::Binding,
            ]
        );
        assert_eq!(om.epoch(), 1);
    }

    struct MutatingProbe {
        core: crate::cmd::RpcCore<u32>,
    }

    impl crate::cmd::Cmd for MutatingProbe {
        fn kind(&self) -> crate::cmd::CmdKind {
            crate::cmd::CmdKind::Rpc
        }
        fn issue(&self, conn: &crate::hw::Connection, ctx: u64) -> RcCode {
            conn.send(ctx, vs_api::Request::ControlPing)
        }
        fn deliver(&self, _reply: vs_api::Reply) -> crate::cmd::Delivery {
            self.core.complete(RcCode::Ok);
            crate::cmd::Delivery::Done
        }
        fn abort(&self) {
            self.core.complete(RcCode::Timeout);
        }
        fn completion(&self) -> tokio::sync::watch::Receiver<bool> {
            self.core.subscribe()
        }
        fn rc(&self) -> RcCode {
            self.core.rc()
        }
    }

    impl std::fmt::Display for MutatingProbe {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("mutating-probe")
        }
    }

    #[tokio::test]
    async fn populate_closes_the_quiesce_window() {
        let om = Om::new();
        om.populate("client-a").await;
        // a later mutating write must not be silently discarded: with the
        // window closed (and no connection) the probe fails loudly instead
        // of vanishing
        let item = crate::hw::shared(crate::hw::HwItem::new(0u32));
        om.hw().enqueue(Arc::new(MutatingProbe {
            core: crate::cmd::RpcCore::new(item.clone()),
        }));
        let rc = om.hw().write().await;
        assert_eq!(rc, RcCode::Timeout);
        assert_eq!(item.lock().rc(), RcCode::Timeout);
    }
}
