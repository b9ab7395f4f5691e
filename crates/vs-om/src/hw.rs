//! HW items and the command queue toward the forwarder.
//!
//! An [`HwItem`] pairs one piece of desired state with the forwarder's last
//! result for it.  Commands hold shared item cells, never the objects that
//! own them, so an in-flight command can safely outlive its object.
//!
//! [`Hw`] is the pipe into which commands are written.  `write()` drains the
//! FIFO in order, issuing each command and awaiting its completion before the
//! next; a background task demultiplexes reply frames to pending commands by
//! correlation context.

use crate::cmd::{Cmd, Delivery};
use crate::types::RcCode;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vs_api::{Reply, ReplyFrame, Request, RequestFrame, Transport};

// ---------------------------------------------------------------------------
// HwItem
// ---------------------------------------------------------------------------

/// One cell of programmed state: the data written to (or read from) the
/// forwarder, and the result of that operation.
///
/// `rc == OK` means the data reflects what the forwarder currently has; any
/// other rc means the data is desired-only.
#[derive(Debug, Clone)]
pub struct HwItem<T> {
    data: T,
    rc: RcCode,
}

impl<T> HwItem<T> {
    /// Desired data, not yet programmed.
    pub fn new(data: T) -> Self {
        HwItem {
            data,
            rc: RcCode::Noop,
        }
    }

    pub fn with_rc(data: T, rc: RcCode) -> Self {
        HwItem { data, rc }
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn set_data(&mut self, data: T) {
        self.data = data;
    }

    pub fn rc(&self) -> RcCode {
        self.rc
    }

    /// Record the forwarder's result.  Only the command family calls this.
    pub fn set(&mut self, rc: RcCode) {
        self.rc = rc;
    }

    /// True when the item is configured in the forwarder.
    pub fn is_ok(&self) -> bool {
        self.rc == RcCode::Ok
    }
}

impl<T: Default> HwItem<T> {
    pub fn from_rc(rc: RcCode) -> Self {
        HwItem {
            data: T::default(),
            rc,
        }
    }
}

impl<T: PartialEq> HwItem<T> {
    /// Move this item to the desired state.  Returns true when a forwarder
    /// write is required: the data differs, or the state is not yet in HW.
    pub fn update(&mut self, desired: &HwItem<T>) -> bool
    where
        T: Clone,
    {
        let need_hw_update = self.data != desired.data || !self.is_ok();
        self.data = desired.data.clone();
        need_hw_update
    }
}

/// Equality is on data only, never rc; this is what lets an idempotent
/// commit avoid re-writes.
impl<T: PartialEq> PartialEq for HwItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl<T: std::fmt::Display> std::fmt::Display for HwItem<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "hw-item:[rc:{} data:{}]", self.rc, self.data)
    }
}

/// An item cell shared between its owning object and in-flight commands.
pub type SharedItem<T> = Arc<Mutex<HwItem<T>>>;

pub fn shared<T>(item: HwItem<T>) -> SharedItem<T> {
    Arc::new(Mutex::new(item))
}

/// Deep-copy a cell; interning copies template cells so the canonical
/// instance never aliases caller-owned state.
pub fn clone_cell<T: Clone>(cell: &SharedItem<T>) -> SharedItem<T> {
    Arc::new(Mutex::new(cell.lock().clone()))
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// The submit side of the forwarder channel.
#[derive(Clone)]
pub struct Connection {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Connection {
    /// Encode and submit one request under a correlation context.
    pub fn send(&self, ctx: u64, msg: Request) -> RcCode {
        let frame = RequestFrame { ctx, msg };
        let bytes = match frame.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "request frame encode failed");
                return RcCode::Invalid;
            }
        };
        if self.tx.send(bytes).is_ok() {
            RcCode::Ok
        } else {
            RcCode::Timeout
        }
    }
}

// ---------------------------------------------------------------------------
// Command queue
// ---------------------------------------------------------------------------

struct QueueState {
    /// Enqueued commands, ready to be written.
    queue: VecDeque<Arc<dyn Cmd>>,
    /// Issued but uncompleted commands, keyed by correlation context.
    pending: HashMap<u64, Arc<dyn Cmd>>,
    /// Kill-switch: while false, mutating commands are discarded on write.
    enabled: bool,
    connected: bool,
    next_ctx: u64,
    conn: Option<Connection>,
    rx_task: Option<JoinHandle<()>>,
    /// Bumped on every connect/disconnect; a receive loop whose generation
    /// is stale must exit without touching the state.
    generation: u64,
}

struct HwInner {
    state: Mutex<QueueState>,
    /// Serialises write() drains so interleaved writers cannot reorder the
    /// FIFO on the wire.
    writer: tokio::sync::Mutex<()>,
}

/// Handle to the command pipe.  Cheap to clone; objects keep one so their
/// sweep can enqueue deletes from destructors.
#[derive(Clone)]
pub struct Hw {
    inner: Arc<HwInner>,
}

impl Default for Hw {
    fn default() -> Self {
        Self::new()
    }
}

impl Hw {
    pub fn new() -> Self {
        Hw {
            inner: Arc::new(HwInner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    pending: HashMap::new(),
                    enabled: true,
                    connected: false,
                    next_ctx: 1,
                    conn: None,
                    rx_task: None,
                    generation: 0,
                }),
                writer: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Append a command to the FIFO.
    pub fn enqueue(&self, cmd: Arc<dyn Cmd>) {
        self.inner.lock_state().queue.push_back(cmd);
    }

    /// Issue every queued command in order, awaiting each command's
    /// completion before the next.  Returns the first non-OK outcome, or OK.
    ///
    /// While the queue is disabled, mutating commands are dropped silently;
    /// dump and event commands still go to the wire (reads cannot
    /// re-program the forwarder).
    pub async fn write(&self) -> RcCode {
        let _writer = self.inner.writer.lock().await;
        let mut agg = RcCode::Ok;

        loop {
            enum Step {
                Issue(Arc<dyn Cmd>, Connection, u64),
                NotConnected(Arc<dyn Cmd>),
                Dropped,
                Empty,
            }

            let step = {
                let mut st = self.inner.lock_state();
                match st.queue.pop_front() {
                    None => Step::Empty,
                    Some(cmd) => {
                        if !st.enabled && cmd.mutating() {
                            debug!(cmd = %cmd, "queue disabled, dropping command");
                            Step::Dropped
                        } else if let Some(conn) = st.conn.clone() {
                            let ctx = st.next_ctx;
                            st.next_ctx += 1;
                            st.pending.insert(ctx, cmd.clone());
                            Step::Issue(cmd, conn, ctx)
                        } else {
                            Step::NotConnected(cmd)
                        }
                    }
                }
            };

            match step {
                Step::Empty => break,
                Step::Dropped => continue,
                Step::NotConnected(cmd) => {
                    cmd.abort();
                    if agg.is_success() {
                        agg = RcCode::Timeout;
                    }
                }
                Step::Issue(cmd, conn, ctx) => {
                    debug!(cmd = %cmd, ctx, "issue");
                    let rc = cmd.issue(&conn, ctx);
                    if !rc.is_success() {
                        self.inner.lock_state().pending.remove(&ctx);
                        cmd.abort();
                        if agg.is_success() {
                            agg = rc;
                        }
                        continue;
                    }
                    let mut done = cmd.completion();
                    if done.wait_for(|d| *d).await.is_err() && agg.is_success() {
                        agg = RcCode::Timeout;
                    }
                    let rc = cmd.rc();
                    if !rc.is_success() && agg.is_success() {
                        agg = rc;
                    }
                }
            }
        }

        agg
    }

    /// Attach a transport and start the receive loop.  Re-connecting after a
    /// disconnect replaces the old connection; anything still pending on it
    /// fails with TIMEOUT.
    pub fn connect(&self, transport: Transport) {
        let Transport { tx, rx } = transport;
        let inner = self.inner.clone();
        let stale = {
            let mut st = self.inner.lock_state();
            if let Some(task) = st.rx_task.take() {
                task.abort();
            }
            st.generation += 1;
            let generation = st.generation;
            st.conn = Some(Connection { tx });
            st.connected = true;
            st.rx_task = Some(tokio::spawn(rx_run(inner, rx, generation)));
            st.pending.drain().map(|(_, c)| c).collect::<Vec<_>>()
        };
        for cmd in stale {
            cmd.abort();
        }
        info!("forwarder connection up");
    }

    /// Tear the connection down; every pending command fails with TIMEOUT.
    pub fn disconnect(&self) {
        let (task, pending) = {
            let mut st = self.inner.lock_state();
            st.generation += 1;
            st.conn = None;
            st.connected = false;
            (
                st.rx_task.take(),
                st.pending.drain().map(|(_, c)| c).collect::<Vec<_>>(),
            )
        };
        if let Some(task) = task {
            task.abort();
        }
        for cmd in pending {
            cmd.abort();
        }
        info!("forwarder connection down");
    }

    pub fn connected(&self) -> bool {
        self.inner.lock_state().connected
    }

    /// Liveness probe: a control-ping round trip.
    pub async fn poll(&self) -> bool {
        let item = shared(HwItem::new(false));
        self.enqueue(PollCmd::new(item.clone()));
        self.write().await;
        let st = item.lock();
        st.is_ok() && *st.data()
    }

    /// Remove a pending command (event command retirement).
    pub(crate) fn retire(&self, ctx: u64) -> Option<Arc<dyn Cmd>> {
        self.inner.lock_state().pending.remove(&ctx)
    }

    pub(crate) fn connection(&self) -> Option<Connection> {
        self.inner.lock_state().conn.clone()
    }

    /// Discard mutating writes until the returned guard drops.  Only the OM
    /// may quiesce the queue, around populate.
    pub(crate) fn quiesce(&self) -> QuiesceGuard {
        self.disable();
        QuiesceGuard { hw: self.clone() }
    }

    pub(crate) fn disable(&self) {
        self.inner.lock_state().enabled = false;
    }

    pub(crate) fn enable(&self) {
        self.inner.lock_state().enabled = true;
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.lock_state().pending.len()
    }
}

impl HwInner {
    fn lock_state(&self) -> parking_lot::MutexGuard<'_, QueueState> {
        self.state.lock()
    }
}

/// Closes the quiesce window on every exit path.
pub(crate) struct QuiesceGuard {
    hw: Hw,
}

impl Drop for QuiesceGuard {
    fn drop(&mut self) {
        self.hw.enable();
    }
}

// ---------------------------------------------------------------------------
// Receive loop
// ---------------------------------------------------------------------------

/// Demultiplex reply frames to pending commands until the channel closes.
///
/// A loop outlived by a reconnect observes the generation bump and exits
/// without touching the queue state.
async fn rx_run(inner: Arc<HwInner>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>, generation: u64) {
    loop {
        match rx.recv().await {
            Some(bytes) => {
                let frame = match ReplyFrame::decode(&bytes) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(error = %e, "undecodable frame from forwarder");
                        continue;
                    }
                };
                let cmd = {
                    let st = inner.lock_state();
                    if st.generation != generation {
                        return;
                    }
                    st.pending.get(&frame.ctx).cloned()
                };
                match cmd {
                    Some(cmd) => {
                        if let Delivery::Done = cmd.deliver(frame.msg) {
                            let mut st = inner.lock_state();
                            if st.generation == generation {
                                st.pending.remove(&frame.ctx);
                            }
                        }
                    }
                    None => debug!(ctx = frame.ctx, "reply for unknown context"),
                }
            }
            None => {
                let pending: Vec<_> = {
                    let mut st = inner.lock_state();
                    if st.generation != generation {
                        return;
                    }
                    st.connected = false;
                    st.conn = None;
                    st.pending.drain().map(|(_, c)| c).collect()
                };
                for cmd in pending {
                    cmd.abort();
                }
                info!("forwarder connection closed by peer");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Poll command
// ---------------------------------------------------------------------------

/// Control-ping liveness probe against the forwarder.
pub struct PollCmd {
    core: crate::cmd::RpcCore<bool>,
}

impl PollCmd {
    pub fn new(item: SharedItem<bool>) -> Arc<Self> {
        Arc::new(PollCmd {
            core: crate::cmd::RpcCore::new(item),
        })
    }
}

impl Cmd for PollCmd {
    fn kind(&self) -> crate::cmd::CmdKind {
        crate::cmd::CmdKind::Rpc
    }

    // A ping never programs state; let it through a quiesced queue.
    fn mutating(&self) -> bool {
        false
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        conn.send(ctx, Request::ControlPing)
    }

    fn deliver(&self, reply: Reply) -> Delivery {
        match reply {
            Reply::ControlPingReply => self.core.complete_with(RcCode::Ok, |item| {
                item.set_data(true);
            }),
            other => {
                warn!(reply = ?other, "unexpected reply to control ping");
                self.core.complete(RcCode::Invalid);
            }
        }
        Delivery::Done
    }

    fn abort(&self) {
        self.core.complete_with(RcCode::Timeout, |item| {
            item.set_data(false);
        });
    }

    fn completion(&self) -> tokio::sync::watch::Receiver<bool> {
        self.core.subscribe()
    }

    fn rc(&self) -> RcCode {
        self.core.rc()
    }
}

impl std::fmt::Display for PollCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "poll: {}", self.core.item.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::{CmdKind, DumpCore, RpcCore};
    use crate::types::Handle;
    use vs_api::transport_pair;

    // A minimal rpc command for queue tests.
    struct TestRpc {
        core: RpcCore<u32>,
        req: Request,
    }

    impl TestRpc {
        fn new(req: Request) -> (Arc<Self>, SharedItem<u32>) {
            let item = shared(HwItem::new(0));
            (
                Arc::new(TestRpc {
                    core: RpcCore::new(item.clone()),
                    req,
                }),
                item,
            )
        }
    }

    impl Cmd for TestRpc {
        fn kind(&self) -> CmdKind {
            CmdKind::Rpc
        }
        fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
            conn.send(ctx, self.req.clone())
        }
        fn deliver(&self, reply: Reply) -> Delivery {
            let rc = match reply {
                Reply::Ack { retval } => RcCode::from_retval(retval),
                _ => RcCode::Invalid,
            };
            self.core.complete(rc);
            Delivery::Done
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

    impl std::fmt::Display for TestRpc {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test-rpc")
        }
    }

    struct TestDump {
        core: DumpCore,
    }

    impl Cmd for TestDump {
        fn kind(&self) -> CmdKind {
            CmdKind::Dump
        }
        fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
            let rc = conn.send(ctx, Request::BridgeDomainDump);
            if !rc.is_success() {
                return rc;
            }
            conn.send(ctx, Request::ControlPing)
        }
        fn deliver(&self, reply: Reply) -> Delivery {
            match reply {
                Reply::ControlPingReply => {
                    self.core.finish(RcCode::Ok);
                    Delivery::Done
                }
                record => {
                    self.core.push(record);
                    Delivery::Pending
                }
            }
        }
        fn abort(&self) {
            self.core.finish(RcCode::Timeout);
        }
        fn completion(&self) -> tokio::sync::watch::Receiver<bool> {
            self.core.subscribe()
        }
        fn rc(&self) -> RcCode {
            self.core.rc()
        }
    }

    impl std::fmt::Display for TestDump {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test-dump")
        }
    }

    /// Answer every decodable request with Ack(0); returns received requests.
    fn ack_all(mut fwd: Transport) -> Arc<Mutex<Vec<Request>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = log.clone();
        tokio::spawn(async move {
            while let Some(bytes) = fwd.rx.recv().await {
                let frame = RequestFrame::decode(&bytes).unwrap();
                seen.lock().push(frame.msg.clone());
                let reply = match frame.msg {
                    Request::ControlPing => Reply::ControlPingReply,
                    _ => Reply::Ack { retval: 0 },
                };
                let out = ReplyFrame {
                    ctx: frame.ctx,
                    msg: reply,
                };
                if fwd.tx.send(out.encode().unwrap()).is_err() {
                    break;
                }
            }
        });
        log
    }

    #[test]
    fn item_update_truth_table() {
        // same data, already OK: no write needed
        let mut item = HwItem::with_rc(7u32, RcCode::Ok);
        assert!(!item.update(&HwItem::new(7)));
        // same data, not in HW yet: write needed
        let mut item = HwItem::new(7u32);
        assert!(item.update(&HwItem::new(7)));
        // different data, OK: write needed and data assigned
        let mut item = HwItem::with_rc(7u32, RcCode::Ok);
        assert!(item.update(&HwItem::new(9)));
        assert_eq!(*item.data(), 9);
    }

    #[test]
    fn item_equality_ignores_rc() {
        let a = HwItem::with_rc(Handle(3), RcCode::Ok);
        let b = HwItem::new(Handle(3));
        assert_eq!(a, b);
        assert_ne!(a, HwItem::new(Handle(4)));
    }

    #[tokio::test]
    async fn write_issues_in_enqueue_order_and_awaits_replies() {
        let hw = Hw::new();
        let (engine, fwd) = transport_pair();
        let log = ack_all(fwd);
        hw.connect(engine);

        let (c1, i1) = TestRpc::new(Request::BridgeDomainAddDel {
            bd_id: 1,
            is_add: true,
        });
        let (c2, i2) = TestRpc::new(Request::BridgeDomainAddDel {
            bd_id: 2,
            is_add: true,
        });
        hw.enqueue(c1);
        hw.enqueue(c2);
        let rc = hw.write().await;
        assert_eq!(rc, RcCode::Ok);
        assert_eq!(i1.lock().rc(), RcCode::Ok);
        assert_eq!(i2.lock().rc(), RcCode::Ok);
        let seen = log.lock().clone();
        assert_eq!(
            seen,
            vec![
                Request::BridgeDomainAddDel {
                    bd_id: 1,
                    is_add: true
                },
                Request::BridgeDomainAddDel {
                    bd_id: 2,
                    is_add: true
                },
            ]
        );
        assert_eq!(hw.pending_len(), 0);
    }

    #[tokio::test]
    async fn disabled_queue_drops_mutating_commands_but_not_dumps() {
        let hw = Hw::new();
        let (engine, fwd) = transport_pair();
        let log = ack_all(fwd);
        hw.connect(engine);

        hw.disable();
        let (rpc, item) = TestRpc::new(Request::BridgeDomainAddDel {
            bd_id: 7,
            is_add: true,
        });
        let dump = Arc::new(TestDump {
            core: DumpCore::new(),
        });
        hw.enqueue(rpc);
        hw.enqueue(dump.clone());
        let rc = hw.write().await;
        hw.enable();

        // dropped silently: no abort, no result
        assert_eq!(rc, RcCode::Ok);
        assert_eq!(item.lock().rc(), RcCode::Noop);
        // the dump went out and terminated on the ping sentinel
        assert_eq!(dump.rc(), RcCode::Ok);
        let seen = log.lock().clone();
        assert_eq!(seen, vec![Request::BridgeDomainDump, Request::ControlPing]);
    }

    #[tokio::test]
    async fn write_while_disconnected_fails_commands_with_timeout() {
        let hw = Hw::new();
        let (cmd, item) = TestRpc::new(Request::BridgeDomainAddDel {
            bd_id: 7,
            is_add: true,
        });
        hw.enqueue(cmd);
        let rc = hw.write().await;
        assert_eq!(rc, RcCode::Timeout);
        assert_eq!(item.lock().rc(), RcCode::Timeout);
    }

    #[tokio::test]
    async fn peer_disconnect_aborts_pending_commands() {
        let hw = Hw::new();
        let (engine, fwd) = transport_pair();
        hw.connect(engine);

        let (cmd, item) = TestRpc::new(Request::BridgeDomainAddDel {
            bd_id: 7,
            is_add: true,
        });
        hw.enqueue(cmd);
        // drop the forwarder side without answering; the pending command
        // must observe the disconnect
        let writer = {
            let hw = hw.clone();
            tokio::spawn(async move { hw.write().await })
        };
        // allow the issue to land, then close the peer
        tokio::task::yield_now().await;
        drop(fwd);
        let rc = writer.await.unwrap();
        assert_eq!(rc, RcCode::Timeout);
        assert_eq!(item.lock().rc(), RcCode::Timeout);
        assert!(!hw.connected());
    }

    #[tokio::test]
    async fn poll_round_trips_a_control_ping() {
        let hw = Hw::new();
        let (engine, fwd) = transport_pair();
        let _log = ack_all(fwd);
        hw.connect(engine);
        assert!(hw.poll().await);
        hw.disconnect();
        assert!(!hw.poll().await);
    }
}
