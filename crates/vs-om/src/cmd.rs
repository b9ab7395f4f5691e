//! The command abstraction: the units of work written to the forwarder.
//!
//! Three shapes share one completion contract:
//!
//! * **Rpc** -- single request, single reply; the reply closes the command
//!   and records the outcome (and any allocated index) in its HW item.
//! * **Dump** -- single request, N streamed records, terminated by the
//!   control-ping sentinel sharing the dump's context.
//! * **Event** -- a persistent subscription; completes for the writer as
//!   soon as it is installed and stays pending until retired.

use crate::hw::{Connection, SharedItem};
use crate::types::RcCode;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::watch;
use vs_api::Reply;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdKind {
    Rpc,
    Dump,
    Event,
}

/// What the receive loop should do with a command after a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Completion predicate fired; remove from the pending map.
    Done,
    /// More replies expected (dump records, event stream).
    Pending,
}

/// An in-flight unit of work toward the forwarder.
pub trait Cmd: Send + Sync + std::fmt::Display {
    fn kind(&self) -> CmdKind;

    /// Mutating commands are discarded while the queue is quiesced; reads
    /// and subscriptions pass through.
    fn mutating(&self) -> bool {
        self.kind() == CmdKind::Rpc
    }

    /// Build the wire payload and submit it under `ctx`.
    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode;

    /// Deliver one reply routed to this command's context.
    fn deliver(&self, reply: Reply) -> Delivery;

    /// The connection dropped while the command was outstanding.
    fn abort(&self);

    /// Resolves true when the command's completion predicate has fired.
    fn completion(&self) -> watch::Receiver<bool>;

    /// The command's recorded outcome.
    fn rc(&self) -> RcCode;
}

// ---------------------------------------------------------------------------
// Completion flag
// ---------------------------------------------------------------------------

/// Level-triggered completion signal; waiters observe a set flag even when
/// they subscribe after the fact.
pub(crate) struct DoneFlag {
    tx: watch::Sender<bool>,
}

impl DoneFlag {
    pub fn new() -> Self {
        DoneFlag {
            tx: watch::channel(false).0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }
}

// ---------------------------------------------------------------------------
// Rpc core
// ---------------------------------------------------------------------------

/// Shared state of a request/response command: the HW item to populate and
/// the completion flag.  Concrete commands wrap this with their payload.
pub(crate) struct RpcCore<T> {
    pub item: SharedItem<T>,
    done: DoneFlag,
}

impl<T> RpcCore<T> {
    pub fn new(item: SharedItem<T>) -> Self {
        RpcCore {
            item,
            done: DoneFlag::new(),
        }
    }

    /// Record the outcome and wake the waiter.
    pub fn complete(&self, rc: RcCode) {
        self.item.lock().set(rc);
        self.done.set();
    }

    /// Record the outcome with a data mutation (e.g. an allocated index).
    pub fn complete_with<F>(&self, rc: RcCode, f: F)
    where
        F: FnOnce(&mut crate::hw::HwItem<T>),
    {
        {
            let mut item = self.item.lock();
            f(&mut item);
            item.set(rc);
        }
        self.done.set();
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    pub fn rc(&self) -> RcCode {
        self.item.lock().rc()
    }
}

/// The rc carried by a plain acknowledgement, or INVALID for a reply of the
/// wrong shape.
pub(crate) fn ack_rc(reply: &Reply) -> RcCode {
    match reply {
        Reply::Ack { retval } => RcCode::from_retval(*retval),
        _ => RcCode::Invalid,
    }
}

// ---------------------------------------------------------------------------
// Dump core
// ---------------------------------------------------------------------------

/// Shared state of a streaming dump: accumulated records and the sentinel
/// flag.  Records are drained single-pass; a re-scan needs a fresh command.
pub(crate) struct DumpCore {
    records: Mutex<Vec<Reply>>,
    rc: Mutex<RcCode>,
    done: DoneFlag,
}

impl DumpCore {
    pub fn new() -> Self {
        DumpCore {
            records: Mutex::new(Vec::new()),
            rc: Mutex::new(RcCode::Unset),
            done: DoneFlag::new(),
        }
    }

    /// Submit the dump request followed by the control-ping terminator,
    /// both under the same context.
    pub fn issue(&self, conn: &Connection, ctx: u64, dump: vs_api::Request) -> RcCode {
        let rc = conn.send(ctx, dump);
        if !rc.is_success() {
            return rc;
        }
        conn.send(ctx, vs_api::Request::ControlPing)
    }

    pub fn push(&self, record: Reply) {
        self.records.lock().push(record);
    }

    pub fn finish(&self, rc: RcCode) {
        *self.rc.lock() = rc;
        self.done.set();
    }

    /// Drain the accumulated record stream.
    pub fn take_records(&self) -> Vec<Reply> {
        std::mem::take(&mut *self.records.lock())
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    pub fn rc(&self) -> RcCode {
        *self.rc.lock()
    }

    /// Route one delivery: a ping reply is the terminator, anything else is
    /// a record.
    pub fn deliver(&self, reply: Reply) -> Delivery {
        match reply {
            Reply::ControlPingReply => {
                self.finish(RcCode::Ok);
                Delivery::Done
            }
            record => {
                self.push(record);
                Delivery::Pending
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Event core
// ---------------------------------------------------------------------------

/// Shared state of a persistent subscription: the event queue (guarded by
/// the per-command mutex) and the channel notified on arrival.
pub(crate) struct EventCore<E> {
    queue: Mutex<VecDeque<E>>,
    tx: tokio::sync::mpsc::UnboundedSender<E>,
    done: DoneFlag,
    ctx: std::sync::OnceLock<u64>,
}

impl<E> EventCore<E> {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<E>) -> Self {
        EventCore {
            queue: Mutex::new(VecDeque::new()),
            tx,
            done: DoneFlag::new(),
            ctx: std::sync::OnceLock::new(),
        }
    }

    /// Record the subscription context and complete for the writer; the
    /// command itself stays pending until retired.
    pub fn installed(&self, ctx: u64) {
        let _ = self.ctx.set(ctx);
        self.done.set();
    }

    pub fn ctx(&self) -> Option<u64> {
        self.ctx.get().copied()
    }

    /// Wake the waiter on disconnect; the subscription is simply gone.
    pub fn aborted(&self) {
        self.done.set();
    }

    pub fn push(&self, event: E) {
        self.queue.lock().push_back(event);
    }

    /// Inform the listener: drain the queued events into the channel.
    pub fn notify(&self) {
        let drained: Vec<E> = self.queue.lock().drain(..).collect();
        for event in drained {
            if self.tx.send(event).is_err() {
                break;
            }
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }
}
