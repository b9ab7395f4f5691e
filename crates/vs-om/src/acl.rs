//! Access control lists: an ordered rule set applied as a unit.
//!
//! The forwarder replaces the whole rule list on every update; the model
//! diffs the desired set against the canonical one and re-writes only when
//! they differ or the list has never been programmed.

use crate::cmd::{Cmd, CmdKind, DumpCore, RpcCore, ack_rc};
use crate::hw::{Connection, Hw, HwItem, SharedItem, clone_cell, shared};
use crate::object_base::{ObjectBase, OmObject};
use crate::om::{Listener, Om, PopulateCtx, PopulateFuture};
use crate::singular_db::SingularDb;
use crate::types::{Dependency, Handle, RcCode};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tracing::{debug, warn};
use vs_api::{Prefix, Reply, Request, WireAclRule};

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

/// Action taken on a rule match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Action {
    Deny,
    Permit,
}

impl Action {
    pub fn from_permit(permit: bool) -> Action {
        if permit { Action::Permit } else { Action::Deny }
    }

    pub fn is_permit(self) -> bool {
        self == Action::Permit
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Action::Deny => "deny",
            Action::Permit => "permit",
        })
    }
}

/// One L3 match/action entry.  Rules order by priority first, so a list's
/// rule set iterates in application order.
///
/// The port range fields double as ICMP type/code ranges when `proto` is
/// ICMP/ICMPv6; ranges are inclusive.  `proto == 0` ignores L4 entirely.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct L3Rule {
    priority: u32,
    action: Action,
    src: Prefix,
    dst: Prefix,
    proto: u8,
    srcport_first: u16,
    srcport_last: u16,
    dstport_first: u16,
    dstport_last: u16,
    tcp_flags_mask: u8,
    tcp_flags_value: u8,
}

impl L3Rule {
    /// A rule matching any L4 on the given prefixes.
    pub fn new(priority: u32, action: Action, src: Prefix, dst: Prefix) -> L3Rule {
        L3Rule {
            priority,
            action,
            src,
            dst,
            proto: 0,
            srcport_first: 0,
            srcport_last: u16::MAX,
            dstport_first: 0,
            dstport_last: u16::MAX,
            tcp_flags_mask: 0,
            tcp_flags_value: 0,
        }
    }

    /// Match one IANA L4 protocol (1 = ICMP, 6 = TCP, 17 = UDP, 58 = ICMPv6).
    pub fn with_proto(mut self, proto: u8) -> L3Rule {
        self.proto = proto;
        self
    }

    pub fn with_src_ports(mut self, first: u16, last: u16) -> L3Rule {
        self.srcport_first = first;
        self.srcport_last = last;
        self
    }

    pub fn with_dst_ports(mut self, first: u16, last: u16) -> L3Rule {
        self.dstport_first = first;
        self.dstport_last = last;
        self
    }

    /// Match when packet TCP flags ANDed with `mask` equal `value`.
    pub fn with_tcp_flags(mut self, mask: u8, value: u8) -> L3Rule {
        self.tcp_flags_mask = mask;
        self.tcp_flags_value = value;
        self
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn action(&self) -> Action {
        self.action
    }

    fn to_wire(&self) -> WireAclRule {
        WireAclRule {
            priority: self.priority,
            permit: self.action.is_permit(),
            src: self.src,
            dst: self.dst,
            proto: self.proto,
            srcport_first: self.srcport_first,
            srcport_last: self.srcport_last,
            dstport_first: self.dstport_first,
            dstport_last: self.dstport_last,
            tcp_flags_mask: self.tcp_flags_mask,
            tcp_flags_value: self.tcp_flags_value,
        }
    }

    fn from_wire(rule: &WireAclRule) -> L3Rule {
        L3Rule {
            priority: rule.priority,
            action: Action::from_permit(rule.permit),
            src: rule.src,
            dst: rule.dst,
            proto: rule.proto,
            srcport_first: rule.srcport_first,
            srcport_last: rule.srcport_last,
            dstport_first: rule.dstport_first,
            dstport_last: rule.dstport_last,
            tcp_flags_mask: rule.tcp_flags_mask,
            tcp_flags_value: rule.tcp_flags_value,
        }
    }
}

impl std::fmt::Display for L3Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "l3-rule:[{} {} src:{} dst:{} proto:{}]",
            self.priority, self.action, self.src, self.dst, self.proto
        )
    }
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

struct AclLinks {
    hw: Hw,
    db: Arc<SingularDb<String, AclList>>,
}

/// An ACL: an ordered sequence of rules keyed by its tag.
pub struct AclList {
    tag: String,
    rules: Mutex<BTreeSet<L3Rule>>,
    /// The forwarder-allocated ACL index.
    hdl: SharedItem<Handle>,
    links: OnceLock<AclLinks>,
}

impl AclList {
    /// Desired state for an empty list; build it up with `insert`.
    pub fn new(tag: impl Into<String>) -> AclList {
        AclList {
            tag: tag.into(),
            rules: Mutex::new(BTreeSet::new()),
            hdl: shared(HwItem::new(Handle::INVALID)),
            links: OnceLock::new(),
        }
    }

    /// A list read out of the forwarder.
    pub(crate) fn discovered(acl_index: Handle, tag: &str, rules: Vec<L3Rule>) -> AclList {
        AclList {
            tag: tag.to_owned(),
            rules: Mutex::new(rules.into_iter().collect()),
            hdl: shared(HwItem::with_rc(acl_index, RcCode::Ok)),
            links: OnceLock::new(),
        }
    }

    pub fn insert(&self, rule: L3Rule) {
        self.rules.lock().insert(rule);
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The rules in application order.
    pub fn rules(&self) -> Vec<L3Rule> {
        self.rules.lock().iter().cloned().collect()
    }

    pub fn acl_index(&self) -> Handle {
        *self.hdl.lock().data()
    }

    pub fn is_programmed(&self) -> bool {
        self.hdl.lock().is_ok()
    }

    /// Find the canonical list by tag.
    pub fn find(om: &Om, tag: &str) -> Option<Arc<AclList>> {
        om.db.acls.find(&tag.to_owned())
    }

    fn wire_rules(&self) -> Vec<WireAclRule> {
        self.rules.lock().iter().map(L3Rule::to_wire).collect()
    }

    fn update_cmd(&self) -> Arc<AclUpdateCmd> {
        Arc::new(AclUpdateCmd {
            core: RpcCore::new(self.hdl.clone()),
            tag: self.tag.clone(),
            rules: self.wire_rules(),
        })
    }
}

impl std::fmt::Display for AclList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "acl-list:[{} {} rules:{}]",
            self.tag,
            self.hdl.lock().clone(),
            self.rules.lock().len()
        )
    }
}

impl ObjectBase for AclList {
    fn sweep(&self) {
        let Some(links) = self.links.get() else {
            return;
        };
        if self.hdl.lock().is_ok() {
            links.hw.enqueue(Arc::new(AclDeleteCmd {
                core: RpcCore::new(self.hdl.clone()),
            }));
        }
    }

    fn replay(&self) {
        let Some(links) = self.links.get() else {
            return;
        };
        if self.hdl.lock().rc().needs_replay() {
            links.hw.enqueue(self.update_cmd());
        }
    }
}

impl OmObject for AclList {
    const FAMILY: &'static str = "acl-list";

    fn singular(&self, om: &Om) -> Arc<AclList> {
        om.db.acls.find_or_add(self.tag.clone(), || {
            let list = AclList {
                tag: self.tag.clone(),
                rules: Mutex::new(self.rules.lock().clone()),
                hdl: clone_cell(&self.hdl),
                links: OnceLock::new(),
            };
            let _ = list.links.set(AclLinks {
                hw: om.hw().clone(),
                db: om.db.acls.clone(),
            });
            list
        })
    }

    fn update(&self, desired: &Self) {
        let Some(links) = self.links.get() else {
            return;
        };
        let need = if std::ptr::eq(self, desired) {
            // committing the canonical itself: only the rc can demand a write
            !self.hdl.lock().is_ok()
        } else {
            let desired_rules = desired.rules.lock();
            let mut mine = self.rules.lock();
            let need = !self.hdl.lock().is_ok() || *mine != *desired_rules;
            if need {
                *mine = desired_rules.clone();
            }
            need
        };
        if need {
            links.hw.enqueue(self.update_cmd());
        }
    }
}

impl Drop for AclList {
    fn drop(&mut self) {
        let Some(links) = self.links.get() else {
            return;
        };
        self.sweep();
        links.db.release(&self.tag);
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Whole-list replace; the first write allocates the ACL index.
pub(crate) struct AclUpdateCmd {
    core: RpcCore<Handle>,
    tag: String,
    rules: Vec<WireAclRule>,
}

impl PartialEq for AclUpdateCmd {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag && self.rules == other.rules
    }
}

impl Cmd for AclUpdateCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Rpc
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        let acl_index = self.core.item.lock().data().value();
        conn.send(
            ctx,
            Request::AclAddReplace {
                acl_index,
                tag: self.tag.clone(),
                rules: self.rules.clone(),
            },
        )
    }

    fn deliver(&self, reply: Reply) -> crate::cmd::Delivery {
        match reply {
            Reply::AclIndex { retval, acl_index } if retval == 0 => {
                self.core.complete_with(RcCode::Ok, |item| {
                    item.set_data(Handle(acl_index));
                });
            }
            other => {
                warn!(cmd = %self, reply = ?other, "acl update rejected");
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

impl std::fmt::Display for AclUpdateCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "acl-update: {} {} rules:{}",
            self.tag,
            self.core.item.lock().clone(),
            self.rules.len()
        )
    }
}

pub(crate) struct AclDeleteCmd {
    core: RpcCore<Handle>,
}

impl Cmd for AclDeleteCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Rpc
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        let acl_index = self.core.item.lock().data().value();
        conn.send(ctx, Request::AclDel { acl_index })
    }

    fn deliver(&self, reply: Reply) -> crate::cmd::Delivery {
        let rc = ack_rc(&reply);
        if !rc.is_success() {
            warn!(cmd = %self, "acl delete rejected");
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

impl std::fmt::Display for AclDeleteCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "acl-delete: {}", self.core.item.lock().clone())
    }
}

pub(crate) struct AclDumpCmd {
    core: DumpCore,
}

impl AclDumpCmd {
    pub fn new() -> Arc<Self> {
        Arc::new(AclDumpCmd {
            core: DumpCore::new(),
        })
    }

    pub fn take_records(&self) -> Vec<Reply> {
        self.core.take_records()
    }
}

impl Cmd for AclDumpCmd {
    fn kind(&self) -> CmdKind {
        CmdKind::Dump
    }

    fn issue(&self, conn: &Connection, ctx: u64) -> RcCode {
        self.core.issue(conn, ctx, Request::AclDump)
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

impl std::fmt::Display for AclDumpCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("acl-dump")
    }
}

// ---------------------------------------------------------------------------
// Event handler
// ---------------------------------------------------------------------------

pub(crate) struct EventHandler;

impl Listener for EventHandler {
    fn order(&self) -> Dependency {
        Dependency::Acl
    }

    fn handle_populate<'a>(
        &'a self,
        ctx: &'a PopulateCtx<'a>,
        client: &'a str,
    ) -> PopulateFuture<'a> {
        Box::pin(async move {
            let dump = AclDumpCmd::new();
            ctx.hw().enqueue(dump.clone());
            ctx.hw().write().await;

            for record in dump.take_records() {
                let Reply::AclDetails {
                    acl_index,
                    tag,
                    rules,
                } = record
                else {
                    continue;
                };
                let list = AclList::discovered(
                    Handle(acl_index),
                    &tag,
                    rules.iter().map(L3Rule::from_wire).collect(),
                );
                debug!(acl = %list, "dump");
                ctx.commit(client, &list).await;
            }
        })
    }

    fn handle_replay(&self, om: &Om) {
        om.db.acls.replay();
    }

    fn show(&self, om: &Om, out: &mut String) {
        om.db.acls.dump(out);
    }

    fn tags(&self) -> &'static [&'static str] {
        &["acl"]
    }

    fn description(&self) -> &'static str {
        "Access Control Lists"
    }
}
