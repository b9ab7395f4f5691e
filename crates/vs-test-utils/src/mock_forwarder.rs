//! An in-process forwarder for tests.
//!
//! Serves the vs-api frame protocol over a transport pair: answers RPCs,
//! allocates interface and ACL indices, streams dump records from a
//! preloadable state table, and can misbehave on demand (reject the next
//! request, go mute, drop the connection).

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use vs_api::{Reply, ReplyFrame, Request, RequestFrame, Transport, WireAclRule, transport_pair};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Default)]
struct State {
    /// bd id -> member interface indices
    bridge_domains: BTreeMap<u32, Vec<u32>>,
    /// interface index -> (name, admin_up)
    interfaces: BTreeMap<u32, (String, bool)>,
    /// interface index -> (src, dst, vni)
    tunnels: BTreeMap<u32, (IpAddr, IpAddr, u32)>,
    /// acl index -> (tag, rules)
    acls: BTreeMap<u32, (String, Vec<WireAclRule>)>,
    next_if_index: u32,
    next_acl_index: u32,
    events_ctx: Option<u64>,
    mute: bool,
    fail_next: bool,
}

impl State {
    fn alloc_if_index(&mut self) -> u32 {
        self.next_if_index += 1;
        self.next_if_index
    }

    fn alloc_acl_index(&mut self) -> u32 {
        let idx = self.next_acl_index;
        self.next_acl_index += 1;
        idx
    }
}

// ---------------------------------------------------------------------------
// MockForwarder
// ---------------------------------------------------------------------------

pub struct MockForwarder {
    state: Arc<Mutex<State>>,
    log: Arc<Mutex<Vec<Request>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl MockForwarder {
    /// Start a mock forwarder; returns it and the engine side of the
    /// transport.
    pub fn spawn() -> (MockForwarder, Transport) {
        let (engine_side, fwd_side) = transport_pair();
        let Transport { tx, rx } = fwd_side;
        let state = Arc::new(Mutex::new(State::default()));
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(serve(rx, tx.clone(), state.clone(), log.clone()));
        (
            MockForwarder {
                state,
                log,
                task: Mutex::new(Some(task)),
                tx: Mutex::new(Some(tx)),
            },
            engine_side,
        )
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<Request> {
        self.log.lock().clone()
    }

    pub fn clear_requests(&self) {
        self.log.lock().clear();
    }

    /// The requests that program state (pings, dumps and event toggles
    /// filtered out).
    pub fn writes(&self) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|r| {
                !matches!(
                    r,
                    Request::ControlPing
                        | Request::BridgeDomainDump
                        | Request::InterfaceDump
                        | Request::VxlanTunnelDump
                        | Request::AclDump
                        | Request::InterfaceEvents { .. }
                )
            })
            .collect()
    }

    /// Stop answering (requests are still logged).
    pub fn set_mute(&self, on: bool) {
        self.state.lock().mute = on;
    }

    /// Reject the next request with a non-zero retval.
    pub fn fail_next(&self) {
        self.state.lock().fail_next = true;
    }

    /// Drop the connection; the engine observes a peer disconnect.
    pub fn disconnect(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.tx.lock().take();
    }

    /// Push an interface state event to the engine's subscription, if one
    /// is installed.  Returns false when nobody subscribed.
    pub fn emit_interface_event(&self, sw_if_index: u32, admin_up: bool, deleted: bool) -> bool {
        let Some(ctx) = self.state.lock().events_ctx else {
            return false;
        };
        let Some(tx) = self.tx.lock().clone() else {
            return false;
        };
        let frame = ReplyFrame {
            ctx,
            msg: Reply::InterfaceEvent {
                sw_if_index,
                admin_up,
                deleted,
            },
        };
        tx.send(frame.encode().expect("encode event")).is_ok()
    }

    // -----------------------------------------------------------------------
    // Preloaded forwarder state (for populate scenarios)
    // -----------------------------------------------------------------------

    pub fn preload_interface(&self, sw_if_index: u32, name: &str, admin_up: bool) {
        let mut st = self.state.lock();
        st.interfaces
            .insert(sw_if_index, (name.to_owned(), admin_up));
        st.next_if_index = st.next_if_index.max(sw_if_index);
    }

    pub fn preload_bridge_domain(&self, bd_id: u32, members: Vec<u32>) {
        self.state.lock().bridge_domains.insert(bd_id, members);
    }

    pub fn preload_vxlan_tunnel(&self, sw_if_index: u32, src: IpAddr, dst: IpAddr, vni: u32) {
        let mut st = self.state.lock();
        st.tunnels.insert(sw_if_index, (src, dst, vni));
        st.next_if_index = st.next_if_index.max(sw_if_index);
    }

    pub fn preload_acl(&self, acl_index: u32, tag: &str, rules: Vec<WireAclRule>) {
        let mut st = self.state.lock();
        st.acls.insert(acl_index, (tag.to_owned(), rules));
        st.next_acl_index = st.next_acl_index.max(acl_index + 1);
    }

    /// Current bridge-domain membership, for assertions.
    pub fn bridge_domain_members(&self, bd_id: u32) -> Option<Vec<u32>> {
        self.state.lock().bridge_domains.get(&bd_id).cloned()
    }

    pub fn has_interface(&self, sw_if_index: u32) -> bool {
        self.state.lock().interfaces.contains_key(&sw_if_index)
    }
}

// ---------------------------------------------------------------------------
// Serve loop
// ---------------------------------------------------------------------------

async fn serve(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    state: Arc<Mutex<State>>,
    log: Arc<Mutex<Vec<Request>>>,
) {
    while let Some(bytes) = rx.recv().await {
        let Ok(frame) = RequestFrame::decode(&bytes) else {
            continue;
        };
        log.lock().push(frame.msg.clone());
        let replies = {
            let mut st = state.lock();
            if st.mute {
                continue;
            }
            handle(&mut st, frame.ctx, &frame.msg)
        };
        for msg in replies {
            let reply = ReplyFrame {
                ctx: frame.ctx,
                msg,
            };
            if tx.send(reply.encode().expect("encode reply")).is_err() {
                return;
            }
        }
    }
}

fn handle(st: &mut State, ctx: u64, req: &Request) -> Vec<Reply> {
    let retval = if std::mem::take(&mut st.fail_next) {
        -1
    } else {
        0
    };

    match req {
        Request::ControlPing => vec![Reply::ControlPingReply],

        Request::BridgeDomainAddDel { bd_id, is_add } => {
            if retval == 0 {
                if *is_add {
                    st.bridge_domains.entry(*bd_id).or_default();
                } else {
                    st.bridge_domains.remove(bd_id);
                }
            }
            vec![Reply::Ack { retval }]
        }

        Request::BridgeDomainDump => st
            .bridge_domains
            .iter()
            .map(|(bd_id, members)| Reply::BridgeDomainDetails {
                bd_id: *bd_id,
                members: members.clone(),
            })
            .collect(),

        Request::InterfaceCreate { name, .. } => {
            if retval != 0 {
                return vec![Reply::Created {
                    retval,
                    sw_if_index: 0,
                }];
            }
            let idx = st.alloc_if_index();
            st.interfaces.insert(idx, (name.clone(), false));
            vec![Reply::Created {
                retval: 0,
                sw_if_index: idx,
            }]
        }

        Request::InterfaceDelete { sw_if_index } => {
            st.interfaces.remove(sw_if_index);
            vec![Reply::Ack { retval }]
        }

        Request::InterfaceSetFlags {
            sw_if_index,
            admin_up,
        } => {
            if let Some(entry) = st.interfaces.get_mut(sw_if_index) {
                entry.1 = *admin_up;
            }
            vec![Reply::Ack { retval }]
        }

        Request::InterfaceDump => st
            .interfaces
            .iter()
            .map(|(idx, (name, admin_up))| Reply::InterfaceDetails {
                sw_if_index: *idx,
                name: name.clone(),
                admin_up: *admin_up,
            })
            .collect(),

        Request::InterfaceEvents { enable } => {
            st.events_ctx = if *enable { Some(ctx) } else { None };
            vec![]
        }

        Request::VlanSubifCreate {
            parent_sw_if_index,
            vlan_id,
        } => {
            if retval != 0 {
                return vec![Reply::Created {
                    retval,
                    sw_if_index: 0,
                }];
            }
            let parent_name = st
                .interfaces
                .get(parent_sw_if_index)
                .map(|(n, _)| n.clone())
                .unwrap_or_else(|| format!("if{parent_sw_if_index}"));
            let idx = st.alloc_if_index();
            st.interfaces
                .insert(idx, (format!("{parent_name}.{vlan_id}"), false));
            vec![Reply::Created {
                retval: 0,
                sw_if_index: idx,
            }]
        }

        Request::VlanSubifDelete { sw_if_index } | Request::TapDelete { sw_if_index } => {
            st.interfaces.remove(sw_if_index);
            vec![Reply::Ack { retval }]
        }

        Request::TapCreate { name, .. } => {
            if retval != 0 {
                return vec![Reply::Created {
                    retval,
                    sw_if_index: 0,
                }];
            }
            let idx = st.alloc_if_index();
            st.interfaces.insert(idx, (name.clone(), false));
            vec![Reply::Created {
                retval: 0,
                sw_if_index: idx,
            }]
        }

        Request::VxlanTunnelAddDel {
            is_add,
            src,
            dst,
            vni,
        } => {
            if *is_add {
                if retval != 0 {
                    return vec![Reply::Created {
                        retval,
                        sw_if_index: 0,
                    }];
                }
                let idx = st.alloc_if_index();
                st.tunnels.insert(idx, (*src, *dst, *vni));
                vec![Reply::Created {
                    retval: 0,
                    sw_if_index: idx,
                }]
            } else {
                st.tunnels
                    .retain(|_, (s, d, v)| !(*s == *src && *d == *dst && *v == *vni));
                vec![Reply::Ack { retval }]
            }
        }

        Request::VxlanTunnelDump => st
            .tunnels
            .iter()
            .map(|(idx, (src, dst, vni))| Reply::VxlanTunnelDetails {
                sw_if_index: *idx,
                src: *src,
                dst: *dst,
                vni: *vni,
            })
            .collect(),

        Request::AclAddReplace {
            acl_index,
            tag,
            rules,
        } => {
            if retval != 0 {
                return vec![Reply::AclIndex {
                    retval,
                    acl_index: 0,
                }];
            }
            let idx = if *acl_index == !0 {
                st.alloc_acl_index()
            } else {
                *acl_index
            };
            st.acls.insert(idx, (tag.clone(), rules.clone()));
            vec![Reply::AclIndex {
                retval: 0,
                acl_index: idx,
            }]
        }

        Request::AclDel { acl_index } => {
            st.acls.remove(acl_index);
            vec![Reply::Ack { retval }]
        }

        Request::AclDump => st
            .acls
            .iter()
            .map(|(idx, (tag, rules))| Reply::AclDetails {
                acl_index: *idx,
                tag: tag.clone(),
                rules: rules.clone(),
            })
            .collect(),

        Request::L2InterfaceSetBridge {
            sw_if_index,
            bd_id,
            enable,
        } => {
            if retval == 0 {
                let members = st.bridge_domains.entry(*bd_id).or_default();
                if *enable {
                    if !members.contains(sw_if_index) {
                        members.push(*sw_if_index);
                    }
                } else {
                    members.retain(|m| m != sw_if_index);
                }
            }
            vec![Reply::Ack { retval }]
        }

        Request::LldpBind { .. }
        | Request::LldpUnbind { .. }
        | Request::ProxyArpAddDel { .. } => vec![Reply::Ack { retval }],
    }
}
