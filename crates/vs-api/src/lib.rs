// vs-api: Forwarder RPC message types, framing and transport.
//
// Every frame on the wire is a JSON-encoded envelope carrying a correlation
// context and a typed payload.  The engine never inspects payload internals
// beyond what the issuing command extracts; correlation is by `ctx` alone.
//
// Dumps are terminated by a control-ping sentinel: the dump request and the
// ping share one context, and the `ControlPingReply` routed to that context
// marks the end of the record stream.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Shared field types
// ---------------------------------------------------------------------------

/// An IP prefix as carried on the wire (address + mask length).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Prefix {
    pub addr: IpAddr,
    pub len: u8,
}

impl std::fmt::Display for Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

/// A 48-bit hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// One ACL match/action entry as carried on the wire.
///
/// Port range fields double as ICMP type/code ranges when `proto` is
/// ICMP/ICMPv6; ranges are inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAclRule {
    pub priority: u32,
    pub permit: bool,
    pub src: Prefix,
    pub dst: Prefix,
    /// IANA L4 protocol number; 0 means ignore L4 entirely.
    pub proto: u8,
    pub srcport_first: u16,
    pub srcport_last: u16,
    pub dstport_first: u16,
    pub dstport_last: u16,
    pub tcp_flags_mask: u8,
    pub tcp_flags_value: u8,
}

// ---------------------------------------------------------------------------
// Requests (engine -> forwarder)
// ---------------------------------------------------------------------------

/// All request payloads in the forwarder RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request_kind")]
#[serde(rename_all = "snake_case")]
pub enum Request {
    /// Liveness probe; also the dump stream terminator.
    ControlPing,
    BridgeDomainAddDel {
        bd_id: u32,
        is_add: bool,
    },
    BridgeDomainDump,
    /// Create a software interface; the reply allocates the index.
    InterfaceCreate {
        name: String,
        kind: String,
    },
    InterfaceDelete {
        sw_if_index: u32,
    },
    InterfaceSetFlags {
        sw_if_index: u32,
        admin_up: bool,
    },
    InterfaceDump,
    /// Enable/disable the interface state event stream for this context.
    InterfaceEvents {
        enable: bool,
    },
    VlanSubifCreate {
        parent_sw_if_index: u32,
        vlan_id: u16,
    },
    VlanSubifDelete {
        sw_if_index: u32,
    },
    TapCreate {
        name: String,
        prefix: Option<Prefix>,
        mac: Option<MacAddr>,
    },
    TapDelete {
        sw_if_index: u32,
    },
    VxlanTunnelAddDel {
        is_add: bool,
        src: IpAddr,
        dst: IpAddr,
        vni: u32,
    },
    VxlanTunnelDump,
    /// Replace the whole rule list; `acl_index == !0` allocates a new ACL.
    AclAddReplace {
        acl_index: u32,
        tag: String,
        rules: Vec<WireAclRule>,
    },
    AclDel {
        acl_index: u32,
    },
    AclDump,
    /// Add/remove an interface to/from a bridge domain.
    L2InterfaceSetBridge {
        sw_if_index: u32,
        bd_id: u32,
        enable: bool,
    },
    LldpBind {
        sw_if_index: u32,
        port_desc: String,
    },
    LldpUnbind {
        sw_if_index: u32,
    },
    ProxyArpAddDel {
        low: Ipv4Addr,
        high: Ipv4Addr,
        is_add: bool,
    },
}

// ---------------------------------------------------------------------------
// Replies (forwarder -> engine)
// ---------------------------------------------------------------------------

/// All reply payloads, including streamed dump records and async events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    /// Plain acknowledgement; `retval == 0` is success.
    Ack {
        retval: i32,
    },
    /// Acknowledgement allocating an interface index.
    Created {
        retval: i32,
        sw_if_index: u32,
    },
    /// Acknowledgement allocating an ACL index.
    AclIndex {
        retval: i32,
        acl_index: u32,
    },
    ControlPingReply,
    BridgeDomainDetails {
        bd_id: u32,
        members: Vec<u32>,
    },
    InterfaceDetails {
        sw_if_index: u32,
        name: String,
        admin_up: bool,
    },
    VxlanTunnelDetails {
        sw_if_index: u32,
        src: IpAddr,
        dst: IpAddr,
        vni: u32,
    },
    AclDetails {
        acl_index: u32,
        tag: String,
        rules: Vec<WireAclRule>,
    },
    /// Unsolicited interface state change, routed to the subscription context.
    InterfaceEvent {
        sw_if_index: u32,
        admin_up: bool,
        deleted: bool,
    },
}

// ---------------------------------------------------------------------------
// Correlation envelopes + frame codec
// ---------------------------------------------------------------------------

/// A correlated request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub ctx: u64,
    pub msg: Request,
}

/// A correlated reply frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub ctx: u64,
    pub msg: Reply,
}

/// Frame codec failure.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame encode: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("frame decode: {0}")]
    Decode(#[source] serde_json::Error),
}

impl RequestFrame {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

impl ReplyFrame {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// One side of a duplex byte-frame channel.
///
/// The engine holds one side, the forwarder (or a mock) holds the other.
/// Dropping either side is observed by the peer as a disconnect.
pub struct Transport {
    pub tx: mpsc::UnboundedSender<Vec<u8>>,
    pub rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Build a connected transport pair: `(engine_side, forwarder_side)`.
pub fn transport_pair() -> (Transport, Transport) {
    let (etx, frx) = mpsc::unbounded_channel();
    let (ftx, erx) = mpsc::unbounded_channel();
    (
        Transport { tx: etx, rx: erx },
        Transport { tx: ftx, rx: frx },
    )
}
