// vs-om: the object model and reconciliation engine for the forwarder.
//
// A client expresses desired forwarding state as typed objects and commits
// them under its own key; the engine interns one canonical instance per
// semantic key, drives the forwarder to match via the command queue,
// replays the model on reconnect, pulls existing forwarder state in on
// populate, and garbage-collects objects no client references any more.

pub mod acl;
pub mod arp_proxy;
pub mod bridge_domain;
pub mod cmd;
pub mod config;
pub mod hw;
pub mod inspect;
pub mod interface;
pub mod l2_binding;
pub mod lldp_binding;
pub mod object_base;
pub mod om;
pub mod singular_db;
pub mod sub_interface;
pub mod tap_interface;
pub mod types;
pub mod vxlan_tunnel;

mod client_db;

use om::Listener;
use std::sync::Arc;

/// The event handlers of the built-in families, registered by `Om::new`.
pub(crate) fn builtin_listeners() -> Vec<Arc<dyn Listener>> {
    vec![
        Arc::new(interface::EventHandler),
        Arc::new(bridge_domain::EventHandler),
        Arc::new(vxlan_tunnel::EventHandler),
        Arc::new(acl::EventHandler),
        Arc::new(l2_binding::EventHandler),
        Arc::new(lldp_binding::EventHandler),
        Arc::new(arp_proxy::EventHandler),
    ]
}
