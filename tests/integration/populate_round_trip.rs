//! Populate: the forwarder's existing state is read into the model under a
//! client key without a single create reaching the wire.

use vs_api::{Prefix, WireAclRule};
use vs_om::interface::{AdminState, Interface};
use vs_om::om::Om;
use vs_om::types::{Handle, RcCode};
use vs_om::vxlan_tunnel::Endpoint;
use vs_test_utils::MockForwarder;

fn any_rule() -> WireAclRule {
    WireAclRule {
        priority: 10,
        permit: true,
        src: Prefix {
            addr: "10.0.0.0".parse().unwrap(),
            len: 8,
        },
        dst: Prefix {
            addr: "0.0.0.0".parse().unwrap(),
            len: 0,
        },
        proto: 0,
        srcport_first: 0,
        srcport_last: 65535,
        dstport_first: 0,
        dstport_last: 65535,
        tcp_flags_mask: 0,
        tcp_flags_value: 0,
    }
}

#[tokio::test]
async fn populate_reads_state_without_reprogramming() {
    vs_test_utils::init_tracing();
    let (mock, transport) = MockForwarder::spawn();

    // forwarder state that predates this engine instance
    mock.preload_interface(5, "GigabitEthernet0/8/0", true);
    mock.preload_bridge_domain(9, vec![5]);
    mock.preload_vxlan_tunnel(
        7,
        "10.0.0.1".parse().unwrap(),
        "10.0.0.2".parse().unwrap(),
        42,
    );
    mock.preload_acl(3, "fw0", vec![any_rule()]);

    let om = Om::new();
    assert_eq!(om.connect(transport).await, RcCode::Ok);
    mock.clear_requests();

    om.populate("client-a").await;

    // the model now mirrors the forwarder
    let itf = om.find_interface("GigabitEthernet0/8/0").expect("interface");
    assert!(itf.is_programmed());
    assert_eq!(itf.handle(), Handle(5));
    assert_eq!(itf.admin_state(), AdminState::Up);

    assert!(om.find_bridge_domain(9).is_some());

    let binding = om
        .find_l2_binding("GigabitEthernet0/8/0")
        .expect("membership became a binding");
    assert_eq!(binding.bd_id(), 9);

    let tunnel = om
        .find_vxlan_tunnel(&Endpoint::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            42,
        ))
        .expect("tunnel by endpoint");
    assert!(tunnel.is_programmed());
    assert_eq!(tunnel.handle(), Handle(7));
    assert!(
        om.find_interface("vxlan-tunnel-itf-10.0.0.1-10.0.0.2:42")
            .is_some()
    );

    let acl = om.find_acl("fw0").expect("acl");
    assert!(acl.is_programmed());
    assert_eq!(acl.acl_index(), Handle(3));
    assert_eq!(acl.rules().len(), 1);

    // the member interface resolves through the handle directory
    let by_handle = Interface::find_by_handle(&om, Handle(5)).unwrap();
    assert_eq!(by_handle.name(), "GigabitEthernet0/8/0");

    // and the forwarder received no programming at all
    assert_eq!(mock.writes(), vec![], "populate must not re-program");

    // client-a owns: interface, bridge domain, binding, tunnel, acl
    assert_eq!(om.client_ref_count("client-a"), 5);
}

/// After populate, a client re-committing the discovered state writes
/// nothing: the model and the forwarder already agree.
#[tokio::test]
async fn recommit_after_populate_is_a_no_op() {
    vs_test_utils::init_tracing();
    let (mock, transport) = MockForwarder::spawn();
    mock.preload_interface(4, "GigabitEthernet0/9/0", true);

    let om = Om::new();
    assert_eq!(om.connect(transport).await, RcCode::Ok);
    om.populate("client-a").await;
    mock.clear_requests();

    let desired = Interface::new(
        "GigabitEthernet0/9/0",
        vs_om::interface::Type::Ethernet,
        AdminState::Up,
    );
    assert_eq!(om.commit("client-a", &desired).await, RcCode::Ok);
    assert_eq!(mock.writes(), vec![]);
}
