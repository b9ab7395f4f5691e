//! VXLAN tunnels are reachable both by endpoint triple and by their
//! synthesized interface name, resolving to one canonical instance.

use std::sync::Arc;
use vs_api::Request;
use vs_om::interface::Interface;
use vs_om::om::Om;
use vs_om::types::RcCode;
use vs_om::vxlan_tunnel::Endpoint;
use vs_test_utils::MockForwarder;

async fn om_with_mock() -> (Om, MockForwarder) {
    vs_test_utils::init_tracing();
    let (mock, transport) = MockForwarder::spawn();
    let om = Om::new();
    assert_eq!(om.connect(transport).await, RcCode::Ok);
    mock.clear_requests();
    (om, mock)
}

#[tokio::test]
async fn tunnel_is_reachable_by_endpoint_and_by_name() {
    let (om, mock) = om_with_mock().await;

    let src = "10.0.0.1".parse().unwrap();
    let dst = "10.0.0.2".parse().unwrap();
    let tunnel = Interface::new_vxlan_tunnel(src, dst, 42);
    assert_eq!(om.commit("client-a", &tunnel).await, RcCode::Ok);

    assert!(
        mock.writes().iter().any(|r| matches!(
            r,
            Request::VxlanTunnelAddDel {
                is_add: true,
                vni: 42,
                ..
            }
        )),
        "forwarder must receive the tunnel add"
    );

    let by_ep = om
        .find_vxlan_tunnel(&Endpoint::new(src, dst, 42))
        .expect("reachable by endpoint");
    let by_name = om
        .find_interface("vxlan-tunnel-itf-10.0.0.1-10.0.0.2:42")
        .expect("reachable by synthesized name");
    assert!(Arc::ptr_eq(&by_ep, &by_name));

    assert!(by_ep.is_programmed());
    let handle = by_ep.handle();
    assert!(handle.is_valid());

    // the handle directory resolves back to the same instance
    let by_handle = Interface::find_by_handle(&om, handle).expect("reachable by handle");
    assert!(Arc::ptr_eq(&by_ep, &by_handle));
}

/// Committing the canonical instance itself is a no-op write.
#[tokio::test]
async fn recommitting_the_canonical_instance_writes_nothing() {
    let (om, mock) = om_with_mock().await;

    let src = "10.0.0.1".parse().unwrap();
    let dst = "10.0.0.9".parse().unwrap();
    assert_eq!(
        om.commit("client-a", &Interface::new_vxlan_tunnel(src, dst, 7))
            .await,
        RcCode::Ok
    );
    let before = mock.writes().len();

    {
        let canonical = om.find_vxlan_tunnel(&Endpoint::new(src, dst, 7)).unwrap();
        assert_eq!(om.commit("client-b", &*canonical).await, RcCode::Ok);
    }
    assert_eq!(mock.writes().len(), before, "no new programming");
    assert_eq!(om.client_ref_count("client-b"), 1);
}

/// Tearing the tunnel down scrubs both identities.
#[tokio::test]
async fn teardown_scrubs_both_keys() {
    let (om, mock) = om_with_mock().await;

    let src = "10.0.1.1".parse().unwrap();
    let dst = "10.0.1.2".parse().unwrap();
    assert_eq!(
        om.commit("client-a", &Interface::new_vxlan_tunnel(src, dst, 11))
            .await,
        RcCode::Ok
    );
    let handle = {
        let t = om.find_vxlan_tunnel(&Endpoint::new(src, dst, 11)).unwrap();
        t.handle()
    };

    om.remove("client-a").await;

    assert!(
        mock.writes()
            .iter()
            .any(|r| matches!(r, Request::VxlanTunnelAddDel { is_add: false, .. })),
        "the delete must reach the forwarder"
    );
    assert!(om.find_vxlan_tunnel(&Endpoint::new(src, dst, 11)).is_none());
    assert!(
        om.find_interface("vxlan-tunnel-itf-10.0.1.1-10.0.1.2:11")
            .is_none()
    );
    assert_eq!(Interface::find_by_handle(&om, handle).map(|i| i.name().to_owned()), None);
}
