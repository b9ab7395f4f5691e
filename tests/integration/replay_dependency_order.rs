//! Replay after reconnect: the whole model is pushed back to the
//! forwarder, lower dependency levels strictly before higher ones.

use vs_api::Request;
use vs_om::bridge_domain::BridgeDomain;
use vs_om::interface::{AdminState, Interface, Type};
use vs_om::l2_binding::L2Binding;
use vs_om::om::Om;
use vs_om::types::RcCode;
use vs_test_utils::MockForwarder;

fn position(writes: &[Request], pred: impl Fn(&Request) -> bool) -> usize {
    writes
        .iter()
        .position(pred)
        .expect("expected request missing from replay")
}

#[tokio::test]
async fn replay_restores_in_dependency_order() {
    vs_test_utils::init_tracing();
    let (mock1, transport1) = MockForwarder::spawn();
    let om = Om::new();
    assert_eq!(om.connect(transport1).await, RcCode::Ok);

    let itf = Interface::new("eth0", Type::Ethernet, AdminState::Up);
    let bd = BridgeDomain::new(7);
    let binding = L2Binding::new(&itf, &bd);
    assert_eq!(om.commit("client-a", &itf).await, RcCode::Ok);
    assert_eq!(om.commit("client-a", &bd).await, RcCode::Ok);
    assert_eq!(om.commit("client-a", &binding).await, RcCode::Ok);
    assert_eq!(om.epoch(), 0);

    // forwarder restart
    mock1.disconnect();
    let (mock2, transport2) = MockForwarder::spawn();
    assert_eq!(om.connect(transport2).await, RcCode::Ok);
    om.replay().await;
    assert_eq!(om.epoch(), 1);

    let writes = mock2.writes();
    let create = position(&writes, |r| matches!(r, Request::InterfaceCreate { .. }));
    let bd_add = position(&writes, |r| {
        matches!(
            r,
            Request::BridgeDomainAddDel {
                bd_id: 7,
                is_add: true
            }
        )
    });
    let bind = position(&writes, |r| {
        matches!(
            r,
            Request::L2InterfaceSetBridge {
                bd_id: 7,
                enable: true,
                ..
            }
        )
    });
    assert!(
        create < bd_add && bd_add < bind,
        "dependency order violated: {writes:?}"
    );

    // exactly one create per live object, no extras
    let creates = writes
        .iter()
        .filter(|r| matches!(r, Request::InterfaceCreate { .. }))
        .count();
    let bd_adds = writes
        .iter()
        .filter(|r| matches!(r, Request::BridgeDomainAddDel { is_add: true, .. }))
        .count();
    let binds = writes
        .iter()
        .filter(|r| matches!(r, Request::L2InterfaceSetBridge { enable: true, .. }))
        .count();
    assert_eq!((creates, bd_adds, binds), (1, 1, 1));

    // the interface picked up the restarted forwarder's index, and the
    // binding was programmed against it
    let itf = om.find_interface("eth0").unwrap();
    assert!(itf.is_programmed());
    assert_eq!(
        mock2.bridge_domain_members(7),
        Some(vec![itf.handle().value()])
    );
}

/// A model committed while disconnected reaches the forwarder on the first
/// replay after connecting.
#[tokio::test]
async fn replay_retries_transient_failures() {
    vs_test_utils::init_tracing();
    let om = Om::new();

    // no connection: the write fails with TIMEOUT but the desired state
    // stays in the model
    let rc = om.commit("client-a", &BridgeDomain::new(3)).await;
    assert_eq!(rc, RcCode::Timeout);
    assert!(om.find_bridge_domain(3).is_some());

    let (mock, transport) = MockForwarder::spawn();
    assert_eq!(om.connect(transport).await, RcCode::Ok);
    om.replay().await;

    assert_eq!(
        mock.writes(),
        vec![Request::BridgeDomainAddDel {
            bd_id: 3,
            is_add: true
        }]
    );
    assert!(om.find_bridge_domain(3).unwrap().is_programmed());
}
