//! Mark-and-sweep reconciliation: a client re-declares its full desired
//! state between mark and sweep, and everything it did not re-commit is
//! dropped (and swept from the forwarder iff it held the last reference).

use vs_api::Request;
use vs_om::bridge_domain::BridgeDomain;
use vs_om::om::Om;
use vs_om::types::RcCode;
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
async fn sweep_drops_everything_not_recommitted() {
    let (om, mock) = om_with_mock().await;

    assert_eq!(om.commit("client-a", &BridgeDomain::new(7)).await, RcCode::Ok);
    assert_eq!(om.commit("client-a", &BridgeDomain::new(8)).await, RcCode::Ok);
    assert_eq!(om.client_ref_count("client-a"), 2);
    mock.clear_requests();

    om.mark("client-a").await;
    // the new desired state set names only bd 7
    assert_eq!(om.commit("client-a", &BridgeDomain::new(7)).await, RcCode::Ok);
    om.sweep("client-a").await;

    assert_eq!(om.client_ref_count("client-a"), 1);
    assert!(om.find_bridge_domain(7).is_some());
    assert!(om.find_bridge_domain(8).is_none());
    assert_eq!(
        mock.writes(),
        vec![Request::BridgeDomainAddDel {
            bd_id: 8,
            is_add: false
        }],
        "only the un-recommitted domain is deleted"
    );
}

/// Sweeping one client's stale reference must not destroy an object
/// another client still holds.
#[tokio::test]
async fn sweep_respects_other_clients_references() {
    let (om, mock) = om_with_mock().await;

    assert_eq!(om.commit("client-a", &BridgeDomain::new(5)).await, RcCode::Ok);
    assert_eq!(om.commit("client-b", &BridgeDomain::new(5)).await, RcCode::Ok);
    mock.clear_requests();

    om.mark("client-a").await;
    om.sweep("client-a").await;

    assert_eq!(om.client_ref_count("client-a"), 0);
    assert!(om.find_bridge_domain(5).is_some(), "client-b still owns it");
    assert_eq!(mock.writes(), vec![]);

    om.remove("client-b").await;
    assert_eq!(
        mock.writes(),
        vec![Request::BridgeDomainAddDel {
            bd_id: 5,
            is_add: false
        }]
    );
    assert!(om.find_bridge_domain(5).is_none());
}

/// A mark with no commits in between clears the whole set.
#[tokio::test]
async fn mark_then_immediate_sweep_empties_the_client() {
    let (om, mock) = om_with_mock().await;

    assert_eq!(om.commit("client-a", &BridgeDomain::new(1)).await, RcCode::Ok);
    assert_eq!(om.commit("client-a", &BridgeDomain::new(2)).await, RcCode::Ok);
    mock.clear_requests();

    om.mark("client-a").await;
    om.sweep("client-a").await;

    assert_eq!(om.client_ref_count("client-a"), 0);
    assert!(om.find_bridge_domain(1).is_none());
    assert!(om.find_bridge_domain(2).is_none());
    let deletes = mock
        .writes()
        .into_iter()
        .filter(|r| matches!(r, Request::BridgeDomainAddDel { is_add: false, .. }))
        .count();
    assert_eq!(deletes, 2);
}
