//! Bridge-domain lifecycle against the mock forwarder: single commit,
//! idempotent re-commit, shared ownership across clients, and rejection.

use std::sync::Arc;
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
    // drop the connect-time ping from the log
    mock.clear_requests();
    (om, mock)
}

/// One commit programs the forwarder once and leaves one canonical entry.
#[tokio::test]
async fn commit_programs_the_forwarder_once() {
    let (om, mock) = om_with_mock().await;

    let rc = om.commit("client-a", &BridgeDomain::new(7)).await;
    assert_eq!(rc, RcCode::Ok);

    assert_eq!(
        mock.writes(),
        vec![Request::BridgeDomainAddDel {
            bd_id: 7,
            is_add: true
        }]
    );

    let bd = om.find_bridge_domain(7).expect("canonical bridge domain");
    assert!(bd.is_programmed());
    // both lookups observe the same canonical instance
    let again = om.find_bridge_domain(7).unwrap();
    assert!(Arc::ptr_eq(&bd, &again));

    // the introspection sink renders the family under its tags
    let shown = om.show("bd").expect("bd tag registered");
    assert!(shown.contains("bridge-domain:["));
    assert_eq!(om.show("bridge"), Some(shown));
    assert!(om.show("no-such-tag").is_none());
    assert!(om.dump_clients().contains("client: client-a"));
}

/// Re-committing identical desired state produces no further writes.
#[tokio::test]
async fn recommit_is_idempotent() {
    let (om, mock) = om_with_mock().await;

    assert_eq!(om.commit("client-a", &BridgeDomain::new(7)).await, RcCode::Ok);
    assert_eq!(om.commit("client-a", &BridgeDomain::new(7)).await, RcCode::Ok);

    let adds = mock
        .writes()
        .into_iter()
        .filter(|r| matches!(r, Request::BridgeDomainAddDel { is_add: true, .. }))
        .count();
    assert_eq!(adds, 1, "the second commit must not re-program");
    assert_eq!(om.client_ref_count("client-a"), 1);
}

/// Two clients share one canonical object; only the last reference's drop
/// sweeps the forwarder.
#[tokio::test]
async fn object_lives_until_the_last_client_drops_it() {
    let (om, mock) = om_with_mock().await;

    assert_eq!(om.commit("client-a", &BridgeDomain::new(7)).await, RcCode::Ok);
    assert_eq!(om.commit("client-b", &BridgeDomain::new(7)).await, RcCode::Ok);

    om.remove("client-a").await;
    assert_eq!(
        mock.writes(),
        vec![Request::BridgeDomainAddDel {
            bd_id: 7,
            is_add: true
        }],
        "no delete while client-b still owns the domain"
    );
    assert!(om.find_bridge_domain(7).is_some());
    assert_eq!(mock.bridge_domain_members(7), Some(vec![]));

    om.remove("client-b").await;
    assert_eq!(
        mock.writes().last(),
        Some(&Request::BridgeDomainAddDel {
            bd_id: 7,
            is_add: false
        })
    );
    assert!(om.find_bridge_domain(7).is_none());
    assert_eq!(mock.bridge_domain_members(7), None);
}

/// A forwarder rejection surfaces as INVALID, the object stays failed, and
/// its teardown does not issue a delete for state that never landed.
#[tokio::test]
async fn rejection_surfaces_invalid_and_is_not_swept() {
    let (om, mock) = om_with_mock().await;

    mock.fail_next();
    let rc = om.commit("client-a", &BridgeDomain::new(9)).await;
    assert_eq!(rc, RcCode::Invalid);
    {
        let bd = om.find_bridge_domain(9).expect("still interned");
        assert!(!bd.is_programmed());
    }

    om.remove("client-a").await;
    let deletes = mock
        .writes()
        .into_iter()
        .filter(|r| matches!(r, Request::BridgeDomainAddDel { is_add: false, .. }))
        .count();
    assert_eq!(deletes, 0, "nothing was programmed, nothing to delete");
}
