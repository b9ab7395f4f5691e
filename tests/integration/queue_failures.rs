//! Failure paths of the command pipeline: disconnect while pending,
//! commits with no connection, event subscription, and config handling.

use std::time::Duration;
use vs_om::bridge_domain::BridgeDomain;
use vs_om::config::load_config_from_str;
use vs_om::om::Om;
use vs_om::types::{Handle, RcCode};
use vs_test_utils::MockForwarder;

/// A disconnect while a command is outstanding fails that command with
/// TIMEOUT; the desired state stays in the model.
#[tokio::test]
async fn disconnect_fails_pending_commit_with_timeout() {
    vs_test_utils::init_tracing();
    let (mock, transport) = MockForwarder::spawn();
    let om = std::sync::Arc::new(Om::new());
    assert_eq!(om.connect(transport).await, RcCode::Ok);

    // the forwarder goes quiet, then the connection drops under the commit
    mock.set_mute(true);
    let committer = {
        let om = om.clone();
        tokio::spawn(async move { om.commit("client-a", &BridgeDomain::new(7)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    mock.disconnect();

    let rc = committer.await.unwrap();
    assert_eq!(rc, RcCode::Timeout);
    assert!(!om.hw().connected());
    let bd = om.find_bridge_domain(7).expect("desired state survives");
    assert!(!bd.is_programmed());
}

/// Committing with no connection at all fails fast with TIMEOUT.
#[tokio::test]
async fn commit_without_connection_times_out() {
    vs_test_utils::init_tracing();
    let om = Om::new();
    let rc = om.commit("client-a", &BridgeDomain::new(1)).await;
    assert_eq!(rc, RcCode::Timeout);
}

/// The interface event subscription delivers forwarder events until the
/// connection drops.
#[tokio::test]
async fn interface_events_reach_the_subscriber() {
    vs_test_utils::init_tracing();
    let (mock, transport) = MockForwarder::spawn();
    let om = Om::new();
    assert_eq!(om.connect(transport).await, RcCode::Ok);

    let mut events = om.subscribe_interface_events().await;
    // the subscription frame is in flight; wait for the forwarder to
    // register it before emitting
    let mut emitted = false;
    for _ in 0..100 {
        if mock.emit_interface_event(5, false, false) {
            emitted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(emitted, "forwarder never saw the subscription");

    let event = events.recv().await.expect("event delivered");
    assert_eq!(event.handle, Handle(5));
    assert!(!event.admin_up);
    assert!(!event.deleted);
}

/// Config can disable the connect-time liveness ping, letting a connect to
/// a silent forwarder complete.
#[tokio::test]
async fn connect_without_poll_succeeds_against_a_silent_forwarder() {
    vs_test_utils::init_tracing();
    let cfg = load_config_from_str(
        r#"
        schema_version = 1

        [connect]
        poll = false
        "#,
    )
    .unwrap();
    let (mock, transport) = MockForwarder::spawn();
    mock.set_mute(true);
    let om = Om::with_config(cfg);
    assert_eq!(om.connect(transport).await, RcCode::Ok);
    assert!(om.hw().connected());
}

/// A manual poll reports liveness both ways.
#[tokio::test]
async fn poll_reflects_forwarder_liveness() {
    vs_test_utils::init_tracing();
    let (mock, transport) = MockForwarder::spawn();
    let om = Om::new();
    assert_eq!(om.connect(transport).await, RcCode::Ok);
    assert!(om.poll().await);

    mock.disconnect();
    // the receive loop observes the close; a fresh poll must fail
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!om.poll().await);
}
