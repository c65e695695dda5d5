//! Session lifecycle against an in-process fake protocol:
//! pairing, restore, logout purge and reconnect ordering.

mod support;

use chrono::Utc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use subzero_mini::error::SessionError;
use subzero_mini::pairing::PairingState;
use subzero_mini::protocol::ConnectionEvent;
use subzero_mini::session::{EnsureMode, EnsureOutcome};
use subzero_mini::state::AppState;
use support::*;

#[tokio::test]
async fn concurrent_ensure_creates_exactly_one_connection() {
    let (_dir, connector, state) = harness();
    state.store.put(NUMBER, &linked_creds(), Utc::now()).unwrap();
    *connector.connect_delay.lock() = Duration::from_millis(50);

    let (a, b) = tokio::join!(
        state.manager.ensure(NUMBER, EnsureMode::Pair),
        state.manager.ensure(NUMBER, EnsureMode::Pair),
    );
    let statuses = [a.unwrap().status(), b.unwrap().status()];

    assert_eq!(connector.connect_count(), 1);
    assert_eq!(state.manager.handle_count(), 1);
    assert!(statuses.contains(&"connected"));
}

#[tokio::test]
async fn new_number_gets_code_then_links_and_onboards() {
    let (_dir, connector, state) = harness();

    let outcome = state
        .manager
        .ensure("+263 71 964 7303", EnsureMode::Pair)
        .await
        .unwrap();
    let EnsureOutcome::PairingCode { code, .. } = outcome else {
        panic!("expected a pairing code");
    };
    assert_eq!(code, PAIRING_CODE);
    assert_eq!(
        state.manager.pairing_state(NUMBER),
        Some(PairingState::AwaitingLink)
    );

    // A second request while linking reuses the pending handle.
    let again = state.manager.ensure(NUMBER, EnsureMode::Pair).await.unwrap();
    assert_eq!(again.status(), "pairing_in_progress");
    assert_eq!(connector.connect_count(), 1);

    let opened = connector.latest(NUMBER);
    opened
        .events
        .send(ConnectionEvent::CredsUpdate(linked_creds()))
        .await
        .unwrap();
    opened.events.send(open_event(NUMBER)).await.unwrap();

    let store = state.store.clone();
    eventually("credentials persisted", || {
        store.get(NUMBER).unwrap() == Some(linked_creds())
    })
    .await;
    let conn = opened.connection.clone();
    eventually("welcome message", || !conn.sent_to(&own_jid(NUMBER)).is_empty()).await;

    assert!(state.store.known_numbers().unwrap().contains(&NUMBER.to_string()));
    assert_eq!(opened.connection.joined.lock().as_slice(), ["InviteCode123"]);
    assert_eq!(
        opened.connection.followed.lock().as_slice(),
        ["120363402507750390@newsletter"]
    );
    assert_eq!(state.manager.pairing_state(NUMBER), None);
    assert_eq!(state.manager.active_numbers(), vec![NUMBER.to_string()]);
}

#[tokio::test]
async fn issued_code_leaves_an_empty_account_record() {
    let (_dir, _connector, state) = harness();
    let before = Utc::now();

    let outcome = state.manager.ensure(NUMBER, EnsureMode::Pair).await.unwrap();
    assert_eq!(outcome.status(), "pairing_code_issued");

    let record = state.store.load(NUMBER).unwrap().expect("record after code");
    assert_eq!(record.number, NUMBER);
    assert!(record.creds.is_none());
    assert!(record.config.is_empty());
    assert!(record.created_at.timestamp_millis() >= before.timestamp_millis());
    assert!(record.updated_at >= record.created_at);
}

#[tokio::test]
async fn unlinked_socket_drop_fails_the_pending_pairing() {
    let (_dir, connector, state) = harness();
    state.manager.ensure(NUMBER, EnsureMode::Pair).await.unwrap();
    assert_eq!(
        state.manager.pairing_state(NUMBER),
        Some(PairingState::AwaitingLink)
    );

    // code expired before the phone linked
    connector
        .latest(NUMBER)
        .events
        .send(close_event(408))
        .await
        .unwrap();

    let manager = state.manager.clone();
    eventually("pairing abandoned", || manager.pairing_state(NUMBER).is_none()).await;
    eventually("handle removed", || manager.handle_count() == 0).await;
    assert_eq!(connector.connect_count(), 1);
    assert!(connector.latest(NUMBER).connection.is_closed());
}

#[tokio::test]
async fn pairing_gives_up_after_max_retries() {
    let (_dir, connector, state) = harness();
    connector.pairing_failures.store(10, Ordering::SeqCst);

    let err = state
        .manager
        .ensure(NUMBER, EnsureMode::Pair)
        .await
        .err()
        .expect("pairing should fail");
    assert!(matches!(err, SessionError::PairingFailed { attempts: 3, .. }));

    let opened = connector.latest(NUMBER);
    assert_eq!(opened.connection.pairing_requests.load(Ordering::SeqCst), 3);
    assert!(opened.connection.is_closed());
    assert_eq!(state.manager.handle_count(), 0);
}

#[tokio::test]
async fn invalid_number_is_rejected_without_connecting() {
    let (_dir, connector, state) = harness();
    let err = state
        .manager
        .ensure("12ab", EnsureMode::Pair)
        .await
        .err()
        .expect("should reject");
    assert!(matches!(err, SessionError::InvalidNumber(_)));
    assert_eq!(connector.connect_count(), 0);
}

#[tokio::test]
async fn restart_restores_stored_sessions_without_pairing() {
    let dir = tempfile::tempdir().unwrap();
    {
        let first = harness_with(test_config(&dir), FakeConnector::new());
        first.store.put(NUMBER, &linked_creds(), Utc::now()).unwrap();
        first
            .store
            .put("111222333444", &linked_creds(), Utc::now())
            .unwrap();
    }

    let connector = FakeConnector::new();
    let state = harness_with(test_config(&dir), connector.clone());
    let results = state.manager.restore_all().await.unwrap();

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == "connected"));
    for number in [NUMBER, "111222333444"] {
        let opened = connector.latest(number);
        assert_eq!(opened.connection.pairing_requests.load(Ordering::SeqCst), 0);
        opened.events.send(open_event(number)).await.unwrap();
    }
    let manager = state.manager.clone();
    eventually("both sessions open", || manager.active_numbers().len() == 2).await;
}

#[tokio::test]
async fn restore_skips_unlinked_and_isolates_failures() {
    let (_dir, connector, state) = harness();
    state
        .store
        .put("111222333444", &serde_json::json!({ "registered": false }), Utc::now())
        .unwrap();

    let results = state.manager.restore_all().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, "not_registered");
    assert!(connector.latest("111222333444").connection.is_closed());
    assert_eq!(state.manager.handle_count(), 0);

    state.store.put(NUMBER, &linked_creds(), Utc::now()).unwrap();
    connector.fail_connects.store(true, Ordering::SeqCst);
    let results = state.manager.restore_all().await.unwrap();
    assert!(results.iter().all(|r| r.status.starts_with("failed") || r.status == "not_registered"));
    assert_eq!(state.manager.handle_count(), 0);
}

#[tokio::test]
async fn logged_out_close_purges_and_never_reconnects() {
    let (_dir, connector, state) = harness();
    state.store.put(NUMBER, &linked_creds(), Utc::now()).unwrap();
    state.store.add_known(NUMBER).unwrap();
    state.manager.ensure(NUMBER, EnsureMode::Pair).await.unwrap();

    let opened = connector.latest(NUMBER);
    opened.events.send(open_event(NUMBER)).await.unwrap();
    opened.events.send(close_event(401)).await.unwrap();

    let store = state.store.clone();
    eventually("record purged", || store.get(NUMBER).unwrap().is_none()).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(connector.connect_count(), 1);
    assert_eq!(state.manager.handle_count(), 0);
    assert!(opened.connection.is_closed());
    assert!(!state.store.known_numbers().unwrap().contains(&NUMBER.to_string()));
}

#[tokio::test]
async fn other_close_reconnects_once_after_teardown() {
    let (_dir, connector, state) = harness();
    state.store.put(NUMBER, &linked_creds(), Utc::now()).unwrap();
    let first_id = match state.manager.ensure(NUMBER, EnsureMode::Pair).await.unwrap() {
        EnsureOutcome::Connected(session) => session.id,
        other => panic!("unexpected outcome {}", other.status()),
    };

    let first = connector.latest(NUMBER);
    first.events.send(open_event(NUMBER)).await.unwrap();
    first.events.send(close_event(428)).await.unwrap();

    eventually("reconnected", || connector.connect_count() == 2).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(connector.connect_count(), 2);
    assert!(first.connection.is_closed());
    assert!(!connector.overlap_seen.load(Ordering::SeqCst));
    let current = state.manager.get(NUMBER).expect("new handle registered");
    assert_ne!(current.id, first_id);
    // credentials survive a plain disconnect
    assert!(state.store.get(NUMBER).unwrap().is_some());
}

#[tokio::test]
async fn reconnect_cap_stops_retrying() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(&dir);
    cfg.reconnect.max_attempts = Some(2);
    let connector = FakeConnector::new();
    let state = harness_with(cfg, connector.clone());

    state.store.put(NUMBER, &linked_creds(), Utc::now()).unwrap();
    state.manager.ensure(NUMBER, EnsureMode::Pair).await.unwrap();
    connector.fail_connects.store(true, Ordering::SeqCst);
    connector
        .latest(NUMBER)
        .events
        .send(close_event(500))
        .await
        .unwrap();

    eventually("two failed attempts", || connector.connect_count() == 3).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(connector.connect_count(), 3);
    assert_eq!(state.manager.handle_count(), 0);
    assert!(state.store.get(NUMBER).unwrap().is_some());
}

#[tokio::test]
async fn stale_credential_update_does_not_win() {
    let (_dir, _connector, state) = harness();
    let newer = serde_json::json!({ "registered": true, "v": 2 });
    let older = serde_json::json!({ "registered": true, "v": 1 });
    let now = Utc::now();

    assert!(state.store.put(NUMBER, &newer, now).unwrap());
    assert!(!state
        .store
        .put(NUMBER, &older, now - chrono::Duration::seconds(5))
        .unwrap());
    assert_eq!(state.store.get(NUMBER).unwrap(), Some(newer));
}

#[tokio::test]
async fn shutdown_closes_connections_but_keeps_credentials() {
    let (_dir, connector, state) = harness();
    state.store.put(NUMBER, &linked_creds(), Utc::now()).unwrap();
    state.manager.ensure(NUMBER, EnsureMode::Pair).await.unwrap();

    state.manager.shutdown().await;

    assert!(connector.latest(NUMBER).connection.is_closed());
    assert_eq!(state.manager.handle_count(), 0);
    assert!(state.store.get(NUMBER).unwrap().is_some());
}

#[test]
fn unusable_store_is_fatal_at_boot() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(&dir);
    // a directory can't be opened as a database file
    cfg.database_path = dir.path().to_path_buf();

    assert!(AppState::init(cfg, FakeConnector::new()).is_err());
}
