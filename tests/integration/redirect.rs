//! Live session migration between backends.

use std::time::Duration;

use hermes::protocol::AUTH_SESSION_TOKEN;
use hermes::router::BackendStatus;

use crate::testkit::{
    eventually, start_proxy, MockBackend, MockBackendConfig, MockClient, MOCK_SESSION_TOKEN,
};

/// Which backend currently carries the session
fn session_holder(proxy: &crate::testkit::ProxyHarness) -> Option<String> {
    proxy
        .router
        .snapshot()
        .into_iter()
        .find(|b| b.conn_count == 1)
        .map(|b| b.addr)
}

#[tokio::test]
async fn test_redirect_round_trip() {
    let b1 = MockBackend::spawn(MockBackendConfig::default()).await;
    let b2 = MockBackend::spawn(MockBackendConfig::default()).await;
    let proxy = start_proxy(&[b1.addr.clone(), b2.addr.clone()]).await;

    let mut client = MockClient::connect(&proxy.addr).await;
    assert!(client.authenticate("app_user", Some("orders")).await);
    eventually("session attached", || proxy.router.conn_count() == 1).await;

    let from_addr = session_holder(&proxy).unwrap();
    let (from, to) = if from_addr == b1.addr {
        (&b1, &b2)
    } else {
        (&b2, &b1)
    };

    // Ask the router to move every session to the least loaded backend.
    proxy.router.redirect_connections();
    eventually("session migrated", || {
        session_holder(&proxy).as_deref() == Some(to.addr.as_str())
    })
    .await;

    {
        // The old backend served the state-capture query.
        let from_log = from.log.lock();
        assert!(from_log
            .queries
            .iter()
            .any(|q| q == "SHOW SESSION_STATES"));

        // The new backend authenticated via the session token and restored
        // the captured state.
        let to_log = to.log.lock();
        assert!(to_log
            .auth_plugins
            .iter()
            .any(|p| p == AUTH_SESSION_TOKEN));
        assert!(to_log
            .auth_data
            .iter()
            .any(|d| d == MOCK_SESSION_TOKEN.as_bytes()));
        assert!(to_log
            .queries
            .iter()
            .any(|q| q.starts_with("SET SESSION_STATES '")));
    }

    // Subsequent commands are answered by the new backend.
    let reply = client.query("INSERT INTO t VALUES (1)").await;
    assert_eq!(reply[0][0], 0x00);
    eventually("query reached new backend", || {
        to.log
            .lock()
            .queries
            .iter()
            .any(|q| q == "INSERT INTO t VALUES (1)")
    })
    .await;
    assert!(!from
        .log
        .lock()
        .queries
        .iter()
        .any(|q| q == "INSERT INTO t VALUES (1)"));

    // The old socket was torn down exactly once.
    eventually("old backend socket closed", || {
        from.log.lock().closed_conns == 1
    })
    .await;

    client.quit().await;
}

#[tokio::test]
async fn test_redirect_waits_for_transaction_end() {
    let b1 = MockBackend::spawn(MockBackendConfig::default()).await;
    let b2 = MockBackend::spawn(MockBackendConfig::default()).await;
    let proxy = start_proxy(&[b1.addr.clone(), b2.addr.clone()]).await;

    let mut client = MockClient::connect(&proxy.addr).await;
    assert!(client.authenticate("app_user", None).await);
    eventually("session attached", || proxy.router.conn_count() == 1).await;
    let from_addr = session_holder(&proxy).unwrap();

    // Enter a transaction; the session is now pinned.
    let reply = client.query("BEGIN").await;
    assert_eq!(reply[0][0], 0x00);

    proxy.router.redirect_connections();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(session_holder(&proxy).as_deref(), Some(from_addr.as_str()));

    // Leaving the transaction unblocks the parked redirect.
    let reply = client.query("COMMIT").await;
    assert_eq!(reply[0][0], 0x00);
    eventually("session migrated after commit", || {
        session_holder(&proxy).as_deref() != Some(from_addr.as_str())
    })
    .await;

    client.quit().await;
}

#[tokio::test]
async fn test_failed_redirect_keeps_session_on_old_backend() {
    let b1 = MockBackend::spawn(MockBackendConfig::default()).await;
    // A backend that is routable on paper but unreachable in practice.
    let dead = "127.0.0.1:1".to_string();
    let proxy = start_proxy(&[b1.addr.clone(), dead.clone()]).await;

    let mut client = MockClient::connect(&proxy.addr).await;
    assert!(client.authenticate("app_user", None).await);
    eventually("session attached", || {
        session_holder(&proxy).as_deref() == Some(b1.addr.as_str())
    })
    .await;

    proxy.router.redirect_connections();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The migration failed; the session still works on the old backend.
    assert_eq!(session_holder(&proxy).as_deref(), Some(b1.addr.as_str()));
    let reply = client.query("INSERT INTO t VALUES (2)").await;
    assert_eq!(reply[0][0], 0x00);

    // Scores reverted: the dead backend carries no load.
    let snapshot = proxy.router.snapshot();
    let dead_entry = snapshot.iter().find(|b| b.addr == dead).unwrap();
    assert_eq!(dead_entry.conn_score, 0);
    assert_eq!(dead_entry.status, BackendStatus::Healthy);

    client.quit().await;
}
