//! Three-party authentication and command forwarding through the proxy.

use hermes::protocol::{is_err_packet, Command, AUTH_NATIVE_PASSWORD};

use crate::testkit::{
    eventually, start_proxy, MockBackend, MockBackendConfig, MockClient, MOCK_SERVER_VERSION,
};

#[tokio::test]
async fn test_auth_success_passes_credentials_through() {
    let backend = MockBackend::spawn(MockBackendConfig::default()).await;
    let proxy = start_proxy(&[backend.addr.clone()]).await;

    let mut client = MockClient::connect(&proxy.addr).await;
    assert!(client.authenticate("app_user", Some("orders")).await);

    {
        let log = backend.log.lock();
        assert_eq!(log.usernames, vec!["app_user".to_string()]);
        // The proxy forwards the plugin name untouched.
        assert_eq!(log.auth_plugins, vec![AUTH_NATIVE_PASSWORD.to_string()]);
        // First response plus the answer to the backend's switch request.
        assert!(log.auth_data.len() >= 2);
        assert_eq!(log.auth_data[1], vec![0x5A; 20]);
    }

    eventually("session registered", || proxy.router.conn_count() == 1).await;
    client.quit().await;
    eventually("session unregistered", || proxy.router.conn_count() == 0).await;
}

#[tokio::test]
async fn test_auth_failure_is_forwarded_verbatim() {
    let backend = MockBackend::spawn(MockBackendConfig {
        auth_succeed: false,
        ..MockBackendConfig::default()
    })
    .await;
    let proxy = start_proxy(&[backend.addr.clone()]).await;

    let mut client = MockClient::connect(&proxy.addr).await;
    assert!(!client.authenticate("bad_user", None).await);
    assert_eq!(proxy.router.conn_count(), 0);
}

#[tokio::test]
async fn test_no_backend_yields_error_packet() {
    let proxy = start_proxy(&[]).await;

    let mut client = MockClient::connect(&proxy.addr).await;
    let first = client.io.read_packet().await.unwrap();
    assert!(is_err_packet(&first));
}

#[tokio::test]
async fn test_result_set_forwarded_completely() {
    let backend = MockBackend::spawn(MockBackendConfig {
        result_set: Some((2, 3)),
        ..MockBackendConfig::default()
    })
    .await;
    let proxy = start_proxy(&[backend.addr.clone()]).await;

    let mut client = MockClient::connect(&proxy.addr).await;
    assert!(client.authenticate("reader", None).await);

    let packets = client.query("SELECT a, b FROM t").await;
    // column count + 2 definitions + EOF + 3 rows + EOF
    assert_eq!(packets.len(), 7);
    assert_eq!(packets[0][0], 2);
    assert_eq!(backend.log.lock().queries, vec!["SELECT a, b FROM t"]);

    // The session survives the round trip.
    let packets = client.query("SELECT a, b FROM t").await;
    assert_eq!(packets.len(), 7);
    client.quit().await;
}

#[tokio::test]
async fn test_ok_reply_forwarded() {
    let backend = MockBackend::spawn(MockBackendConfig::default()).await;
    let proxy = start_proxy(&[backend.addr.clone()]).await;

    let mut client = MockClient::connect(&proxy.addr).await;
    assert!(client.authenticate("writer", None).await);

    let packets = client.query("INSERT INTO t VALUES (1)").await;
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0][0], 0x00);
    client.quit().await;
}

#[tokio::test]
async fn test_prepare_response_walked_to_completion() {
    let backend = MockBackend::spawn(MockBackendConfig::default()).await;
    let proxy = start_proxy(&[backend.addr.clone()]).await;

    let mut client = MockClient::connect(&proxy.addr).await;
    assert!(client.authenticate("writer", None).await);

    client.io.reset_sequence();
    let mut request = vec![Command::StmtPrepare as u8];
    request.extend_from_slice(b"SELECT ? FROM t WHERE id = ?");
    client.io.write_packet(&request, true).await.unwrap();

    // prepare-OK + 1 param + EOF + 2 columns + EOF
    let mut packets = Vec::new();
    for _ in 0..6 {
        packets.push(client.io.read_packet().await.unwrap());
    }
    assert_eq!(packets[0][0], 0x00);
    let num_columns = u16::from_le_bytes([packets[0][5], packets[0][6]]);
    let num_params = u16::from_le_bytes([packets[0][7], packets[0][8]]);
    assert_eq!((num_columns, num_params), (2, 1));

    // The proxy is ready for the next command afterwards.
    let reply = client.query("INSERT INTO t VALUES (1)").await;
    assert_eq!(reply[0][0], 0x00);
    client.quit().await;
}

#[tokio::test]
async fn test_proxy_advertises_its_own_banner() {
    let backend = MockBackend::spawn(MockBackendConfig::default()).await;
    let proxy = start_proxy(&[backend.addr.clone()]).await;

    let mut client = MockClient::connect(&proxy.addr).await;
    assert!(client.authenticate("app_user", None).await);
    // The client sees the proxy's banner, not the backend's.
    assert_ne!(client.server_version, MOCK_SERVER_VERSION);
    assert!(client.server_version.contains("hermes"));
    client.quit().await;
}
