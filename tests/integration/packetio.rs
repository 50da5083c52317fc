//! Framing, TLS upgrade, liveness, and close semantics of the packet layer.

use std::time::Duration;

use hermes::protocol::{capabilities::*, ProtocolError, AUTH_NATIVE_PASSWORD, MAX_PAYLOAD_LEN};
use hermes::security::create_tls_pair_for_test;

use crate::testkit::tcp_pair;

fn header_overhead(len: usize) -> u64 {
    ((len / MAX_PAYLOAD_LEN + 1) * 4) as u64
}

#[tokio::test]
async fn test_packet_roundtrip_and_counters() {
    let (mut cli, mut srv) = tcp_pair().await;
    let lengths = [0usize, 1, 312, MAX_PAYLOAD_LEN, MAX_PAYLOAD_LEN + 212];

    let writer = tokio::spawn(async move {
        let mut expected_out = 0u64;
        for len in lengths {
            cli.write_packet(&vec![0x42u8; len], true).await.unwrap();
            expected_out += len as u64 + header_overhead(len);
            assert_eq!(cli.out_bytes(), expected_out);
        }
        cli
    });

    let mut expected_in = 0u64;
    for len in lengths {
        let payload = srv.read_packet().await.unwrap();
        assert_eq!(payload.len(), len);
        assert!(payload.iter().all(|&b| b == 0x42));
        expected_in += len as u64 + header_overhead(len);
        assert_eq!(srv.in_bytes(), expected_in);
    }

    let mut cli = writer.await.unwrap();
    let _ = cli.close().await;
    let _ = srv.close().await;
}

/// A payload of exactly the chunk limit is followed by an empty
/// terminating chunk.
#[tokio::test]
async fn test_exact_multiple_framing() {
    let (mut cli, mut srv) = tcp_pair().await;

    let writer = tokio::spawn(async move {
        cli.write_packet(&vec![0u8; MAX_PAYLOAD_LEN], true)
            .await
            .unwrap();
        // One full chunk plus one empty chunk, four header bytes each.
        assert_eq!(cli.out_bytes(), MAX_PAYLOAD_LEN as u64 + 8);
        cli
    });

    let payload = srv.read_packet().await.unwrap();
    assert_eq!(payload.len(), MAX_PAYLOAD_LEN);
    assert_eq!(srv.in_bytes(), MAX_PAYLOAD_LEN as u64 + 8);

    let mut cli = writer.await.unwrap();
    let _ = cli.close().await;
    let _ = srv.close().await;
}

#[tokio::test]
async fn test_sequence_mismatch_detected() {
    let (mut cli, mut srv) = tcp_pair().await;

    cli.write_packet(b"first", true).await.unwrap();
    srv.read_packet().await.unwrap();

    // The peer resets while this side does not: next packet arrives with
    // sequence 0 where 1 is expected.
    cli.reset_sequence();
    cli.write_packet(b"second", true).await.unwrap();
    let err = srv.read_packet().await.unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::BadSequence {
            expected: 1,
            got: 0
        }
    ));
}

#[tokio::test]
async fn test_ssl_request_detection_and_salt_length() {
    let (mut cli, mut srv) = tcp_pair().await;

    let client_task = tokio::spawn(async move {
        // Receive the handshake.
        cli.read_packet().await.unwrap();

        // 32-byte payload with CLIENT_SSL set is an SSLRequest.
        let mut ssl_req = [0u8; 32];
        ssl_req[..4].copy_from_slice(&CLIENT_SSL.to_le_bytes());
        cli.write_packet(&ssl_req, true).await.unwrap();

        // Same shape without the bit is a HandshakeResponse.
        let plain = [0u8; 32];
        cli.write_packet(&plain, true).await.unwrap();
        cli
    });

    let salt: Vec<u8> = (1u8..=20).collect();
    srv.write_initial_handshake(1, &salt, AUTH_NATIVE_PASSWORD, "8.0.11-test", DEFAULT_CAPABILITIES)
        .await
        .unwrap();

    // A short salt is rejected before any bytes hit the wire.
    let before = srv.out_bytes();
    let err = srv
        .write_initial_handshake(1, &salt[..4], AUTH_NATIVE_PASSWORD, "8.0.11-test", DEFAULT_CAPABILITIES)
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::SaltNotLongEnough));
    assert_eq!(srv.out_bytes(), before);

    let (_, is_ssl) = srv.read_ssl_request_or_handshake_resp().await.unwrap();
    assert!(is_ssl);
    let (_, is_ssl) = srv.read_ssl_request_or_handshake_resp().await.unwrap();
    assert!(!is_ssl);

    let mut cli = client_task.await.unwrap();
    let _ = cli.close().await;
    let _ = srv.close().await;
}

/// Plaintext round trip, mutual upgrade, TLS round trip; content must match
/// byte for byte.
#[tokio::test]
async fn test_tls_upgrade_mid_stream() {
    let (server_tls, client_tls) = create_tls_pair_for_test().unwrap();
    let (mut cli, mut srv) = tcp_pair().await;
    let message = b"hello world";

    let client_task = tokio::spawn(async move {
        let data = cli.read_packet().await.unwrap();
        assert_eq!(&data[..], message);
        cli.write_packet(message, true).await.unwrap();

        cli.client_tls_handshake(client_tls, "localhost").await.unwrap();

        cli.write_packet(message, true).await.unwrap();
        let data = cli.read_packet().await.unwrap();
        assert_eq!(&data[..], message);
        cli
    });

    srv.write_packet(message, true).await.unwrap();
    let data = srv.read_packet().await.unwrap();
    assert_eq!(&data[..], message);

    srv.server_tls_handshake(server_tls).await.unwrap();

    let data = srv.read_packet().await.unwrap();
    assert_eq!(&data[..], message);
    srv.write_packet(message, true).await.unwrap();

    let mut cli = client_task.await.unwrap();
    let _ = cli.close().await;
    let _ = srv.close().await;
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (mut cli, mut srv) = tcp_pair().await;

    cli.close().await.unwrap();
    cli.close().await.unwrap();
    cli.graceful_close().await.unwrap();

    srv.graceful_close().await.unwrap();
    srv.close().await.unwrap();
    srv.close().await.unwrap();

    assert!(cli.local_addr().is_some());
    assert!(srv.remote_addr().is_some());
}

#[tokio::test]
async fn test_peer_active_probe() {
    let (mut cli, mut srv) = tcp_pair().await;

    // Active at the beginning.
    assert!(cli.is_peer_active().await);

    // Data pending does not disturb a later read.
    srv.write_packet(b"123", true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(cli.is_peer_active().await);
    let data = cli.read_packet().await.unwrap();
    assert_eq!(&data[..], b"123");
    assert!(cli.is_peer_active().await);

    // Dead within 100ms of the peer closing.
    srv.close().await.unwrap();
    drop(srv);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!cli.is_peer_active().await);
}

/// Keepalive probes must not kill an idle TLS connection.
#[tokio::test]
async fn test_keepalive_under_idle_tls() {
    let (server_tls, client_tls) = create_tls_pair_for_test().unwrap();
    let (mut cli, mut srv) = tcp_pair().await;

    let keepalive = hermes::config::KeepaliveConfig {
        enabled: true,
        idle_secs: 1,
        interval_secs: 1,
        count: 1,
    };
    cli.set_keepalive(&keepalive).unwrap();
    srv.set_keepalive(&keepalive).unwrap();

    let client_task = tokio::spawn(async move {
        cli.client_tls_handshake(client_tls, "localhost").await.unwrap();
        // Idle past several keepalive rounds, then read.
        tokio::time::sleep(Duration::from_secs(3)).await;
        let data = cli.read_packet().await.unwrap();
        assert_eq!(&data[..], &[0u8, 1, 2]);
        cli.write_packet(&[3u8, 4, 5], true).await.unwrap();
        cli
    });

    srv.server_tls_handshake(server_tls).await.unwrap();
    srv.write_packet(&[0u8, 1, 2], true).await.unwrap();
    let data = srv.read_packet().await.unwrap();
    assert_eq!(&data[..], &[3u8, 4, 5]);

    let mut cli = client_task.await.unwrap();
    let _ = cli.close().await;
    let _ = srv.close().await;
}
