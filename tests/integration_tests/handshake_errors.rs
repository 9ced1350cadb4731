// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;

use shoal_rs::{
    auth::hmac::{Code, Key, Nonce, hmac_code},
    client::{
        connection::Connection,
        error::ConnError,
        handshake::{client_authenticate, validate_auth},
    },
    utils::epoch_seconds,
    wire::header::PROTOCOL_VERSION,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::integration_tests::common::{
    echo_factory, manual_client_auth, single_client, start_node, test_limits,
};

#[tokio::test]
async fn test_version_mismatch_reports_both_numbers() {
    // A fake node that speaks protocol version 2.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let (mut s, _) = listener.accept().await.expect("accept");
        s.write_u8(2).await.expect("their version");
        let _ = s.read_u8().await;
    });

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let key = Key::generate();
    let err = client_authenticate(&mut stream, "client-a", &key, &test_limits())
        .await
        .expect_err("version 2 must be rejected");

    match &err {
        ConnError::VersionMismatch { ours, theirs } => {
            assert_eq!(*ours, PROTOCOL_VERSION);
            assert_eq!(*theirs, 2);
        },
        other => panic!("expected VersionMismatch, got {other:?}"),
    }
    let text = err.to_string();
    assert!(text.contains('1') && text.contains('2'), "both numerics: {text}");
}

#[tokio::test]
async fn test_node_closes_on_version_mismatch() {
    let (store, _) = single_client("client-a");
    let (addr, stop) = start_node(store, echo_factory()).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_u8(2).await.expect("bogus version");
    let theirs = stream.read_u8().await.expect("node's version");
    assert_eq!(theirs, PROTOCOL_VERSION);

    // The node abandons the socket; nothing but EOF follows.
    let mut rest = Vec::new();
    let n = stream.read_to_end(&mut rest).await.expect("peer closes");
    assert_eq!(n, 0);

    stop.cancel();
}

fn known(name: &str, key: &Key) -> HashMap<String, Key> {
    HashMap::from([(name.to_string(), key.clone())])
}

#[tokio::test]
async fn test_validation_reasons_follow_the_documented_order() {
    let key = Key::generate();
    let creds = known("client-a", &key);
    let nonce = Nonce([9, 9, 9, 9]);
    let now = 1_750_000_000u64;
    let good = |ts| hmac_code(&key, ts, nonce);
    let zero = Code([0u8; 64]);

    // (1) empty name
    assert_eq!(
        validate_auth(&creds, b"", now, nonce, &zero, now, 1800),
        Err("empty client name")
    );
    // (2) overlong name — length 101 trips before the lookup
    let long = "x".repeat(101);
    assert_eq!(
        validate_auth(&creds, long.as_bytes(), now, nonce, &zero, now, 1800),
        Err("client name longer than 100 bytes")
    );
    // (3) unknown vs invalid-character reasons
    assert_eq!(
        validate_auth(&creds, b"stranger", now, nonce, &zero, now, 1800),
        Err("unknown client")
    );
    assert_eq!(
        validate_auth(&creds, b"bad name", now, nonce, &zero, now, 1800),
        Err("invalid character in client name")
    );
    // (4) timestamp beyond time_t
    assert_eq!(
        validate_auth(&creds, b"client-a", u64::MAX, nonce, &zero, now, 1800),
        Err("timestamp out of range")
    );
    // (5) zero timestamp is reported as zero, not as skew
    assert_eq!(
        validate_auth(&creds, b"client-a", 0, nonce, &zero, now, 1800),
        Err("timestamp is zero")
    );
    // (6) skew boundary: 1800 s passes the window, 1801 s does not
    assert_eq!(
        validate_auth(
            &creds,
            b"client-a",
            now - 1800,
            nonce,
            &good(now - 1800),
            now,
            1800
        ),
        Ok("client-a".to_string())
    );
    assert_eq!(
        validate_auth(
            &creds,
            b"client-a",
            now - 1801,
            nonce,
            &good(now - 1801),
            now,
            1800
        ),
        Err("Client/node timestamp difference > 30 minutes")
    );
    // (7) a wrong code is the last thing checked
    assert_eq!(
        validate_auth(&creds, b"client-a", now, nonce, &zero, now, 1800),
        Err("HMAC code mismatch")
    );
    assert_eq!(
        validate_auth(&creds, b"client-a", now, nonce, &good(now), now, 1800),
        Ok("client-a".to_string())
    );
}

#[tokio::test]
async fn test_skewed_clock_is_rejected_on_the_wire() {
    let (store, key) = single_client("client-a");
    let (addr, stop) = start_node(store, echo_factory()).await;

    // Well outside the window in both directions.
    let (ok, _) = manual_client_auth(addr, "client-a", &key, epoch_seconds() - 4000)
        .await
        .expect("exchange completes");
    assert!(!ok);
    let (ok, _) = manual_client_auth(addr, "client-a", &key, epoch_seconds() + 4000)
        .await
        .expect("exchange completes");
    assert!(!ok);
    // Comfortably inside it.
    let (ok, _) = manual_client_auth(addr, "client-a", &key, epoch_seconds() - 60)
        .await
        .expect("exchange completes");
    assert!(ok);

    stop.cancel();
}

#[tokio::test]
async fn test_unknown_client_is_rejected_over_wire() {
    let (store, key) = single_client("client-a");
    let (addr, stop) = start_node(store, echo_factory()).await;

    let err = Connection::connect(&addr.to_string(), "client-b", &key, test_limits())
        .await
        .expect_err("unknown name must be rejected");
    match err {
        ConnError::AuthRejected { name, .. } => {
            assert_eq!(name.as_deref(), Some("client-b"));
        },
        other => panic!("expected AuthRejected, got {other:?}"),
    }

    stop.cancel();
}

#[tokio::test]
async fn test_wrong_key_is_rejected_over_wire() {
    let (store, _key) = single_client("client-a");
    let (addr, stop) = start_node(store, echo_factory()).await;

    let wrong = Key::generate();
    let err = Connection::connect(&addr.to_string(), "client-a", &wrong, test_limits())
        .await
        .expect_err("wrong key must be rejected");
    assert!(matches!(err, ConnError::AuthRejected { .. }));

    stop.cancel();
}
