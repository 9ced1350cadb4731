// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fs;

use bytes::Bytes;
use shoal_rs::{
    auth::hmac::Key,
    client::{connection::Connection, error::ConnError},
    wire::fields::FieldWriter,
};

use crate::integration_tests::common::{
    ECHO, echo_factory, single_client, start_node, test_limits,
};

/// Hot reload swaps the registry under the node: new clients authenticate,
/// removed ones stop, and connections set up under the old snapshot keep
/// working.
#[tokio::test]
async fn test_credentials_reload_applies_to_new_connections_only() {
    let (store, key_a) = single_client("client-a");
    let (addr, stop) = start_node(std::sync::Arc::clone(&store), echo_factory()).await;

    let conn_a = Connection::connect(&addr.to_string(), "client-a", &key_a, test_limits())
        .await
        .expect("client-a authenticates against the initial registry");

    // Swap the registry to a single different client.
    let key_b = Key::generate();
    let path = std::env::temp_dir()
        .join(format!("shoal-reload-{}.creds", std::process::id()));
    fs::write(&path, format!("client-b:{}\n", key_b.to_hex())).expect("write registry");
    assert_eq!(store.reload_from(&path).expect("reload parses"), 1);

    // New attempts see the new snapshot.
    let err = Connection::connect(&addr.to_string(), "client-a", &key_a, test_limits())
        .await
        .expect_err("client-a is no longer registered");
    assert!(matches!(err, ConnError::AuthRejected { .. }));

    let conn_b = Connection::connect(&addr.to_string(), "client-b", &key_b, test_limits())
        .await
        .expect("client-b authenticates after the reload");

    // The pre-reload connection is unaffected by the swap.
    for conn in [&conn_a, &conn_b] {
        let mut req = conn.new_request().expect("request");
        let mut w = FieldWriter::new();
        w.put_trailing(Bytes::from_static(b"still here"));
        req.send(ECHO, w).await.expect("send");
        let reply = req.receive(|b| b.to_vec()).await.expect("reply");
        assert_eq!(reply, b"still here");
    }

    let _ = fs::remove_file(&path);
    stop.cancel();
}
