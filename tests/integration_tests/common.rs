// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use shoal_rs::{
    auth::{
        credentials::{Credentials, CredentialsStore},
        hmac::{CODE_LEN, Key, Nonce, hmac_code},
    },
    client::{
        connection::{ConnLimits, ConnStats, HandlerFactory},
        error::{ConnError, ConnResult},
        recv::MsgReader,
        send::write_msg,
    },
    node::Node,
    wire::{
        fields::{FieldReader, FieldWriter},
        header::{MsgType, PROTOCOL_VERSION},
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;

/// Echo request: the node sends the body straight back.
pub const ECHO: MsgType = MsgType::new(1);
/// Streamed request used by the dispatcher tests.
pub const STREAM: MsgType = MsgType::new(2);

pub fn test_limits() -> ConnLimits {
    ConnLimits {
        io_timeout: Duration::from_secs(5),
        ..ConnLimits::default()
    }
}

/// A store holding exactly one registered client.
pub fn single_client(name: &str) -> (Arc<CredentialsStore>, Key) {
    let key = Key::generate();
    let store = Arc::new(CredentialsStore::from_entries([Credentials {
        name: name.to_string(),
        key: key.clone(),
    }]));
    (store, key)
}

/// Echoes every message of every request until the connection dies.
pub fn echo_factory() -> HandlerFactory {
    Arc::new(|mut req| {
        Box::pin(async move {
            loop {
                let payload = match req.receive(Bytes::copy_from_slice).await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                let mut w = FieldWriter::new();
                w.put_trailing(payload);
                if req.send(ECHO, w).await.is_err() {
                    return;
                }
            }
        })
    })
}

/// Bind a node on an ephemeral port and run it in the background.
pub async fn start_node(
    store: Arc<CredentialsStore>,
    factory: HandlerFactory,
) -> (SocketAddr, CancellationToken) {
    let node = Node::bind("127.0.0.1:0", store, test_limits(), factory)
        .await
        .expect("bind node");
    let addr = node.local_addr().expect("local addr");
    let cancel = node.cancel_token();
    tokio::spawn(node.run());
    (addr, cancel)
}

/// Drive the whole client handshake by hand with a chosen timestamp.
/// Returns the node's verdict and the nonce it issued.
pub async fn manual_client_auth(
    addr: SocketAddr,
    name: &str,
    key: &Key,
    timestamp: u64,
) -> ConnResult<(bool, Nonce)> {
    let limits = test_limits();
    let stats = ConnStats::default();
    let mut reader = MsgReader::new(limits.max_body_length);
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ConnError::io("connect", e))?;

    stream
        .write_u8(PROTOCOL_VERSION)
        .await
        .map_err(|e| ConnError::io("write version", e))?;
    let theirs = stream
        .read_u8()
        .await
        .map_err(|e| ConnError::io("read version", e))?;
    assert_eq!(theirs, PROTOCOL_VERSION, "node must speak the same version");

    let mut w = FieldWriter::new();
    w.put_u64(timestamp);
    let fields = w.into_message(MsgType::AUTHENTICATION, limits.max_body_length)?;
    write_msg(&mut stream, fields, &stats).await?;

    let msg = reader.next_msg(&mut stream).await?;
    let mut rd = FieldReader::new(&msg.body);
    let nonce = Nonce::read(&mut rd)?;

    let code = hmac_code(key, timestamp, nonce);
    assert_eq!(code.0.len(), CODE_LEN);
    let mut w = FieldWriter::new();
    w.put_array(name.as_bytes().to_vec());
    w.put_fixed(&code.0);
    let fields = w.into_message(MsgType::AUTHENTICATION, limits.max_body_length)?;
    write_msg(&mut stream, fields, &stats).await?;

    let msg = reader.next_msg(&mut stream).await?;
    let mut rd = FieldReader::new(&msg.body);
    let ok = rd.bool("ok")?;
    Ok((ok, nonce))
}
