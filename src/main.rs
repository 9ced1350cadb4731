// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use bytes::Bytes;
use shoal_rs::{
    auth::{
        credentials::{Credentials, CredentialsStore},
        hmac::{Key, self_test},
    },
    cfg::{config::Config, logger::init_logger},
    client::connection::{Connection, HandlerFactory},
    node::Node,
    wire::{fields::FieldWriter, header::MsgType},
};
use tracing::{info, warn};

/// Demo request type: the node echoes the body back.
const ECHO: MsgType = MsgType::new(1);

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _init_logger = init_logger("tests/config_logger.yaml")?;

    // The engine must not run with broken crypto.
    if let Err(e) = self_test() {
        warn!(error = %e, "crypto self-test failed");
        return Ok(ExitCode::FAILURE);
    }

    // Load config
    let cfg = Config::load_from_file("tests/config.yaml")
        .context("failed to resolve or load config")?;

    // In-process node with a generated credential set
    let name = if cfg.client.name.is_empty() {
        "demo-client".to_string()
    } else {
        cfg.client.name.clone()
    };
    let key = Key::generate();
    let store = Arc::new(CredentialsStore::from_entries([Credentials {
        name: name.clone(),
        key: key.clone(),
    }]));

    let factory: HandlerFactory = Arc::new(|mut req| {
        Box::pin(async move {
            let payload = match req.receive(Bytes::copy_from_slice).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "echo handler receive failed");
                    return;
                },
            };
            let mut w = FieldWriter::new();
            w.put_trailing(payload);
            if let Err(e) = req.send(ECHO, w).await {
                warn!(error = %e, "echo handler send failed");
            }
        })
    });

    let node = Node::bind("127.0.0.1:0", store, cfg.limits(), factory).await?;
    let addr = node.local_addr()?;
    let stop_node = node.cancel_token();
    tokio::spawn(node.run());

    // Connect, authenticate, and run a few multiplexed echo round-trips
    let conn = Connection::connect(&addr.to_string(), &name, &key, cfg.limits())
        .await
        .context("connect failed")?;
    info!(node = %addr, "authenticated");

    for i in 0..3u32 {
        let mut req = conn.new_request()?;
        let mut w = FieldWriter::new();
        w.put_trailing(Bytes::from(format!("ping {i}")));
        req.send(ECHO, w).await?;
        let reply = req
            .receive(|b| String::from_utf8_lossy(b).into_owned())
            .await?;
        info!(request_id = req.id(), reply, "echo round-trip");
    }

    let stats = conn.stats();
    info!(
        bytes_out = stats.bytes_out,
        bytes_in = stats.bytes_in,
        msgs_out = stats.msgs_out,
        msgs_in = stats.msgs_in,
        "client connection stats"
    );

    stop_node.cancel();
    Ok(ExitCode::SUCCESS)
}
