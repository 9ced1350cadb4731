// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Node-side runtime: accept connections, authenticate them against the
//! credential registry, and hand every new request id to the application's
//! handler factory.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    auth::credentials::CredentialsStore,
    client::{
        connection::{ConnLimits, ConnRole, Connection, HandlerFactory},
        error::ConnResult,
        handshake,
    },
};

/// A listening node endpoint.
pub struct Node {
    listener: TcpListener,
    credentials: Arc<CredentialsStore>,
    limits: ConnLimits,
    factory: HandlerFactory,
    cancel: CancellationToken,
}

impl Node {
    pub async fn bind(
        listen: &str,
        credentials: Arc<CredentialsStore>,
        limits: ConnLimits,
        factory: HandlerFactory,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("cannot listen on {listen}"))?;
        Ok(Self {
            listener,
            credentials,
            limits,
            factory,
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr().context("listener has no local address")
    }

    /// Token that stops the accept loop when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accept loop. Each connection authenticates on its own task; a failed
    /// handshake is logged and the socket dropped, the loop keeps serving.
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "node listening");
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = self.listener.accept() => {
                    accepted.context("accept failed")?
                },
            };

            let credentials = Arc::clone(&self.credentials);
            let limits = self.limits.clone();
            let factory = Arc::clone(&self.factory);
            tokio::spawn(async move {
                match serve_connection(stream, &credentials, limits, factory).await {
                    Ok(conn) => {
                        info!(peer = %peer, "connection ready");
                        drop(conn);
                    },
                    Err(e) => warn!(peer = %peer, error = %e, "connection setup failed"),
                }
            });
        }
    }
}

/// Authenticate one accepted socket and wrap it into a driver whose unknown
/// request ids spawn handlers from `factory`.
pub async fn serve_connection(
    mut stream: TcpStream,
    credentials: &CredentialsStore,
    limits: ConnLimits,
    factory: HandlerFactory,
) -> ConnResult<Arc<Connection>> {
    if limits.tcp_nodelay {
        let _ = stream.set_nodelay(true);
    }
    // The snapshot outlives the whole authentication attempt; a concurrent
    // reload does not window it out.
    let snapshot = credentials.snapshot();
    let client =
        handshake::node_authenticate(&mut stream, &snapshot, &limits).await?;
    info!(client, "serving authenticated connection");
    Ok(Connection::start(stream, limits, ConnRole::Node, Some(factory)))
}
