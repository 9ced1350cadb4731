// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection-setup protocol: version exchange, then the HMAC challenge.
//!
//! The version handshake is a raw byte each way, before any framing. The
//! authentication exchange that follows uses the regular envelope with the
//! reserved `AUTHENTICATION` type, strictly half-duplex, one message per
//! read:
//!
//! ```text
//! client → node   timestamp: u64
//! node  → client  nonce: 4B
//! client → node   name: u64-array ‖ code: 64B
//! node  → client  ok: bool
//! ```
//!
//! The node draws a fresh nonce per connection attempt and never reuses it.
//! Validation failures are distinguished only in the node's log; the wire
//! answer is a bare `ok = false` followed by close.

use std::collections::HashMap;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    auth::{
        credentials::{MAX_NAME_LEN, is_graph},
        hmac::{CODE_LEN, Code, Key, Nonce, confirm, hmac_code},
    },
    client::{
        common::{RawMsg, io_with_timeout},
        connection::{ConnLimits, ConnStats},
        error::{ConnError, ConnResult},
        recv::MsgReader,
        send,
    },
    utils::epoch_seconds,
    wire::{
        fields::{FieldReader, FieldWriter},
        header::{MsgType, PROTOCOL_VERSION},
    },
};

/// Exchange protocol version bytes. Both sides write first, then read; a
/// mismatch is fatal and reports both numbers.
async fn exchange_version<S>(
    stream: &mut S,
    limits: &ConnLimits,
    cancel: &CancellationToken,
) -> ConnResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    io_with_timeout(
        "write protocol version",
        stream.write_u8(PROTOCOL_VERSION),
        limits.io_timeout,
        cancel,
    )
    .await?;

    let theirs = io_with_timeout(
        "read protocol version",
        stream.read_u8(),
        limits.io_timeout,
        cancel,
    )
    .await?;

    if theirs != PROTOCOL_VERSION {
        return Err(ConnError::VersionMismatch {
            ours: PROTOCOL_VERSION,
            theirs,
        });
    }
    Ok(())
}

async fn send_auth_msg<S>(
    stream: &mut S,
    w: FieldWriter,
    limits: &ConnLimits,
    stats: &ConnStats,
) -> ConnResult<()>
where
    S: AsyncWrite + Unpin,
{
    let fields = w.into_message(MsgType::AUTHENTICATION, limits.max_body_length)?;
    timeout(limits.io_timeout, send::write_msg(stream, fields, stats))
        .await
        .map_err(|_| {
            ConnError::io(
                "write handshake message",
                std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline exceeded"),
            )
        })?
}

async fn recv_auth_msg<S>(
    stream: &mut S,
    reader: &mut MsgReader,
    limits: &ConnLimits,
) -> ConnResult<RawMsg>
where
    S: AsyncRead + Unpin,
{
    let msg = timeout(limits.io_timeout, reader.next_msg(stream))
        .await
        .map_err(|_| {
            ConnError::io(
                "read handshake message",
                std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline exceeded"),
            )
        })??;
    if msg.msg_type != MsgType::AUTHENTICATION {
        return Err(ConnError::protocol(format!(
            "expected authentication message, got type 0x{:02x}",
            msg.msg_type.raw()
        )));
    }
    Ok(msg)
}

/// Client side of the handshake. On success the socket is ready for the
/// multiplexed regime.
pub async fn client_authenticate<S>(
    stream: &mut S,
    name: &str,
    key: &Key,
    limits: &ConnLimits,
) -> ConnResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cancel = CancellationToken::new();
    let stats = ConnStats::default();
    let mut reader = MsgReader::new(limits.max_body_length);

    exchange_version(stream, limits, &cancel).await?;

    let ts = epoch_seconds();
    let mut w = FieldWriter::new();
    w.put_u64(ts);
    send_auth_msg(stream, w, limits, &stats).await?;

    let msg = recv_auth_msg(stream, &mut reader, limits).await?;
    let mut rd = FieldReader::new(&msg.body);
    let nonce = Nonce::read(&mut rd)?;
    if rd.remaining() != 0 {
        return Err(ConnError::protocol("trailing bytes after nonce"));
    }

    let code = hmac_code(key, ts, nonce);
    let mut w = FieldWriter::new();
    w.put_array(name.as_bytes().to_vec());
    w.put_fixed(&code.0);
    send_auth_msg(stream, w, limits, &stats).await?;

    let msg = recv_auth_msg(stream, &mut reader, limits).await?;
    let mut rd = FieldReader::new(&msg.body);
    let ok = rd.bool("authentication result")?;
    if rd.remaining() != 0 {
        return Err(ConnError::protocol("trailing bytes after authentication result"));
    }

    if !ok {
        return Err(ConnError::AuthRejected {
            reason: "node rejected authentication".to_string(),
            timestamp: ts,
            nonce: Some(nonce),
            name: Some(name.to_string()),
            code: Some(code),
        });
    }

    debug!(client = name, "authenticated to node");
    Ok(())
}

/// Node-side validation, in exactly this order. Returns the authenticated
/// client name, or a log-only reason string; the wire only ever sees
/// `ok = false`.
pub fn validate_auth(
    creds: &HashMap<String, Key>,
    name: &[u8],
    timestamp: u64,
    nonce: Nonce,
    code: &Code,
    node_time: u64,
    skew_limit: u64,
) -> Result<String, &'static str> {
    if name.is_empty() {
        return Err("empty client name");
    }
    if name.len() > MAX_NAME_LEN {
        return Err("client name longer than 100 bytes");
    }
    let known = std::str::from_utf8(name)
        .ok()
        .and_then(|n| creds.get(n).map(|k| (n, k)));
    let Some((name, key)) = known else {
        return Err(if name.iter().any(|&b| !is_graph(b)) {
            "invalid character in client name"
        } else {
            "unknown client"
        });
    };
    if timestamp > i64::MAX as u64 {
        return Err("timestamp out of range");
    }
    if timestamp == 0 {
        return Err("timestamp is zero");
    }
    if timestamp.abs_diff(node_time) > skew_limit {
        return Err("Client/node timestamp difference > 30 minutes");
    }
    if !confirm(key, timestamp, nonce, code) {
        return Err("HMAC code mismatch");
    }
    Ok(name.to_string())
}

/// Node side of the handshake. Returns the authenticated client name; any
/// rejection replies `ok = false` and surfaces as [`ConnError::AuthRejected`]
/// so the accept loop can log and drop the socket.
pub async fn node_authenticate<S>(
    stream: &mut S,
    creds: &HashMap<String, Key>,
    limits: &ConnLimits,
) -> ConnResult<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cancel = CancellationToken::new();
    let stats = ConnStats::default();
    let mut reader = MsgReader::new(limits.max_body_length);

    exchange_version(stream, limits, &cancel).await?;

    let msg = recv_auth_msg(stream, &mut reader, limits).await?;
    let mut rd = FieldReader::new(&msg.body);
    let timestamp = rd.u64("timestamp")?;
    if rd.remaining() != 0 {
        return Err(ConnError::protocol("trailing bytes after timestamp"));
    }

    // One fresh nonce per connection attempt.
    let nonce = Nonce::generate();
    let mut w = FieldWriter::new();
    w.put_fixed(&nonce.0);
    send_auth_msg(stream, w, limits, &stats).await?;

    let msg = recv_auth_msg(stream, &mut reader, limits).await?;
    let mut rd = FieldReader::new(&msg.body);
    let name_bytes = rd.array("client name")?.to_vec();
    let code = Code(rd.fixed::<CODE_LEN>("authentication code")?);
    if rd.remaining() != 0 {
        return Err(ConnError::protocol("trailing bytes after authentication code"));
    }

    let verdict = validate_auth(
        creds,
        &name_bytes,
        timestamp,
        nonce,
        &code,
        epoch_seconds(),
        limits.auth_skew_limit,
    );

    let mut w = FieldWriter::new();
    w.put_bool(verdict.is_ok());
    send_auth_msg(stream, w, limits, &stats).await?;

    match verdict {
        Ok(client) => {
            info!(client, "client authenticated");
            Ok(client)
        },
        Err(reason) => {
            let shown = String::from_utf8_lossy(&name_bytes).into_owned();
            warn!(client = %shown, reason, timestamp, nonce = %nonce, "authentication rejected");
            Err(ConnError::AuthRejected {
                reason: reason.to_string(),
                timestamp,
                nonce: Some(nonce),
                name: Some(shown),
                code: Some(code),
            })
        },
    }
}
