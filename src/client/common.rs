// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{io, time::Duration};

use bytes::Bytes;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::{
    client::error::{ConnError, ConnResult},
    wire::header::MsgType,
};

/// Run one I/O future under the connection's cancel token and a deadline.
/// Used only during connection setup; steady-state paths observe the token
/// alone.
pub(crate) async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> ConnResult<T>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(ConnError::ConnectionClosed),
        res = timeout(io_timeout, fut) => {
            match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(ConnError::io(label, e)),
                Err(_) => Err(ConnError::io(
                    label,
                    io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded"),
                )),
            }
        }
    }
}

/// One complete framed message as delivered by the receive path. The body
/// excludes the header; request-scoped bodies still start with the id.
#[derive(Debug, Clone)]
pub struct RawMsg {
    pub msg_type: MsgType,
    pub body: Bytes,
}
