// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection-fatal error taxonomy.
//!
//! Every variant here kills the connection it occurred on: the driver
//! records the first error as the connection exception and fans it out to
//! all live requests, which is why the type is `Clone`. Programming errors
//! (duplicate registrations, stale resume tokens, self-abort) are not
//! represented here; those panic.

use std::{io, panic::Location, sync::Arc};

use thiserror::Error;

use crate::{
    auth::hmac::{Code, Nonce},
    wire::header::WireError,
};

pub type ConnResult<T> = Result<T, ConnError>;

#[derive(Debug, Clone, Error)]
pub enum ConnError {
    /// Framing or exchange violation. Carries the raising site.
    #[error("protocol error: {msg} ({file}:{line})")]
    Protocol {
        msg: String,
        file: &'static str,
        line: u32,
    },

    /// The peer speaks a different protocol revision.
    #[error("protocol version mismatch: ours={ours} peer={theirs}")]
    VersionMismatch { ours: u8, theirs: u8 },

    /// Syscall failure on the socket. The error is shared, not chained: one
    /// failure fans out to every live request.
    #[error("i/o failure during {op}: {err}")]
    Io {
        op: &'static str,
        err: Arc<io::Error>,
    },

    /// EOF or peer hang-up. Requests distinguish this only by type.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Handshake rejection. Best-effort context, never the key.
    #[error("authentication rejected: {reason}")]
    AuthRejected {
        reason: String,
        timestamp: u64,
        nonce: Option<Nonce>,
        name: Option<String>,
        code: Option<Code>,
    },
}

impl ConnError {
    /// Build a [`ConnError::Protocol`] stamped with the caller's location.
    #[track_caller]
    pub fn protocol(msg: impl Into<String>) -> Self {
        let loc = Location::caller();
        ConnError::Protocol {
            msg: msg.into(),
            file: loc.file(),
            line: loc.line(),
        }
    }

    pub fn io(op: &'static str, err: io::Error) -> Self {
        ConnError::Io {
            op,
            err: Arc::new(err),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnError::ConnectionClosed)
    }
}

impl From<WireError> for ConnError {
    fn from(e: WireError) -> Self {
        ConnError::protocol(e.to_string())
    }
}
