// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Stream receive path.
//!
//! One [`BytesMut`] window holds the unparsed tail of the byte stream. Each
//! read appends; the parser peels off as many complete messages as are
//! buffered and keeps partial trailing data for the next read. Once a header
//! has been seen the buffer is grown to fit `header + body_length`, which is
//! also what bounds an attacker-supplied length (the header was parity- and
//! size-checked first).
//!
//! The handshake uses the single-message form ([`MsgReader::next_msg`]):
//! deliver one message, slide the rest forward. Steady state drains every
//! buffered message before suspending again.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    client::{
        common::RawMsg,
        error::{ConnError, ConnResult},
    },
    wire::header::{HEADER_LEN, MessageHeader, WireError},
};

/// Initial window size.
pub const INITIAL_RECV_BUFFER: usize = 64 * 1024;

#[derive(Debug)]
pub struct MsgReader {
    buf: BytesMut,
    max_body: usize,
}

impl MsgReader {
    pub fn new(max_body: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_RECV_BUFFER),
            max_body,
        }
    }

    /// Bytes buffered but not yet delivered.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Peel one complete message off the front of the window, if buffered.
    pub fn poll_buffered(&mut self) -> Result<Option<RawMsg>, WireError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = MessageHeader::parse(&self.buf, self.max_body)?;
        let total = HEADER_LEN + header.body_len();
        if self.buf.len() < total {
            // Complete header, partial body: make room for the rest so the
            // next read can append without growing twice.
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }
        let mut msg = self.buf.split_to(total);
        msg.advance(HEADER_LEN);
        Ok(Some(RawMsg {
            msg_type: header.msg_type,
            body: msg.freeze(),
        }))
    }

    /// One `read` into the window. Returns the byte count; 0 only at EOF,
    /// which the caller translates into [`ConnError::ConnectionClosed`].
    pub async fn fill<R>(&mut self, r: &mut R) -> ConnResult<usize>
    where
        R: AsyncRead + Unpin,
    {
        if self.buf.capacity() == self.buf.len() {
            self.buf.reserve(INITIAL_RECV_BUFFER);
        }
        let n = r
            .read_buf(&mut self.buf)
            .await
            .map_err(|e| ConnError::io("read message", e))?;
        Ok(n)
    }

    /// Single-message mode: read until one complete message is available and
    /// deliver exactly it, preserving any trailing bytes for the next call.
    pub async fn next_msg<R>(&mut self, r: &mut R) -> ConnResult<RawMsg>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(msg) = self.poll_buffered()? {
                return Ok(msg);
            }
            if self.fill(r).await? == 0 {
                return Err(ConnError::ConnectionClosed);
            }
        }
    }
}
