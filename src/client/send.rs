// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Vector-I/O send path.
//!
//! A message leaves the framing layer as a gather list of [`Bytes`] fields,
//! header first. [`IovCursor`] tracks how much of the list one vectored
//! write accepted: fully-written slices are dropped, the first partial slice
//! is advanced in place, and the remainder stays owned until the next
//! writability. [`write_msg`] loops the cursor to completion, so a message's
//! bytes are contiguous on the wire and a later message never starts before
//! an earlier one finishes.

use std::io::IoSlice;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::client::{
    connection::ConnStats,
    error::{ConnError, ConnResult},
};

/// Partial-write tracker over a gather list.
#[derive(Debug)]
pub struct IovCursor {
    fields: Vec<Bytes>,
    /// Index of the first slice with unwritten bytes.
    head: usize,
}

impl IovCursor {
    pub fn new(fields: Vec<Bytes>) -> Self {
        let mut cur = Self { fields, head: 0 };
        cur.skip_empty();
        cur
    }

    fn skip_empty(&mut self) {
        while self.head < self.fields.len() && self.fields[self.head].is_empty() {
            self.head += 1;
        }
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.head >= self.fields.len()
    }

    pub fn remaining(&self) -> usize {
        self.fields[self.head..].iter().map(Bytes::len).sum()
    }

    /// Unwritten slices, for one `writev`-style call.
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.fields[self.head..]
            .iter()
            .map(|b| IoSlice::new(b))
            .collect()
    }

    /// Charge `written` bytes against the list: drop complete slices,
    /// truncate the first partial one from the front.
    pub fn advance(&mut self, mut written: usize) {
        while written > 0 {
            let field = &mut self.fields[self.head];
            if written >= field.len() {
                written -= field.len();
                self.head += 1;
            } else {
                field.advance(written);
                written = 0;
            }
        }
        self.skip_empty();
    }
}

/// Write one whole message with as few syscalls as the socket allows.
///
/// Each partial acceptance counts one io-wait in the stats; completion
/// accounts the message and its size.
pub async fn write_msg<W>(
    w: &mut W,
    fields: Vec<Bytes>,
    stats: &ConnStats,
) -> ConnResult<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = fields.iter().map(Bytes::len).sum();
    let mut cur = IovCursor::new(fields);

    while !cur.is_done() {
        let slices = cur.io_slices();
        let n = w
            .write_vectored(&slices)
            .await
            .map_err(|e| ConnError::io("write message", e))?;
        if n == 0 {
            return Err(ConnError::io(
                "write message",
                std::io::Error::new(std::io::ErrorKind::WriteZero, "wrote 0 bytes"),
            ));
        }
        stats.account_write_call(n);
        cur.advance(n);
        if !cur.is_done() {
            stats.account_io_wait();
        }
    }

    stats.account_msg_out(total);
    Ok(())
}
