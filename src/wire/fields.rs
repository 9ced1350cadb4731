// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Body field encoding and decoding.
//!
//! A body is a concatenation of fields with no padding: fixed-size
//! primitives serialized little-endian, and dynamic arrays written as a
//! `u64` length followed by the raw element bytes. A body that consists of
//! exactly one dynamic array and nothing else omits the length prefix; the
//! whole body is the array content.
//!
//! [`FieldWriter`] gathers fields as separate [`Bytes`] slices so the send
//! path can hand the whole message to one vectored write without copying
//! the payload into a staging buffer.

use bytes::{BufMut, Bytes, BytesMut};

use crate::wire::header::{MessageHeader, MsgType, WireError};

/// Gathers body fields and finishes them into a ready-to-send gather list.
#[derive(Debug, Default)]
pub struct FieldWriter {
    fields: Vec<Bytes>,
    body_len: usize,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer for a request-scoped body: the request id is always the first
    /// field.
    pub fn for_request(request_id: u64) -> Self {
        let mut w = Self::new();
        w.put_u64(request_id);
        w
    }

    #[inline]
    fn push(&mut self, field: Bytes) {
        self.body_len += field.len();
        self.fields.push(field);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.push(Bytes::copy_from_slice(&[v]));
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.push(Bytes::copy_from_slice(&v.to_le_bytes()));
    }

    pub fn put_u32(&mut self, v: u32) {
        self.push(Bytes::copy_from_slice(&v.to_le_bytes()));
    }

    pub fn put_u64(&mut self, v: u64) {
        self.push(Bytes::copy_from_slice(&v.to_le_bytes()));
    }

    /// Fixed-size field: raw bytes, no length prefix. The width is part of
    /// the message contract (e.g. a 64-byte HMAC code, a 4-byte nonce).
    pub fn put_fixed(&mut self, bytes: &[u8]) {
        self.push(Bytes::copy_from_slice(bytes));
    }

    /// Dynamic array: `u64` length prefix followed by the content. The
    /// content [`Bytes`] is kept as its own gather slice.
    pub fn put_array(&mut self, content: impl Into<Bytes>) {
        let content = content.into();
        let mut prefix = BytesMut::with_capacity(8);
        prefix.put_u64_le(content.len() as u64);
        self.push(prefix.freeze());
        self.push(content);
    }

    /// Single-array body special case: the entire remaining body is the
    /// array content, with no length prefix. Must be the only field besides
    /// a possible request id.
    pub fn put_trailing(&mut self, content: impl Into<Bytes>) {
        self.push(content.into());
    }

    #[inline]
    pub fn body_len(&self) -> usize {
        self.body_len
    }

    /// Finish a request-scoped body: the request id is spliced in as the
    /// first field, ahead of whatever the caller gathered.
    pub fn into_request_message(
        mut self,
        request_id: u64,
        msg_type: MsgType,
        max_body: usize,
    ) -> Result<Vec<Bytes>, WireError> {
        self.fields
            .insert(0, Bytes::copy_from_slice(&request_id.to_le_bytes()));
        self.body_len += 8;
        self.into_message(msg_type, max_body)
    }

    /// Finish into `[header, field...]`, ready for one vectored write.
    pub fn into_message(
        self,
        msg_type: MsgType,
        max_body: usize,
    ) -> Result<Vec<Bytes>, WireError> {
        if self.body_len > max_body {
            return Err(WireError::BodyTooLarge {
                len: self.body_len,
                max: max_body,
            });
        }
        let header = MessageHeader::new(msg_type, self.body_len as u32);
        let mut out = Vec::with_capacity(1 + self.fields.len());
        out.push(Bytes::copy_from_slice(&header.to_wire()));
        out.extend(self.fields);
        Ok(out)
    }
}

/// Cursor over a received body. The header-body boundary was already drawn
/// by the receive path; this never re-reads the socket.
#[derive(Debug)]
pub struct FieldReader<'a> {
    buf: &'a [u8],
}

impl<'a> FieldReader<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self { buf: body }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], WireError> {
        if self.buf.len() < n {
            return Err(WireError::ShortField {
                what,
                needed: n - self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn u8(&mut self, what: &'static str) -> Result<u8, WireError> {
        Ok(self.take(1, what)?[0])
    }

    /// Strict boolean: only 0 and 1 are valid on the wire.
    pub fn bool(&mut self, what: &'static str) -> Result<bool, WireError> {
        match self.u8(what)? {
            0 => Ok(false),
            1 => Ok(true),
            got => Err(WireError::UnexpectedType { got, expected: 1 }),
        }
    }

    pub fn u16(&mut self, what: &'static str) -> Result<u16, WireError> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self, what: &'static str) -> Result<u32, WireError> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self, what: &'static str) -> Result<u64, WireError> {
        let b = self.take(8, what)?;
        let mut le = [0u8; 8];
        le.copy_from_slice(b);
        Ok(u64::from_le_bytes(le))
    }

    pub fn fixed<const N: usize>(
        &mut self,
        what: &'static str,
    ) -> Result<[u8; N], WireError> {
        let b = self.take(N, what)?;
        let mut out = [0u8; N];
        out.copy_from_slice(b);
        Ok(out)
    }

    /// Length-prefixed dynamic array.
    pub fn array(&mut self, what: &'static str) -> Result<&'a [u8], WireError> {
        let len = self.u64(what)?;
        let len = usize::try_from(len).map_err(|_| WireError::ShortField {
            what,
            needed: usize::MAX,
        })?;
        self.take(len, what)
    }

    /// The single-array special case: everything left is the content.
    pub fn trailing(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}

/// Primitive value readable as a complete single-field body.
pub trait WireValue: Sized {
    fn read(rd: &mut FieldReader<'_>) -> Result<Self, WireError>;
}

impl WireValue for u8 {
    fn read(rd: &mut FieldReader<'_>) -> Result<Self, WireError> {
        rd.u8("u8 value")
    }
}

impl WireValue for bool {
    fn read(rd: &mut FieldReader<'_>) -> Result<Self, WireError> {
        rd.bool("bool value")
    }
}

impl WireValue for u16 {
    fn read(rd: &mut FieldReader<'_>) -> Result<Self, WireError> {
        rd.u16("u16 value")
    }
}

impl WireValue for u32 {
    fn read(rd: &mut FieldReader<'_>) -> Result<Self, WireError> {
        rd.u32("u32 value")
    }
}

impl WireValue for u64 {
    fn read(rd: &mut FieldReader<'_>) -> Result<Self, WireError> {
        rd.u64("u64 value")
    }
}
