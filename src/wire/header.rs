// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The 7-byte message header and its parity word.
//!
//! Layout on the wire (no padding, all little-endian):
//!
//! ```text
//!  0        1..5                 5..7
//! +--------+--------------------+------------+
//! | type   | body_length (u32)  | parity u16 |
//! +--------+--------------------+------------+
//! ```
//!
//! The parity word folds `type` and both halves of `body_length` together
//! with a fixed seed, so a recompute over the received header equals the
//! stored word iff no single byte was flipped in transit. Parity is checked
//! before the length is trusted; either failure is fatal to the connection.

use core::fmt;

use thiserror::Error;
use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32,
    Unaligned,
};

/// Size of the wire header. Stable across protocol versions; evolution goes
/// through the connection-level version byte, never a per-message flag.
pub const HEADER_LEN: usize = 7;

/// Single-byte protocol version exchanged before authentication.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default upper bound on `body_length`.
pub const DEFAULT_MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// Seed folded into every parity word.
const PARITY_SEED: u16 = 0x5AC3;

/// Wire-safe message type octet. Transparent over `u8`; all values except
/// [`MsgType::AUTHENTICATION`] are application-defined.
#[repr(transparent)]
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, ZFromBytes, IntoBytes, KnownLayout,
    Immutable, Unaligned,
)]
pub struct MsgType(u8);

impl MsgType {
    /// Reserved for the connection-setup handshake; never valid afterwards.
    pub const AUTHENTICATION: MsgType = MsgType(0);

    #[inline]
    pub const fn new(v: u8) -> Self {
        Self(v)
    }

    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }
}

impl fmt::Debug for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == MsgType::AUTHENTICATION {
            f.write_str("MsgType(Authentication)")
        } else {
            write!(f, "MsgType(0x{:02x})", self.0)
        }
    }
}

/// Errors raised while framing or parsing messages. Every one of them is
/// fatal to the connection; the receiver shuts down rather than skips.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("header parity mismatch: stored 0x{stored:04x}, computed 0x{computed:04x}")]
    ParityMismatch { stored: u16, computed: u16 },

    #[error("body length {len} exceeds the configured maximum {max}")]
    BodyTooLarge { len: usize, max: usize },

    #[error("message body ended short of {what}: {needed} more byte(s) needed")]
    ShortField { what: &'static str, needed: usize },

    #[error("unexpected message type 0x{got:02x} (expected 0x{expected:02x})")]
    UnexpectedType { got: u8, expected: u8 },
}

/// Fold type and body length into the parity word.
///
/// Each header byte lands in exactly one half of the word, so flipping any
/// single byte (including either parity byte itself) breaks the equality.
#[inline]
pub fn parity_word(msg_type: MsgType, body_length: u32) -> u16 {
    let t = msg_type.raw() as u16;
    let lo = (body_length & 0xFFFF) as u16;
    let hi = (body_length >> 16) as u16;
    PARITY_SEED ^ lo ^ hi ^ (t | (t << 8))
}

/// The 7-byte wire header. `repr(C)` over alignment-1 fields, so the struct
/// is exactly [`HEADER_LEN`] bytes with no padding.
#[repr(C)]
#[derive(
    Clone, Copy, Default, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout, Immutable,
    Unaligned,
)]
pub struct MessageHeader {
    pub msg_type: MsgType,
    pub body_length: U32<LittleEndian>,
    pub parity: U16<LittleEndian>,
}

impl MessageHeader {
    /// Build a header with the parity word already computed.
    pub fn new(msg_type: MsgType, body_length: u32) -> Self {
        Self {
            msg_type,
            body_length: U32::new(body_length),
            parity: U16::new(parity_word(msg_type, body_length)),
        }
    }

    /// Parse and validate a header from the first [`HEADER_LEN`] bytes of
    /// `buf`. Parity is verified before the body length is trusted.
    pub fn parse(buf: &[u8], max_body: usize) -> Result<Self, WireError> {
        let Some(prefix) = buf.get(..HEADER_LEN) else {
            return Err(WireError::ShortField {
                what: "message header",
                needed: HEADER_LEN - buf.len(),
            });
        };
        let header = Self::read_from_bytes(prefix).map_err(|_| WireError::ShortField {
            what: "message header",
            needed: HEADER_LEN,
        })?;
        header.validate(max_body)?;
        Ok(header)
    }

    pub fn validate(&self, max_body: usize) -> Result<(), WireError> {
        let computed = parity_word(self.msg_type, self.body_length.get());
        if self.parity.get() != computed {
            return Err(WireError::ParityMismatch {
                stored: self.parity.get(),
                computed,
            });
        }
        let len = self.body_length.get() as usize;
        if len > max_body {
            return Err(WireError::BodyTooLarge { len, max: max_body });
        }
        Ok(())
    }

    #[inline]
    pub fn body_len(&self) -> usize {
        self.body_length.get() as usize
    }

    /// Serialize into a fresh [`HEADER_LEN`]-byte array.
    pub fn to_wire(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf.copy_from_slice(self.as_bytes());
        buf
    }
}

impl fmt::Debug for MessageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHeader")
            .field("msg_type", &self.msg_type)
            .field("body_length", &self.body_length.get())
            .field("parity", &format_args!("0x{:04x}", self.parity.get()))
            .finish()
    }
}
