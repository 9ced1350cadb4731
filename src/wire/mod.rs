// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! On-wire framing shared by every message after authentication.
//!
//! Every message is a 7-byte envelope followed by `body_length` body bytes:
//!
//! ```text
//! u8 type | u32 body_length (LE) | u16 parity (LE) | body
//! ```
//!
//! Bodies are a plain concatenation of fields: little-endian primitives and
//! `u64`-length-prefixed byte arrays, with no padding anywhere. Request-scoped
//! messages (every type except [`MsgType::AUTHENTICATION`]) carry the `u64`
//! request id as their first body field.

/// Body field encoding and decoding.
pub mod fields;
/// The message header and its parity word.
pub mod header;
