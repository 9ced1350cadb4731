// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! HMAC-SHA512 challenge primitives.
//!
//! The authentication code is computed over the exact byte concatenation
//! `timestamp (8B little-endian) ‖ nonce (4B)` with the client's shared key.
//! Verification recomputes and compares in constant time.

use core::fmt;

use anyhow::{Context, Result, ensure};
use hex_literal::hex;
use hmac::{Hmac, Mac};
use rand::RngExt;
use sha2::Sha512;
use subtle::ConstantTimeEq;

use crate::wire::header::WireError;

/// Key length: the HMAC-SHA512 block size.
pub const KEY_LEN: usize = 128;
/// Code length: the SHA-512 output size.
pub const CODE_LEN: usize = 64;
/// Nonce length.
pub const NONCE_LEN: usize = 4;

type HmacSha512 = Hmac<Sha512>;

/// A client's shared secret. By-value fixed array, never heap-allocated.
///
/// `Debug` is redacted: keys must not reach logs or error messages.
#[derive(Clone, PartialEq, Eq)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Decode from the on-disk representation: exactly `2 * KEY_LEN` hex
    /// digits, case-insensitive.
    pub fn from_hex(s: &str) -> Result<Self> {
        ensure!(
            s.len() == 2 * KEY_LEN,
            "key must be {} hex characters, got {}",
            2 * KEY_LEN,
            s.len()
        );
        let raw = hex::decode(s).context("key is not valid hex")?;
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key(<redacted>)")
    }
}

/// A 64-byte HMAC-SHA512 tag.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Code(pub [u8; CODE_LEN]);

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code({})", hex::encode(self.0))
    }
}

/// A 4-byte server challenge, freshly drawn per authentication attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce(pub [u8; NONCE_LEN]);

impl Nonce {
    /// Draw a fresh nonce from the thread CSPRNG. Called exactly once per
    /// connection attempt on the server side.
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        rand::rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    pub fn read(rd: &mut crate::wire::fields::FieldReader<'_>) -> Result<Self, WireError> {
        Ok(Self(rd.fixed::<NONCE_LEN>("nonce")?))
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// `HMAC(key, timestamp_le ‖ nonce)`.
pub fn hmac_code(key: &Key, timestamp: u64, nonce: Nonce) -> Code {
    let mut mac = HmacSha512::new_from_slice(key.as_bytes())
        .expect("HMAC-SHA512 accepts keys of any length");
    mac.update(&timestamp.to_le_bytes());
    mac.update(&nonce.0);
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; CODE_LEN];
    out.copy_from_slice(&tag);
    Code(out)
}

/// Recompute and compare in constant time.
pub fn confirm(key: &Key, timestamp: u64, nonce: Nonce, received: &Code) -> bool {
    hmac_code(key, timestamp, nonce).0.ct_eq(&received.0).into()
}

/// Known-answer self-test, run once at process start. The engine must not
/// come up with a broken or disabled HMAC implementation; a failure here is
/// the one reserved fatal exit.
///
/// The vector is RFC 4231 test case 1.
pub fn self_test() -> Result<()> {
    let mut mac = HmacSha512::new_from_slice(&[0x0b; 20])
        .context("HMAC-SHA512 rejected the self-test key")?;
    mac.update(b"Hi There");
    let tag = mac.finalize().into_bytes();

    let expected = hex!(
        "87aa7cdea5ef619d4ff0b4241a1d6cb0"
        "2379f4e2ce4ec2787ad0b30545e17cde"
        "daa833b7d6b8a702038b274eaea3f4e4"
        "be9d914eeb61f1702e696c203a126854"
    );
    ensure!(
        tag.as_slice() == expected,
        "HMAC-SHA512 known-answer self-test failed"
    );
    Ok(())
}
