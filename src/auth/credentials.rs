// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Credential file parsing and the hot-reloadable registry.
//!
//! Grammar: `file := line*`, `line := name ":" hexkey ("\n" | EOF)`. Names
//! are 1..=100 bytes of ASCII graph characters; keys are `2 * KEY_LEN` hex
//! digits, case-insensitive. The loader is side-effect-free and re-entrant:
//! a reload parses the whole file before the store swaps snapshots, so live
//! authenticators keep the mapping they started with.

use std::{collections::HashMap, fs, path::Path, sync::Arc, sync::RwLock};

use anyhow::{Context, Result, bail, ensure};

use crate::auth::hmac::{KEY_LEN, Key};

/// Upper bound on a client name.
pub const MAX_NAME_LEN: usize = 100;
/// Upper bound on a credentials file.
pub const MAX_FILE_LEN: u64 = 10 * 1024 * 1024;

/// POSIX `graph` class: printable, non-whitespace ASCII.
#[inline]
pub fn is_graph(b: u8) -> bool {
    (0x21..=0x7e).contains(&b)
}

/// Check a client name against the length and character limits.
pub fn validate_name(name: &[u8]) -> Result<()> {
    ensure!(!name.is_empty(), "client name is empty");
    ensure!(
        name.len() <= MAX_NAME_LEN,
        "client name longer than {MAX_NAME_LEN} bytes"
    );
    ensure!(
        name.iter().all(|&b| is_graph(b)),
        "client name contains a non-graph byte"
    );
    Ok(())
}

/// One registered client.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub name: String,
    pub key: Key,
}

/// Parse credential lines into a name → key mapping.
pub fn parse_credentials(text: &str) -> Result<HashMap<String, Key>> {
    let mut out = HashMap::new();
    for (idx, line) in text.split_terminator('\n').enumerate() {
        let lineno = idx + 1;
        let Some((name, hexkey)) = line.split_once(':') else {
            bail!("line {lineno}: missing ':' separator");
        };
        ensure!(
            !hexkey.contains(':'),
            "line {lineno}: more than one ':' separator"
        );
        validate_name(name.as_bytes()).with_context(|| format!("line {lineno}"))?;
        ensure!(
            hexkey.len() == 2 * KEY_LEN,
            "line {lineno}: key must be {} hex characters, got {}",
            2 * KEY_LEN,
            hexkey.len()
        );
        let key =
            Key::from_hex(hexkey).with_context(|| format!("line {lineno}: bad key"))?;
        ensure!(
            out.insert(name.to_string(), key).is_none(),
            "line {lineno}: duplicate client name {name:?}"
        );
    }
    Ok(out)
}

/// Load a credentials file, enforcing the size limit before reading.
pub fn load_credentials<P: AsRef<Path>>(path: P) -> Result<HashMap<String, Key>> {
    let path = path.as_ref();
    let meta = fs::metadata(path)
        .with_context(|| format!("cannot stat credentials file {path:?}"))?;
    ensure!(
        meta.len() <= MAX_FILE_LEN,
        "credentials file {path:?} exceeds {MAX_FILE_LEN} bytes"
    );
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read credentials file {path:?}"))?;
    parse_credentials(&text).with_context(|| format!("credentials file {path:?}"))
}

/// Load a single client key file: one 256-hex-digit key, optional trailing
/// newline.
pub fn load_client_key<P: AsRef<Path>>(path: P) -> Result<Key> {
    let path = path.as_ref();
    let text =
        fs::read_to_string(path).with_context(|| format!("cannot read key file {path:?}"))?;
    Key::from_hex(text.trim_end()).with_context(|| format!("key file {path:?}"))
}

/// Read-mostly credential registry shared across connections.
///
/// Readers take an [`Arc`] snapshot that outlives their authentication
/// attempt; a reload swaps the snapshot atomically underneath them.
#[derive(Debug)]
pub struct CredentialsStore {
    inner: RwLock<Arc<HashMap<String, Key>>>,
}

impl CredentialsStore {
    pub fn new(map: HashMap<String, Key>) -> Self {
        Self {
            inner: RwLock::new(Arc::new(map)),
        }
    }

    pub fn from_entries(entries: impl IntoIterator<Item = Credentials>) -> Self {
        Self::new(
            entries
                .into_iter()
                .map(|c| (c.name, c.key))
                .collect::<HashMap<_, _>>(),
        )
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(load_credentials(path)?))
    }

    /// Current snapshot. Hold it for the whole authentication attempt.
    pub fn snapshot(&self) -> Arc<HashMap<String, Key>> {
        Arc::clone(&self.inner.read().expect("credentials lock poisoned"))
    }

    /// Parse the file fully, then swap. On a parse error the previous
    /// mapping stays in place.
    pub fn reload_from<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let fresh = load_credentials(path)?;
        let count = fresh.len();
        *self.inner.write().expect("credentials lock poisoned") = Arc::new(fresh);
        Ok(count)
    }
}
