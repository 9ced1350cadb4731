// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    auth::credentials::validate_name,
    client::connection::ConnLimits,
    wire::header::DEFAULT_MAX_BODY_LEN,
};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Identity and key material this process presents as a client.
    #[serde(default)]
    pub client: ClientConfig,
    /// Listening endpoint and credential registry for the node role.
    #[serde(default)]
    pub node: NodeConfig,
    /// Limits shared by both roles of the connection engine.
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// Client-role settings.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ClientConfig {
    #[serde(default, rename = "ClientName")]
    /// Name presented during authentication. 1..=100 ASCII graph bytes.
    pub name: String,

    #[serde(default, rename = "KeyFile")]
    /// File holding this client's 256-hex-digit key.
    pub key_file: String,

    #[serde(default, rename = "NodeAddress")]
    /// `host:port` of the node to connect to.
    pub node_address: String,
}

/// Node-role settings.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct NodeConfig {
    #[serde(default, rename = "Listen")]
    /// `host:port` to accept client connections on.
    pub listen: String,

    #[serde(default, rename = "CredentialsFile")]
    /// `name:hexkey` registry of permitted clients.
    pub credentials_file: String,
}

/// Engine limits, identical on both sides of a connection.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConnectionConfig {
    #[serde(default = "default_max_body_length", rename = "MaxBodyLength")]
    /// Largest accepted message body, bytes.
    pub max_body_length: usize,

    #[serde(
        default = "default_timeout_io",
        rename = "TimeoutIo",
        with = "serde_secs"
    )]
    /// Deadline for connection setup I/O (connect and handshake).
    pub timeout_io: Duration,

    #[serde(default = "default_true", rename = "TcpNoDelay")]
    /// Disable Nagle on every connection.
    pub tcp_nodelay: bool,

    #[serde(default = "default_auth_skew", rename = "AuthSkewLimit")]
    /// Permitted |client − node| clock difference at authentication, seconds.
    pub auth_skew_limit: u64,
}

fn default_max_body_length() -> usize {
    DEFAULT_MAX_BODY_LEN
}

fn default_timeout_io() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_auth_skew() -> u64 {
    1800
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_body_length: default_max_body_length(),
            timeout_io: default_timeout_io(),
            tcp_nodelay: default_true(),
            auth_skew_limit: default_auth_skew(),
        }
    }
}

/// Binaries take the engine config as a path relative to the repo root;
/// resolving and canonicalizing up front keeps every later error message
/// pointing at the real file instead of the shorthand.
fn resolve_config_path(rel: &Path) -> Result<PathBuf> {
    let abs = if rel.is_absolute() {
        rel.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(rel)
    };
    abs.canonicalize()
        .with_context(|| format!("engine config {abs:?} does not resolve to a file"))
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value. Relative paths are anchored at the working
    /// directory.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = resolve_config_path(path.as_ref())?;
        let s = fs::read_to_string(&path)
            .with_context(|| format!("cannot read engine config {path:?}"))?;
        let cfg: Config = serde_yaml::from_str(&s)
            .with_context(|| format!("failed to parse config YAML {path:?}"))?;
        cfg.validate()
            .with_context(|| format!("invalid engine config {path:?}"))?;
        Ok(cfg)
    }

    /// Validates invariants across both roles.
    pub fn validate(&self) -> Result<()> {
        if !self.client.name.is_empty() {
            validate_name(self.client.name.as_bytes())
                .context("ClientName is not a valid client name")?;
            ensure!(
                !self.client.key_file.is_empty(),
                "KeyFile is required when ClientName is set"
            );
        }
        if !self.node.listen.is_empty() {
            ensure!(
                !self.node.credentials_file.is_empty(),
                "CredentialsFile is required when Listen is set"
            );
        }
        ensure!(
            self.connection.max_body_length > 0,
            "MaxBodyLength must be positive"
        );
        ensure!(
            self.connection.auth_skew_limit > 0,
            "AuthSkewLimit must be positive"
        );
        Ok(())
    }

    /// The limit set handed to every connection.
    pub fn limits(&self) -> ConnLimits {
        ConnLimits {
            max_body_length: self.connection.max_body_length,
            io_timeout: self.connection.timeout_io,
            tcp_nodelay: self.connection.tcp_nodelay,
            auth_skew_limit: self.connection.auth_skew_limit,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            node: NodeConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
