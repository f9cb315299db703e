//! Typed configuration for the peer directory and gossip transport.
//!
//! Loaded from TOML via `serde`; every field with a spec-given default
//! has a matching [`Default`] value so a minimal config file is enough
//! to boot a node.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// A seed peer from the frozen whitelist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedPeer {
    pub ip: String,
    pub port: u16,
}

/// Outbound request tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerOptions {
    /// Max peers accepted per refresh cycle.
    #[serde(default = "default_max_update_peers")]
    pub max_update_peers: usize,
    /// Outbound HTTP timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_max_update_peers() -> usize {
    20
}

fn default_timeout_ms() -> u64 {
    5_000
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            max_update_peers: default_max_update_peers(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Root configuration for the peer directory / transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeersConfig {
    /// Frozen whitelist seed peers (`config.peers.list` in the source).
    #[serde(default)]
    pub list: Vec<SeedPeer>,
    #[serde(default)]
    pub options: PeerOptions,
    /// Network identifier; peers on a different nethash never exchange data.
    pub nethash: String,
    /// Minimum accepted peer version; below this, ingest rejects the peer.
    pub min_version: String,
    /// This node's own version, echoed on every outbound/inbound header.
    pub current_version: String,
    /// Operating system string echoed in outbound headers.
    #[serde(default = "default_os")]
    pub os: String,
    /// Address the inbound `/peer` and `/api/peers` HTTP mounts bind to.
    pub listen_address: SocketAddr,
    /// Build identifier surfaced by `GET /api/peers/version`.
    #[serde(default)]
    pub build: String,
}

fn default_os() -> String {
    "unknown".to_string()
}

impl PeersConfig {
    /// Parses configuration from a TOML document.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}
