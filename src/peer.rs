//! The `Peer` record and its normalization (`inspect`).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Peer connection state.
///
/// `BANNED` is transient and clock-scoped; `DISCONNECTED` is the default
/// resting state; `CONNECTED` means the peer answered (or contacted us)
/// within the current handshake window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PeerState {
    Banned = 0,
    Disconnected = 1,
    Connected = 2,
}

impl PeerState {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Banned),
            1 => Some(Self::Disconnected),
            2 => Some(Self::Connected),
            _ => None,
        }
    }
}

/// A directory entry. `(ip, port)` is the primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub ip: Option<String>,
    pub port: u16,
    pub state: Option<PeerState>,
    pub os: String,
    pub version: String,
    /// Absolute millisecond timestamp a ban expires at; `None` when not banned.
    pub clock: Option<i64>,
    pub dapps: HashSet<String>,
}

impl Peer {
    /// `ip:port`, or `"unknown"` when `ip` is absent. Logging only.
    pub fn string(&self) -> String {
        match &self.ip {
            Some(ip) => format!("{ip}:{}", self.port),
            None => "unknown".to_string(),
        }
    }
}

/// Raw, loosely-typed input accepted by [`inspect`] — mirrors what an
/// inbound request or a peer-exchange response entry can carry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPeer {
    pub ip: Option<String>,
    pub port: Option<serde_json::Value>,
    pub state: Option<i64>,
    pub os: Option<String>,
    pub version: Option<String>,
    pub clock: Option<i64>,
    pub dappid: Option<DappId>,
}

/// `dappid` may arrive as a single string or a list of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DappId {
    One(String),
    Many(Vec<String>),
}

impl DappId {
    fn into_set(self) -> HashSet<String> {
        match self {
            DappId::One(s) => HashSet::from([s]),
            DappId::Many(v) => v.into_iter().collect(),
        }
    }
}

/// Converts a 32-bit value (the long form produced by `ip2long`) into a
/// dotted-quad string.
pub fn long_to_ip(v: u32) -> String {
    Ipv4Addr::from(v).to_string()
}

fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Coerces a JSON port value to `u16`; non-numeric/NaN input maps to `0`.
fn coerce_port(v: &serde_json::Value) -> u16 {
    match v {
        serde_json::Value::Number(n) => n
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .unwrap_or(0),
        serde_json::Value::String(s) => s.parse::<u16>().unwrap_or(0),
        _ => 0,
    }
}

/// Normalizes a raw peer record. Pure; never fails.
///
/// If `ip` is all-decimal-digits it is read as the 32-bit long form and
/// converted to dotted-quad. Port coerces to `u16`, `os`/`version` fall
/// back to their defaults, and a `dappid` (if present) seeds `dapps`.
pub fn inspect(raw: RawPeer) -> Peer {
    let ip = raw.ip.map(|ip| {
        if is_decimal(&ip) {
            ip.parse::<u32>()
                .map(long_to_ip)
                .unwrap_or(ip)
        } else {
            ip
        }
    });
    let port = raw.port.as_ref().map(coerce_port).unwrap_or(0);
    let os = raw
        .os
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    let version = raw
        .version
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "0.0.0".to_string());
    let dapps = raw.dappid.map(DappId::into_set).unwrap_or_default();

    Peer {
        ip,
        port,
        state: raw.state.and_then(PeerState::from_i64),
        os,
        version,
        clock: raw.clock,
        dapps,
    }
}

/// Compares two dotted `major.minor.patch[...]` version strings
/// component-wise; non-numeric components compare as `0`.
pub fn version_lt(a: &str, b: &str) -> bool {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|p| p.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
            .map(|p| p.parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (pa, pb) = (parse(a), parse(b));
    for i in 0..pa.len().max(pb.len()) {
        let (x, y) = (pa.get(i).copied().unwrap_or(0), pb.get(i).copied().unwrap_or(0));
        if x != y {
            return x < y;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(ip: &str, port: i64) -> RawPeer {
        RawPeer {
            ip: Some(ip.to_string()),
            port: Some(serde_json::Value::from(port)),
            ..Default::default()
        }
    }

    #[test]
    fn numeric_ip_converts_to_dotted_quad() {
        let p = inspect(raw("3232235521", 8000));
        assert_eq!(p.ip.as_deref(), Some("192.168.0.1"));
    }

    #[test]
    fn nan_port_maps_to_zero() {
        let mut r = raw("1.2.3.4", 0);
        r.port = Some(serde_json::Value::from("not-a-number"));
        let p = inspect(r);
        assert_eq!(p.port, 0);
    }

    #[test]
    fn defaults_fill_os_and_version() {
        let p = inspect(raw("1.2.3.4", 8000));
        assert_eq!(p.os, "unknown");
        assert_eq!(p.version, "0.0.0");
    }

    #[test]
    fn inspect_is_idempotent() {
        let p1 = inspect(raw("3232235521", 8000));
        let as_raw = RawPeer {
            ip: p1.ip.clone(),
            port: Some(serde_json::Value::from(p1.port)),
            state: p1.state.map(|s| s as i64),
            os: Some(p1.os.clone()),
            version: Some(p1.version.clone()),
            clock: p1.clock,
            dappid: None,
        };
        let p2 = inspect(as_raw);
        assert_eq!(p1.ip, p2.ip);
        assert_eq!(p1.port, p2.port);
        assert_eq!(p1.os, p2.os);
        assert_eq!(p1.version, p2.version);
    }

    #[test]
    fn version_ordering() {
        assert!(version_lt("0.0.1", "0.5.0"));
        assert!(!version_lt("0.5.0", "0.0.1"));
        assert!(!version_lt("0.5.0", "0.5.0"));
    }

    #[test]
    fn derived_string_uses_unknown_when_ip_absent() {
        let p = Peer {
            ip: None,
            port: 0,
            state: None,
            os: "unknown".into(),
            version: "0.0.0".into(),
            clock: None,
            dapps: HashSet::new(),
        };
        assert_eq!(p.string(), "unknown");
    }
}
