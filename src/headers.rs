//! The header contract enforced on every `/peer` request and response.

use crate::error::{NetworkError, Result};
use serde::{Deserialize, Serialize};

/// Process-wide outbound header set, assigned once when the transport binds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundHeaders {
    pub os: String,
    pub version: String,
    pub port: u16,
    pub nethash: String,
}

/// Header bag carried on an inbound request or an outbound response,
/// validated against the header schema before framing proceeds.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerHeaders {
    pub port: Option<u16>,
    pub os: Option<String>,
    pub version: Option<String>,
    pub nethash: Option<String>,
    pub ip: Option<String>,
}

/// Validates `{port, os, version, nethash, ip}` are all present and
/// within the shape constraints from SPEC_FULL §6. Surfaces the first
/// violation, matching the schema-validator contract (§7.6).
pub fn validate_headers(h: &PeerHeaders) -> Result<()> {
    let Some(port) = h.port else {
        return Err(NetworkError::Headers("missing port".into()));
    };
    if !(1..=65535).contains(&port) {
        return Err(NetworkError::Headers("port out of range".into()));
    }
    let os = h
        .os
        .as_deref()
        .ok_or_else(|| NetworkError::Headers("missing os".into()))?;
    if os.is_empty() || os.len() > 64 {
        return Err(NetworkError::Headers("os out of range".into()));
    }
    let version = h
        .version
        .as_deref()
        .ok_or_else(|| NetworkError::Headers("missing version".into()))?;
    if !(5..=12).contains(&version.len()) {
        return Err(NetworkError::Headers("version out of range".into()));
    }
    if h.nethash.is_none() {
        return Err(NetworkError::Headers("missing nethash".into()));
    }
    if h.ip.is_none() {
        return Err(NetworkError::Headers("missing ip".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good() -> PeerHeaders {
        PeerHeaders {
            port: Some(8000),
            os: Some("linux".into()),
            version: Some("1.0.0".into()),
            nethash: Some("abc".into()),
            ip: Some("1.2.3.4".into()),
        }
    }

    #[test]
    fn accepts_complete_headers() {
        assert!(validate_headers(&good()).is_ok());
    }

    #[test]
    fn rejects_missing_nethash() {
        let mut h = good();
        h.nethash = None;
        assert!(validate_headers(&h).is_err());
    }

    #[test]
    fn rejects_short_version() {
        let mut h = good();
        h.version = Some("1.0".into());
        assert!(validate_headers(&h).is_err());
    }

    #[test]
    fn rejects_out_of_range_port() {
        let mut h = good();
        h.port = Some(0);
        assert!(validate_headers(&h).is_err());
    }
}
