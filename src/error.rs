//! Error types for the peer directory and gossip transport.
//!
//! Mirrors the error-kind taxonomy a request can fail with: framing
//! violations, protocol-object validation failures, transport-level
//! failures, storage errors, and whitelist violations.

use thiserror::Error;

/// Errors raised by [`crate::directory::PeerDirectory`] and
/// [`crate::transport`].
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Attempted `setState`/`remove` against a frozen whitelist (seed) peer.
    #[error("Peer in white list: {0}")]
    Whitelisted(String),

    /// Inbound or outbound header contract violated.
    #[error("EHEADERS: {0}")]
    Headers(String),

    /// Inbound or outbound nethash mismatch.
    #[error("ENETHASH: expected {expected}, received {received}")]
    Nethash { expected: String, received: String },

    /// Outbound request returned a non-200 status.
    #[error("ERESPONSE {status}: {message}")]
    Response { status: u16, message: String },

    /// Outbound peer unreachable.
    #[error("EUNAVAILABLE: {0}")]
    Unavailable(String),

    /// Outbound request timed out.
    #[error("ETIMEOUT: {0}")]
    Timeout(String),

    /// Outbound request failed for a reason other than connect/timeout
    /// (redirect loop, malformed request, …) — banned rather than removed.
    #[error("ETRANSPORT: {0}")]
    Transport(String),

    /// Schema/shape validation failure surfaced to the caller verbatim.
    #[error("{0}")]
    Schema(String),

    /// No reachable peer after exhausting retries.
    #[error("No reachable peers in db")]
    NoReachablePeers,

    /// Underlying storage failure.
    #[error("Peers#{op} error: {source}")]
    Storage {
        op: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// Node is shutting down / has not finished loading.
    #[error("Blockchain is loading")]
    Loading,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, NetworkError>;
