//! Peer membership directory and HTTP gossip transport for a
//! blockchain node: peer discovery, a ranked durable peer table with
//! ban/unban lifecycles, and the inbound/outbound HTTP protocol that
//! exchanges blocks, transactions, signatures and dapp messages between
//! peers.

pub mod bus;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod dedup;
pub mod directory;
pub mod error;
pub mod hashsum;
pub mod headers;
pub mod peer;
pub mod removed_cache;
pub mod store;
pub mod transport;

pub use context::NodeContext;
pub use error::{NetworkError, Result};
pub use peer::{Peer, PeerState};
