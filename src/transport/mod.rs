//! Inbound HTTP peer API and outbound peer RPC client.

mod inbound;
mod outbound;

pub use inbound::{build_router, AppState};
pub use outbound::Transport;
