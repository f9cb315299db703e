//! `library.bus.message`: synchronous fan-out of domain events to
//! registered listeners, plus the socket-room events a UI subscribes to.

use serde_json::Value;
use tokio::sync::broadcast;

/// Domain events the transport emits as a side effect of framing, and
/// that the socket layer re-broadcasts on the default room.
#[derive(Debug, Clone)]
pub enum Event {
    ReceiveBlock(Value),
    Message(Value),
    SignatureChange(Value),
    TransactionsChange(Value),
    BlocksChange(Value),
}

/// A thin wrapper over a broadcast channel. `publish` never blocks on
/// subscribers and drops the event if nobody is listening.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}
