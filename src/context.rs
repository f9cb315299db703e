//! Wires `PeerDirectory` and `Transport` together into a running node,
//! replacing the source's mutable-globals-plus-late-`onBind` module
//! graph with an explicit context built once at startup (SPEC_FULL §9).

use crate::bus::{Bus, Event};
use crate::collaborators::{ChainState, Dapps, Delegates, Multisignatures, ObjectNormalize};
use crate::config::PeersConfig;
use crate::dedup::MessageDedup;
use crate::directory::PeerDirectory;
use crate::error::Result;
use crate::hashsum::hashsum;
use crate::store::PeerStore;
use crate::transport::{build_router, AppState, Transport};
use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{interval, Duration};
use tracing::info;

const REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const BAN_MANAGER_INTERVAL: Duration = Duration::from_secs(65);
const EVENT_BROADCAST_LIMIT: usize = 100;

/// A fully-wired node: directory + transport + the collaborator
/// bundle, ready to serve `/peer` and `/api/peers` and to run its two
/// periodic loops.
pub struct NodeContext {
    pub directory: Arc<PeerDirectory>,
    pub transport: Arc<Transport>,
    pub app_state: AppState,
    pub config: Arc<PeersConfig>,
}

#[allow(clippy::too_many_arguments)]
impl NodeContext {
    pub fn new(
        store: Arc<PeerStore>,
        config: PeersConfig,
        object_normalize: Arc<dyn ObjectNormalize>,
        chain: Arc<dyn ChainState>,
        multisig: Arc<dyn Multisignatures>,
        dapps: Arc<dyn Dapps>,
        delegates: Arc<dyn Delegates>,
    ) -> Self {
        let config = Arc::new(config);
        let directory = Arc::new(PeerDirectory::new(store, &config));
        let transport = Arc::new(Transport::new(directory.clone(), &config));
        let bus = Arc::new(Bus::new());

        let app_state = AppState {
            directory: directory.clone(),
            transport: transport.clone(),
            bus,
            object_normalize,
            chain,
            multisig,
            dapps,
            delegates,
            config: config.clone(),
            dedup: Arc::new(AsyncMutex::new(MessageDedup::default())),
            balances_sequence: Arc::new(AsyncMutex::new(())),
            received_block: Arc::new(AtomicBool::new(false)),
            loaded: Arc::new(AtomicBool::new(false)),
        };

        Self {
            directory,
            transport,
            app_state,
            config,
        }
    }

    pub fn router(&self) -> axum::Router {
        build_router(self.app_state.clone())
    }

    /// `onBlockchainReady`: seed the directory, run one refresh cycle if
    /// it's non-empty, then mark the node loaded.
    pub async fn on_blockchain_ready(&self) -> Result<()> {
        self.directory
            .set_peer_exchange(self.transport.clone())
            .await;
        self.directory.seed_bootstrap(&self.config).await?;

        let count = self.directory.count()?;
        if count > 0 {
            self.directory.refresh_from_random_peer().await;
        } else {
            info!("peers list is empty");
        }
        info!(count, "Peers ready, stored {count}");
        self.app_state
            .loaded
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    /// Marks the node unloaded again: inbound framing and outbound
    /// activity initiated by new events short-circuit with "Blockchain
    /// is loading" until a future `on_blockchain_ready` call.
    pub fn shutdown(&self) {
        self.app_state
            .loaded
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// `onNewBlock`: publishes `blocks/change` for the UI room and, when
    /// `broadcast` is set, fans the block out to up to 100 peers.
    /// Broadcasting never awaits HTTP completion (SPEC_FULL §4.2) — the
    /// fan-out runs in a detached task.
    pub fn on_new_block(&self, block: Value, broadcast: bool) {
        self.app_state.bus.publish(Event::BlocksChange(block.clone()));
        if broadcast {
            self.spawn_broadcast("/peer/blocks", None, block);
        }
    }

    /// `onSignature`: publishes `signature/change` and, when `broadcast`
    /// is set, forwards the signature to up to 100 peers.
    pub fn on_signature(&self, signature: Value, broadcast: bool) {
        self.app_state.bus.publish(Event::SignatureChange(signature.clone()));
        if broadcast {
            self.spawn_broadcast("/peer/signatures", None, signature);
        }
    }

    /// `onUnconfirmedTransaction`: publishes `transactions/change` and,
    /// when `broadcast` is set, forwards the transaction to up to 100 peers.
    pub fn on_unconfirmed_transaction(&self, transaction: Value, broadcast: bool) {
        self.app_state.bus.publish(Event::TransactionsChange(transaction.clone()));
        if broadcast {
            self.spawn_broadcast("/peer/transactions", None, transaction);
        }
    }

    /// `onMessage`: publishes the raw message body for the UI room and,
    /// when `broadcast` is set, wraps it into the signed
    /// `{dappid, timestamp, hash, ...}` envelope `dapp_message` verifies
    /// on receipt before forwarding to up to 100 peers subscribed to
    /// `dappid`.
    pub fn on_message(&self, dappid: &str, body: Value, broadcast: bool) {
        self.app_state.bus.publish(Event::Message(body.clone()));
        if broadcast {
            let timestamp = chrono::Utc::now().timestamp_millis();
            let mut envelope = body;
            if let Value::Object(map) = &mut envelope {
                map.insert("dappid".to_string(), json!(dappid));
                map.insert("timestamp".to_string(), json!(timestamp));
            }
            let hash = hashsum(&envelope, timestamp);
            if let Value::Object(map) = &mut envelope {
                map.insert("hash".to_string(), json!(hash));
            }
            self.spawn_broadcast("/peer/dapp/message", Some(dappid.to_string()), envelope);
        }
    }

    fn spawn_broadcast(&self, path: &'static str, dappid: Option<String>, body: Value) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            transport.broadcast(EVENT_BROADCAST_LIMIT, dappid.as_deref(), path, body).await;
        });
    }

    /// `onPeersReady`: spawns the two independent periodic loops. Each
    /// swallows its own errors and reschedules itself regardless of the
    /// other's progress.
    pub fn spawn_periodic_loops(&self) {
        let directory = self.directory.clone();
        tokio::spawn(async move {
            let mut ticker = interval(REFRESH_INTERVAL);
            loop {
                ticker.tick().await;
                directory.refresh_from_random_peer().await;
            }
        });

        let directory = self.directory.clone();
        tokio::spawn(async move {
            let mut ticker = interval(BAN_MANAGER_INTERVAL);
            loop {
                ticker.tick().await;
                directory.ban_manager().await;
            }
        });
    }
}
