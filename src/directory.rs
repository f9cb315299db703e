//! `PeerDirectory`: the durable, queryable membership table.
//!
//! Reads (`list`, `count`, `getByFilter`) go straight to the store.
//! Writes (`update`, `setState`, `remove`, `addDapp`) are jobs sent down
//! an mpsc channel to a single background task that owns the apply
//! order, matching the `dbSequence` contract in SPEC_FULL §5 ("an mpsc
//! command channel drained by one task rather than a blanket mutex").

use crate::config::PeersConfig;
use crate::error::{NetworkError, Result};
use crate::peer::{version_lt, Peer, PeerState};
use crate::removed_cache::RemovedCache;
use crate::store::{FilterQuery, PeerStore};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex as SyncMutex;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};

/// A unit of work for the write-sequence task: a closure over the store
/// plus a channel to report its result back to the enqueuing caller.
type WriteJob = Box<dyn FnOnce(&PeerStore) + Send>;

const REFRESH_VALIDATION_CONCURRENCY: usize = 2;

/// Asks the transport for a fresh `/peer/list` response from a random
/// live peer. Implemented by `Transport`; injected after construction to
/// resolve the Peers ↔ Transport cycle (SPEC_FULL §9).
#[async_trait]
pub trait PeerExchange: Send + Sync {
    async fn fetch_peer_list_from_random_peer(&self) -> Result<Vec<Peer>>;
}

pub struct PeerDirectory {
    store: Arc<PeerStore>,
    whitelist: HashSet<(String, u16)>,
    removed_cache: SyncMutex<RemovedCache>,
    write_tx: mpsc::UnboundedSender<WriteJob>,
    min_version: String,
    max_update_peers: usize,
    exchange: RwLock<Option<Arc<dyn PeerExchange>>>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl PeerDirectory {
    pub fn new(store: Arc<PeerStore>, config: &PeersConfig) -> Self {
        let whitelist = config
            .list
            .iter()
            .map(|s| (s.ip.clone(), s.port))
            .collect();

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<WriteJob>();
        let sequence_store = store.clone();
        tokio::spawn(async move {
            while let Some(job) = write_rx.recv().await {
                job(&sequence_store);
            }
        });

        Self {
            store,
            whitelist,
            removed_cache: SyncMutex::new(RemovedCache::new()),
            write_tx,
            min_version: config.min_version.clone(),
            max_update_peers: config.options.max_update_peers,
            exchange: RwLock::new(None),
        }
    }

    pub async fn set_peer_exchange(&self, exchange: Arc<dyn PeerExchange>) {
        *self.exchange.write().await = Some(exchange);
    }

    /// Sends a store mutation to the single write-sequence task and
    /// awaits its result; enqueue order is apply order.
    async fn enqueue_write<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&PeerStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<T>>();
        let job: WriteJob = Box::new(move |store| {
            let _ = tx.send(f(store));
        });
        self.write_tx
            .send(job)
            .map_err(|_| NetworkError::Loading)?;
        rx.await.map_err(|_| NetworkError::Loading)?
    }

    fn is_whitelisted(&self, ip: &str, port: u16) -> bool {
        self.whitelist.contains(&(ip.to_string(), port))
    }

    /// Up to `limit` (capped at 100) peers in randomized order, excluding
    /// BANNED, optionally restricted to `dappid`.
    pub fn list(&self, limit: usize, dappid: Option<&str>) -> Result<Vec<Peer>> {
        let limit = limit.min(100);
        let mut peers = self.store.list_non_banned(dappid)?;
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(limit);
        Ok(peers)
    }

    pub fn count(&self) -> Result<i64> {
        self.store.count()
    }

    pub fn get(&self, ip: &str, port: u16) -> Result<Option<Peer>> {
        self.store.get(ip, port)
    }

    pub fn get_by_filter(&self, query: FilterQuery) -> Result<Vec<Peer>> {
        self.store.filter(&query.normalize()?)
    }

    /// Upsert by `(ip, port)`. Whitelist entries are still updatable
    /// (only ban/remove are locked out), matching the source's
    /// "seeds are upserted" seed-bootstrap behavior.
    pub async fn update(&self, peer: Peer) -> Result<()> {
        self.enqueue_write(move |store| store.upsert(&peer).map(|_| ()))
            .await
    }

    /// Enqueues an upsert without waiting for it to apply. Used by the
    /// inbound framing path, which must enqueue the caller's own update
    /// *before* forwarding to the route handler (SPEC_FULL §4.2 step 5)
    /// so enqueue order stays true ordering even though the caller never
    /// awaits completion.
    pub fn enqueue_update(&self, peer: Peer) {
        let job: WriteJob = Box::new(move |store| {
            let _ = store.upsert(&peer);
        });
        let _ = self.write_tx.send(job);
    }

    /// Inserts every configured seed peer as CONNECTED, ignoring conflicts.
    pub async fn seed_bootstrap(&self, config: &PeersConfig) -> Result<()> {
        let seeds: Vec<Peer> = config
            .list
            .iter()
            .map(|seed| Peer {
                ip: Some(seed.ip.clone()),
                port: seed.port,
                state: Some(PeerState::Connected),
                os: "unknown".to_string(),
                version: "0.0.0".to_string(),
                clock: None,
                dapps: HashSet::new(),
            })
            .collect();
        self.enqueue_write(move |store| {
            for peer in &seeds {
                store.upsert(peer)?;
            }
            Ok(())
        })
        .await
    }

    pub async fn set_state(
        &self,
        ip: &str,
        port: u16,
        state: PeerState,
        timeout_seconds: Option<u64>,
    ) -> Result<()> {
        if self.is_whitelisted(ip, port) && state == PeerState::Banned {
            return Err(NetworkError::Whitelisted(format!("{ip}:{port}")));
        }
        let clock = if state == PeerState::Banned {
            let secs = timeout_seconds.unwrap_or(1).max(1);
            Some(now_ms() + (secs as i64) * 1000)
        } else {
            None
        };
        let key = format!("{ip}:{port}");
        let (ip, port) = (ip.to_string(), port);
        if let Err(e) = self
            .enqueue_write(move |store| store.set_state(&ip, port, state, clock).map(|_| ()))
            .await
        {
            warn!(peer = %key, error = %e, "Peers#setState error");
        }
        Ok(())
    }

    pub async fn remove(&self, ip: &str, port: u16) -> Result<()> {
        if self.is_whitelisted(ip, port) {
            return Err(NetworkError::Whitelisted(format!("{ip}:{port}")));
        }
        let key = format!("{ip}:{port}");
        let owned_ip = ip.to_string();
        match self
            .enqueue_write(move |store| store.delete(&owned_ip, port).map(|_| ()))
            .await
        {
            Ok(()) => self.removed_cache.lock().push(ip.to_string()),
            Err(e) => warn!(peer = %key, error = %e, "Peers#remove error"),
        }
        Ok(())
    }

    pub async fn add_dapp(&self, ip: &str, port: u16, dappid: &str) -> Result<()> {
        let (ip, dappid) = (ip.to_string(), dappid.to_string());
        self.enqueue_write(move |store| store.add_dapp(&ip, port, &dappid).map(|_| ()))
            .await
    }

    /// Clears expired bans, restoring DISCONNECTED. Best-effort; own
    /// failures are logged and swallowed.
    pub async fn ban_manager(&self) {
        match self.enqueue_write(|store| store.expire_bans(now_ms())).await {
            Ok(expired) if !expired.is_empty() => {
                info!(count = expired.len(), "ban manager cleared expired bans");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "banManager error"),
        }
    }

    fn removed_cache_contains(&self, ip: &str) -> bool {
        self.removed_cache.lock().contains(ip)
    }

    fn shrink_removed_cache(&self) {
        self.removed_cache.lock().shrink();
    }

    pub fn removed_cache_len(&self) -> usize {
        self.removed_cache.lock().len()
    }

    /// The peer-exchange refresh cycle: pick a random live peer, ask it
    /// for its `/peer/list`, filter + validate candidates, and enqueue
    /// updates for the survivors. Aborts silently on any upstream error.
    pub async fn refresh_from_random_peer(&self) {
        let exchange = { self.exchange.read().await.clone() };
        let Some(exchange) = exchange else {
            warn!("refresh_from_random_peer: no peer exchange configured");
            return;
        };
        let candidates = match exchange.fetch_peer_list_from_random_peer().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "refresh cycle aborted");
                return;
            }
        };

        let survivors: Vec<Peer> = candidates
            .into_iter()
            .filter(|p| !p.ip.as_deref().is_some_and(|ip| self.removed_cache_contains(ip)))
            .take(self.max_update_peers)
            .collect();

        if rand::random::<bool>() {
            self.shrink_removed_cache();
        }

        stream::iter(survivors)
            .for_each_concurrent(REFRESH_VALIDATION_CONCURRENCY, |peer| async move {
                if peer.ip.is_none() || peer.state.is_none() {
                    return;
                }
                if version_lt(&peer.version, &self.min_version) {
                    warn!(peer = %peer.string(), "Rejecting peer (invalid version)");
                    return;
                }
                if let Err(e) = self.update(peer.clone()).await {
                    warn!(peer = %peer.string(), error = %e, "Peers#update error");
                }
            })
            .await;
    }
}
