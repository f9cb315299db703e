//! Outbound peer RPC: `getFromPeer`, `getFromRandomPeer`, `broadcast`.

use crate::config::PeersConfig;
use crate::directory::{PeerDirectory, PeerExchange};
use crate::error::{NetworkError, Result};
use crate::headers::{validate_headers, OutboundHeaders, PeerHeaders};
use crate::peer::{inspect, Peer, PeerState, RawPeer};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const RANDOM_PEER_RETRIES: usize = 20;
const BROADCAST_CONCURRENCY: usize = 3;
const BAN_ON_TRANSPORT_ERROR_SECS: u64 = 600;

pub struct Transport {
    client: reqwest::Client,
    headers: OutboundHeaders,
    directory: Arc<PeerDirectory>,
    timeout: Duration,
    current_version: String,
    nethash: String,
}

impl Transport {
    pub fn new(directory: Arc<PeerDirectory>, config: &PeersConfig) -> Self {
        let headers = OutboundHeaders {
            os: config.os.clone(),
            version: config.current_version.clone(),
            port: config.listen_address.port(),
            nethash: config.nethash.clone(),
        };
        Self {
            client: reqwest::Client::new(),
            headers,
            directory,
            timeout: Duration::from_millis(config.options.timeout_ms),
            current_version: config.current_version.clone(),
            nethash: config.nethash.clone(),
        }
    }

    pub fn outbound_headers(&self) -> &OutboundHeaders {
        &self.headers
    }

    /// `getFromPeer`: issues an HTTP request against `peer`, validating
    /// the response headers and applying the remove/ban policy from
    /// SPEC_FULL §4.2 on any failure.
    pub async fn get_from_peer(
        &self,
        peer: &Peer,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        let Some(ip) = &peer.ip else {
            return Err(NetworkError::Unavailable("peer has no ip".into()));
        };
        let url = format!("http://{ip}:{}{path}", peer.port);

        let mut req = self
            .client
            .request(method, &url)
            .timeout(self.timeout)
            .header("nethash", &self.headers.nethash)
            .header("version", &self.headers.version)
            .header("os", &self.headers.os)
            .header("port", self.headers.port.to_string());
        if let Some(body) = &body {
            req = req.json(body);
        }

        let response = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                if e.is_timeout() {
                    self.remove_peer(ip, peer.port, "ETIMEOUT").await;
                    return Err(NetworkError::Timeout(url));
                }
                if e.is_connect() {
                    self.remove_peer(ip, peer.port, "EUNAVAILABLE").await;
                    return Err(NetworkError::Unavailable(url));
                }
                // Neither a connect failure nor a timeout (redirect loop,
                // malformed request, …) — ban rather than remove.
                self.remove_peer(ip, peer.port, "ETRANSPORT").await;
                return Err(NetworkError::Transport(url));
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            let status = response.status().as_u16();
            self.remove_peer(ip, peer.port, "ERESPONSE").await;
            return Err(NetworkError::Response {
                status,
                message: format!("unexpected status from {url}"),
            });
        }

        let resp_headers = PeerHeaders {
            port: response
                .headers()
                .get("port")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok()),
            os: response
                .headers()
                .get("os")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            version: response
                .headers()
                .get("version")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            nethash: response
                .headers()
                .get("nethash")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            ip: Some(ip.clone()),
        };
        if validate_headers(&resp_headers).is_err() {
            self.remove_peer(ip, peer.port, "EHEADERS").await;
            return Err(NetworkError::Headers(format!("bad response headers from {url}")));
        }
        if resp_headers.nethash.as_deref() != Some(self.nethash.as_str()) {
            self.remove_peer(ip, peer.port, "ENETHASH").await;
            return Err(NetworkError::Nethash {
                expected: self.nethash.clone(),
                received: resp_headers.nethash.unwrap_or_default(),
            });
        }

        if resp_headers.version.as_deref() == Some(self.current_version.as_str()) {
            let reported = Peer {
                ip: Some(ip.clone()),
                port: peer.port,
                state: Some(PeerState::Connected),
                os: resp_headers.os.unwrap_or_else(|| "unknown".to_string()),
                version: resp_headers.version.unwrap_or_else(|| "0.0.0".to_string()),
                clock: None,
                dapps: Default::default(),
            };
            if let Err(e) = self.directory.update(reported).await {
                warn!(peer = %peer.string(), error = %e, "Peers#update error");
            }
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| NetworkError::Schema(e.to_string()))
    }

    async fn remove_peer(&self, ip: &str, port: u16, code: &str) {
        match code {
            "EUNAVAILABLE" | "ETIMEOUT" => {
                if let Err(e) = self.directory.remove(ip, port).await {
                    warn!(peer = %format!("{ip}:{port}"), error = %e, "remove on transport error failed");
                }
            }
            _ if code == "ERESPONSE" || code == "EHEADERS" || code == "ENETHASH" => {
                if let Err(e) = self.directory.remove(ip, port).await {
                    warn!(peer = %format!("{ip}:{port}"), error = %e, "remove on framing error failed");
                }
            }
            _ => {
                if let Err(e) = self
                    .directory
                    .set_state(ip, port, PeerState::Banned, Some(BAN_ON_TRANSPORT_ERROR_SECS))
                    .await
                {
                    warn!(peer = %format!("{ip}:{port}"), error = %e, "ban on transport error failed");
                }
            }
        }
    }

    /// `getFromRandomPeer`: retries up to 20 times against a freshly
    /// picked random peer.
    pub async fn get_from_random_peer(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        for _ in 0..RANDOM_PEER_RETRIES {
            let candidates = self.directory.list(1, None)?;
            let Some(peer) = candidates.into_iter().next() else {
                continue;
            };
            if let Ok(resp) = self.get_from_peer(&peer, method.clone(), path, body.clone()).await
            {
                return Ok(resp);
            }
        }
        Err(NetworkError::NoReachablePeers)
    }

    /// `broadcast`: fans `path`/`body` out to up to `limit` peers with
    /// bounded concurrency, ignoring individual failures.
    pub async fn broadcast(&self, limit: usize, dappid: Option<&str>, path: &str, body: Value) {
        let peers = match self.directory.list(limit, dappid) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "broadcast: failed to list peers");
                return;
            }
        };
        stream::iter(peers)
            .for_each_concurrent(BROADCAST_CONCURRENCY, |peer| {
                let body = body.clone();
                async move {
                    let _ = self
                        .get_from_peer(&peer, reqwest::Method::POST, path, Some(body))
                        .await;
                }
            })
            .await;
    }
}

#[async_trait]
impl PeerExchange for Transport {
    async fn fetch_peer_list_from_random_peer(&self) -> Result<Vec<Peer>> {
        let value = self
            .get_from_random_peer(reqwest::Method::GET, "/peer/list", None)
            .await?;
        let peers = value
            .get("peers")
            .cloned()
            .unwrap_or(value);
        let raw: Vec<RawPeer> = serde_json::from_value(peers)
            .map_err(|e| NetworkError::Schema(format!("invalid /peer/list response: {e}")))?;
        Ok(raw.into_iter().map(inspect).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PeerOptions, PeersConfig};
    use crate::directory::PeerDirectory;
    use crate::peer::PeerState;
    use crate::store::PeerStore;
    use std::collections::HashSet;
    use std::time::Instant;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cfg() -> PeersConfig {
        PeersConfig {
            list: vec![],
            options: PeerOptions::default(),
            nethash: "net".into(),
            min_version: "0.5.0".into(),
            current_version: "0.5.0".into(),
            os: "unknown".into(),
            listen_address: "127.0.0.1:0".parse().unwrap(),
            build: String::new(),
        }
    }

    #[tokio::test]
    async fn get_from_random_peer_exhausts_after_twenty_retries_on_empty_list() {
        let store = Arc::new(PeerStore::open_in_memory().unwrap());
        let directory = Arc::new(PeerDirectory::new(store, &cfg()));
        let transport = Transport::new(directory, &cfg());

        let err = transport
            .get_from_random_peer(reqwest::Method::GET, "/peer/list", None)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::NoReachablePeers));
    }

    #[tokio::test]
    async fn redirect_loop_bans_instead_of_removing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/peer/redirect-test"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", "/peer/redirect-test"),
            )
            .mount(&server)
            .await;
        let addr = server.address().to_owned();

        let store = Arc::new(PeerStore::open_in_memory().unwrap());
        let directory = Arc::new(PeerDirectory::new(store, &cfg()));
        let peer = Peer {
            ip: Some(addr.ip().to_string()),
            port: addr.port(),
            state: Some(PeerState::Connected),
            os: "unknown".into(),
            version: "0.5.0".into(),
            clock: None,
            dapps: HashSet::new(),
        };
        directory.update(peer.clone()).await.unwrap();
        let transport = Transport::new(directory.clone(), &cfg());

        let err = transport
            .get_from_peer(&peer, reqwest::Method::GET, "/peer/redirect-test", None)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Transport(_)));

        let stored = directory.get(&addr.ip().to_string(), addr.port()).unwrap().unwrap();
        assert_eq!(stored.state, Some(PeerState::Banned));
    }

    async fn mock_peer(delay: Duration) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/peer/broadcast-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})).set_delay(delay))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn broadcast_caps_concurrency_below_peer_count() {
        let store = Arc::new(PeerStore::open_in_memory().unwrap());
        let directory = Arc::new(PeerDirectory::new(store, &cfg()));
        let delay = Duration::from_millis(150);

        let mut servers = Vec::new();
        for i in 0..6u16 {
            let server = mock_peer(delay).await;
            let addr: std::net::SocketAddr = server.address().to_owned();
            directory
                .update(Peer {
                    ip: Some(addr.ip().to_string()),
                    port: addr.port(),
                    state: Some(PeerState::Connected),
                    os: "unknown".into(),
                    version: "0.5.0".into(),
                    clock: None,
                    dapps: HashSet::new(),
                })
                .await
                .unwrap();
            servers.push((server, i));
        }

        let transport = Transport::new(directory, &cfg());
        let start = Instant::now();
        transport
            .broadcast(6, None, "/peer/broadcast-test", serde_json::json!({}))
            .await;
        let elapsed = start.elapsed();

        // 6 peers at concurrency 3 take two delay rounds; full parallelism
        // would finish in roughly one. This bounds it away from that.
        assert!(
            elapsed >= delay * 2 - Duration::from_millis(50),
            "broadcast finished too fast for a concurrency cap of {BROADCAST_CONCURRENCY}: {elapsed:?}"
        );
    }
}
