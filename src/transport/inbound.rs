//! Inbound `/peer` and `/api/peers` HTTP mounts, and the framing
//! middleware that validates headers and mutates the peer directory as
//! a side effect of every `/peer` request.
//!
//! Socket-level bind/accept is the HTTP server bootstrap named
//! out-of-scope in SPEC_FULL §1; this module assumes a reverse-proxy
//! style deployment and reads the caller's address from
//! `x-forwarded-for`, falling back to `"0.0.0.0"` when absent.

use crate::bus::{Bus, Event};
use crate::collaborators::{ChainState, Dapps, Delegates, Multisignatures, ObjectNormalize};
use crate::config::PeersConfig;
use crate::dedup::MessageDedup;
use crate::directory::PeerDirectory;
use crate::hashsum::hashsum;
use crate::headers::{validate_headers, PeerHeaders};
use crate::peer::{inspect, PeerState, RawPeer};
use crate::store::FilterQuery;
use crate::transport::outbound::Transport;
use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex as AsyncMutex;

const BLOCK_BAN_SECS: u64 = 3600;
const TRANSACTION_BAN_SECS: u64 = 3600;

#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<PeerDirectory>,
    pub transport: Arc<Transport>,
    pub bus: Arc<Bus>,
    pub object_normalize: Arc<dyn ObjectNormalize>,
    pub chain: Arc<dyn ChainState>,
    pub multisig: Arc<dyn Multisignatures>,
    pub dapps: Arc<dyn Dapps>,
    pub delegates: Arc<dyn Delegates>,
    pub config: Arc<PeersConfig>,
    pub dedup: Arc<AsyncMutex<MessageDedup>>,
    pub balances_sequence: Arc<AsyncMutex<()>>,
    pub received_block: Arc<AtomicBool>,
    pub loaded: Arc<AtomicBool>,
}

fn peer_headers_from(req_headers: &axum::http::HeaderMap, ip: &str) -> PeerHeaders {
    let get = |name: &str| req_headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
    PeerHeaders {
        port: get("port").and_then(|p| p.parse().ok()),
        os: get("os"),
        version: get("version"),
        nethash: get("nethash"),
        ip: Some(ip.to_string()),
    }
}

fn error_json(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

/// Validates inbound headers, frames the peer in/out of the directory,
/// and forwards to the route handler. Applied only to `/peer/*`.
async fn framing_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next<Body>,
) -> Response {
    if !state.loaded.load(Ordering::SeqCst) {
        return error_json(
            StatusCode::OK,
            json!({"success": false, "message": "Blockchain is loading"}),
        );
    }

    let ip = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let peer_headers = peer_headers_from(req.headers(), &ip);

    if validate_headers(&peer_headers).is_err() {
        let _ = state.directory.remove(&ip, peer_headers.port.unwrap_or(0)).await;
        return error_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"success": false, "error": "EHEADERS"}),
        );
    }
    let port = peer_headers.port.unwrap();

    if peer_headers.nethash.as_deref() != Some(state.config.nethash.as_str()) {
        let _ = state.directory.remove(&ip, port).await;
        return error_json(
            StatusCode::OK,
            json!({
                "success": false,
                "message": "Request is made on the wrong network",
                "expected": state.config.nethash,
                "received": peer_headers.nethash,
            }),
        );
    }

    // Buffer the body so we can both peek `dappid` for framing and hand
    // an intact body to the route handler.
    let (parts, body) = req.into_parts();
    let bytes = hyper::body::to_bytes(body).await.unwrap_or_default();
    let dappid = serde_json::from_slice::<Value>(&bytes)
        .ok()
        .and_then(|v| v.get("dappid").and_then(|d| d.as_str().map(str::to_string)));

    let raw = RawPeer {
        ip: Some(ip.clone()),
        port: Some(Value::from(port)),
        os: peer_headers.os.clone(),
        version: peer_headers.version.clone(),
        state: Some(PeerState::Connected as i64),
        clock: None,
        dappid: dappid.clone().map(crate::peer::DappId::One),
    };
    let peer = inspect(raw);

    if peer.version == state.config.current_version {
        if !state.received_block.load(Ordering::SeqCst) {
            state.delegates.enable_forging().await;
        }
        // Enqueued (not awaited) strictly before the handler runs, so the
        // write sequence applies it ahead of whatever the handler itself
        // enqueues for the same peer.
        state.directory.enqueue_update(peer.clone());
    }

    let mut req = Request::from_parts(parts, bytes.into());
    req.extensions_mut().insert(peer);
    let mut response = next.run(req).await;

    let headers = state.transport.outbound_headers();
    let hm = response.headers_mut();
    hm.insert("nethash", headers.nethash.parse().unwrap());
    hm.insert("version", headers.version.parse().unwrap());
    hm.insert("os", headers.os.parse().unwrap());
    hm.insert("port", headers.port.to_string().parse().unwrap());
    response
}

async fn list_peers(State(state): State<AppState>) -> Response {
    match state.directory.list(100, None) {
        Ok(peers) => Json(json!({"success": true, "peers": peers})).into_response(),
        Err(e) => error_json(StatusCode::OK, json!({"success": false, "error": e.to_string()})),
    }
}

#[derive(Deserialize)]
struct CommonQuery {
    ids: Option<String>,
}

async fn blocks_common(
    State(state): State<AppState>,
    Query(q): Query<CommonQuery>,
) -> Response {
    let ids: Vec<i64> = q
        .ids
        .unwrap_or_default()
        .replace(['"', '\''], "")
        .split(',')
        .filter_map(|s| s.trim().parse::<i64>().ok())
        .collect();
    if ids.is_empty() {
        return error_json(
            StatusCode::OK,
            json!({"success": false, "error": "Invalid block id sequence"}),
        );
    }
    let common = state.chain.common_block(&ids).await;
    Json(json!({"success": true, "common": common})).into_response()
}

#[derive(Deserialize)]
struct BlocksQuery {
    #[serde(rename = "lastBlockId")]
    last_block_id: Option<i64>,
}

async fn get_blocks(State(state): State<AppState>, Query(q): Query<BlocksQuery>) -> Response {
    let blocks = state.chain.load_blocks_after(q.last_block_id, 1440).await;
    Json(json!({"blocks": blocks})).into_response()
}

async fn post_block(
    State(state): State<AppState>,
    axum::Extension(peer): axum::Extension<crate::peer::Peer>,
    Json(block): Json<Value>,
) -> Response {
    match state.object_normalize.normalize_block(block).await {
        Ok(normalized) => {
            state.chain.receive_block(normalized.clone()).await;
            state.bus.publish(Event::ReceiveBlock(normalized.clone()));
            state.bus.publish(Event::BlocksChange(normalized.clone()));
            let block_id = normalized.get("id").cloned().unwrap_or(Value::Null);
            Json(json!({"success": true, "blockId": block_id})).into_response()
        }
        Err(err) => {
            if let (Some(ip), port) = (&peer.ip, peer.port) {
                let _ = state
                    .directory
                    .set_state(ip, port, PeerState::Banned, Some(BLOCK_BAN_SECS))
                    .await;
            }
            error_json(StatusCode::OK, json!({"success": false, "error": err}))
        }
    }
}

async fn post_signature(State(state): State<AppState>, Json(sig): Json<Value>) -> Response {
    match state.multisig.process_signature(sig.clone()).await {
        Ok(()) => {
            state.bus.publish(Event::SignatureChange(sig));
            Json(json!({"success": true})).into_response()
        }
        Err(err) => error_json(StatusCode::OK, json!({"success": false, "error": err})),
    }
}

async fn get_signatures(State(state): State<AppState>) -> Response {
    let signatures = state.multisig.gathered_signatures().await;
    Json(json!({"success": true, "signatures": signatures})).into_response()
}

async fn get_transactions(State(state): State<AppState>) -> Response {
    let transactions = state.chain.unconfirmed_transactions().await;
    Json(json!({"success": true, "transactions": transactions})).into_response()
}

async fn post_transaction(
    State(state): State<AppState>,
    axum::Extension(peer): axum::Extension<crate::peer::Peer>,
    Json(tx): Json<Value>,
) -> Response {
    match state.object_normalize.normalize_transaction(tx).await {
        Ok(normalized) => {
            let _guard = state.balances_sequence.lock().await;
            match state.chain.receive_transactions(vec![normalized.clone()]).await {
                Ok(()) => {
                    state.bus.publish(Event::TransactionsChange(normalized.clone()));
                    let tx_id = normalized.get("id").cloned().unwrap_or(Value::Null);
                    Json(json!({"success": true, "transactionId": tx_id})).into_response()
                }
                Err(err) => error_json(StatusCode::OK, json!({"success": false, "error": err})),
            }
        }
        Err(err) => {
            if let (Some(ip), port) = (&peer.ip, peer.port) {
                let _ = state
                    .directory
                    .set_state(ip, port, PeerState::Banned, Some(TRANSACTION_BAN_SECS))
                    .await;
            }
            error_json(StatusCode::OK, json!({"success": false, "error": err}))
        }
    }
}

async fn get_height(State(state): State<AppState>) -> Response {
    let height = state.chain.height().await;
    Json(json!({"success": true, "height": height})).into_response()
}

#[derive(Deserialize)]
struct DappMessageBody {
    dappid: String,
    timestamp: i64,
    hash: String,
    #[serde(flatten)]
    body: Value,
}

fn without_hash(mut body: Value) -> Value {
    if let Value::Object(map) = &mut body {
        map.remove("hash");
    }
    body
}

async fn dapp_message(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let msg: DappMessageBody = match serde_json::from_value(payload.clone()) {
        Ok(m) => m,
        Err(_) => {
            return error_json(
                StatusCode::OK,
                json!({"success": false, "error": "dappid, timestamp and hash are required"}),
            )
        }
    };
    let expected_hash = hashsum(&without_hash(payload), msg.timestamp);
    if expected_hash != msg.hash {
        return error_json(StatusCode::OK, json!({"success": false, "error": "Invalid message hash"}));
    }

    let is_new = state.dedup.lock().await.check_and_insert(&msg.hash);
    if !is_new {
        return StatusCode::OK.into_response();
    }

    match state.dapps.message(&msg.dappid, msg.body.clone()).await {
        Ok(()) => {
            state.bus.publish(Event::Message(msg.body));
            Json(json!({"success": true})).into_response()
        }
        Err(err) => error_json(StatusCode::OK, json!({"success": false, "error": err})),
    }
}

#[derive(Deserialize)]
struct DappRequestBody {
    dappid: String,
    timestamp: i64,
    hash: String,
    method: String,
    path: String,
    #[serde(default)]
    query: Value,
}

async fn dapp_request(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let req: DappRequestBody = match serde_json::from_value(payload.clone()) {
        Ok(r) => r,
        Err(_) => {
            return error_json(
                StatusCode::OK,
                json!({"success": false, "error": "dappid, timestamp and hash are required"}),
            )
        }
    };
    let expected_hash = hashsum(&without_hash(payload), req.timestamp);
    if expected_hash != req.hash {
        return error_json(StatusCode::OK, json!({"success": false, "error": "Invalid message hash"}));
    }

    match state
        .dapps
        .request(&req.dappid, &req.method, &req.path, req.query)
        .await
    {
        Ok(body) => Json(body).into_response(),
        Err(err) => error_json(StatusCode::OK, json!({"success": false, "error": err})),
    }
}

fn room_event(event: Event) -> Option<(&'static str, Value)> {
    match event {
        Event::SignatureChange(v) => Some(("signature/change", v)),
        Event::TransactionsChange(v) => Some(("transactions/change", v)),
        Event::BlocksChange(v) => Some(("blocks/change", v)),
        Event::ReceiveBlock(_) | Event::Message(_) => None,
    }
}

/// Upgrades to a websocket and re-broadcasts the bus's room events
/// (`signature/change`, `transactions/change`, `blocks/change`) to the
/// connected client, the generalized replacement for a socket.io default
/// room named in SPEC_FULL §6.
async fn socket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut events = state.bus.subscribe();
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            received = events.recv() => {
                let event = match received {
                    Ok(event) => event,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                let Some((name, data)) = room_event(event) else { continue };
                let payload = json!({"event": name, "data": data}).to_string();
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn not_found() -> Response {
    error_json(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"success": false, "error": "API endpoint not found"}),
    )
}

#[derive(Deserialize)]
struct ManagementFilterQuery {
    ip: Option<String>,
    port: Option<u16>,
    state: Option<i64>,
    os: Option<String>,
    version: Option<String>,
    #[serde(rename = "orderBy")]
    order_by: Option<String>,
    #[serde(default)]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

async fn management_list(
    State(state): State<AppState>,
    Query(q): Query<ManagementFilterQuery>,
) -> Response {
    let query = FilterQuery {
        ip: q.ip,
        port: q.port,
        state: q.state.and_then(crate::peer::PeerState::from_i64),
        os: q.os,
        version: q.version,
        order_by: q.order_by,
        limit: q.limit,
        offset: q.offset,
    };
    match state.directory.get_by_filter(query) {
        Ok(peers) => Json(json!({"success": true, "peers": peers})).into_response(),
        Err(e) => error_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"success": false, "error": e.to_string()}),
        ),
    }
}

#[derive(Deserialize)]
struct GetQuery {
    ip: String,
    port: u16,
}

async fn management_get(State(state): State<AppState>, Query(q): Query<GetQuery>) -> Response {
    match state.directory.get(&q.ip, q.port) {
        Ok(peer) => Json(json!({"success": true, "peer": peer})).into_response(),
        Err(e) => error_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"success": false, "error": e.to_string()}),
        ),
    }
}

async fn management_version(State(state): State<AppState>) -> Response {
    Json(json!({"version": state.config.current_version, "build": state.config.build})).into_response()
}

/// Builds the full router: `/peer/*` behind the framing middleware, and
/// `/api/peers/*` as a plain management API.
pub fn build_router(state: AppState) -> Router {
    let peer_routes = Router::new()
        .route("/list", get(list_peers))
        .route("/blocks/common", get(blocks_common))
        .route("/blocks", get(get_blocks).post(post_block))
        .route("/signatures", get(get_signatures).post(post_signature))
        .route("/transactions", get(get_transactions).post(post_transaction))
        .route("/height", get(get_height))
        .route("/dapp/message", post(dapp_message))
        .route("/dapp/request", post(dapp_request))
        .layer(middleware::from_fn_with_state(state.clone(), framing_middleware));

    let management_routes = Router::new()
        .route("/", get(management_list))
        .route("/get", get(management_get))
        .route("/version", get(management_version));

    Router::new()
        .nest("/peer", peer_routes)
        .nest("/api/peers", management_routes)
        .route("/socket", get(socket_handler))
        .fallback(not_found)
        .with_state(state)
}
