//! The `/socket` endpoint re-broadcasts `signature/change`,
//! `transactions/change` and `blocks/change` bus events to connected
//! clients — the generalized replacement for a socket.io default room.

use chain_gossip::bus::Event;
use chain_gossip::collaborators::NoopCollaborators;
use chain_gossip::config::{PeerOptions, PeersConfig, SeedPeer};
use chain_gossip::context::NodeContext;
use chain_gossip::store::PeerStore;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;

fn test_config() -> PeersConfig {
    PeersConfig {
        list: vec![SeedPeer { ip: "198.51.100.1".into(), port: 4000 }],
        options: PeerOptions::default(),
        nethash: "test-nethash".into(),
        min_version: "1.0.0".into(),
        current_version: "1.0.0".into(),
        os: "linux".into(),
        listen_address: "127.0.0.1:0".parse().unwrap(),
        build: "test-build".into(),
    }
}

#[tokio::test]
async fn socket_endpoint_rebroadcasts_room_events() {
    let store = Arc::new(PeerStore::open_in_memory().unwrap());
    let ctx = NodeContext::new(
        store,
        test_config(),
        Arc::new(NoopCollaborators),
        Arc::new(NoopCollaborators),
        Arc::new(NoopCollaborators),
        Arc::new(NoopCollaborators),
        Arc::new(NoopCollaborators),
    );
    ctx.app_state.loaded.store(true, Ordering::SeqCst);

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let listener = tokio::net::TcpListener::from_std(listener).unwrap();
    let router = ctx.router();
    tokio::spawn(async move {
        axum::Server::from_tcp(listener.into_std().unwrap())
            .unwrap()
            .serve(router.into_make_service())
            .await
            .unwrap();
    });

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/socket"))
        .await
        .unwrap();

    // Give the server a moment to register the subscription before we
    // publish, since the broadcast channel drops events with no
    // subscribers yet.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    ctx.app_state
        .bus
        .publish(Event::BlocksChange(json!({"id": 42})));
    // Internal events never reach the room.
    ctx.app_state.bus.publish(Event::ReceiveBlock(Value::Null));
    ctx.app_state
        .bus
        .publish(Event::TransactionsChange(json!({"id": "tx-1"})));

    let first = ws.next().await.unwrap().unwrap();
    let Message::Text(text) = first else { panic!("expected text frame") };
    let payload: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(payload["event"], "blocks/change");
    assert_eq!(payload["data"]["id"], 42);

    let second = ws.next().await.unwrap().unwrap();
    let Message::Text(text) = second else { panic!("expected text frame") };
    let payload: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(payload["event"], "transactions/change");
    assert_eq!(payload["data"]["id"], "tx-1");

    ws.close(None).await.unwrap();
}
