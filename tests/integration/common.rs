//! Shared fixtures for the end-to-end suites: an ephemeral-port broker and
//! echo peers that record the notifications they receive.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use broker::{BrokerConfig, BrokerState};
use holon_client::{ClientConfig, HolonClient};
use serde_json::{Map, Value, json};

/// Bind a broker on an ephemeral port and serve it in the background.
/// Returns the WebSocket URL and the broker state for direct inspection.
pub async fn spawn_broker() -> (String, BrokerState) {
    let state = BrokerState::new(BrokerConfig::default());
    let router = broker::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind broker listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    let url = format!("ws://{}{}", addr, state.config().rpc_path);
    (url, state)
}

/// Client tunables for tests: short timeouts, quick reconnect, and a
/// heartbeat interval long enough to stay out of the way.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        heartbeat_interval_ms: 60_000,
        heartbeat_timeout_ms: 1_000,
        reconnect_min_delay_ms: 50,
        reconnect_max_delay_ms: 500,
        connect_timeout_ms: 2_000,
        request_timeout_ms: 2_000,
        ..ClientConfig::default()
    }
}

pub type Recorded = Arc<Mutex<Vec<Map<String, Value>>>>;

/// Connect a peer, install an `Echo/Ping` handler answering
/// `{from: <tag>, message}`, and register it under `name`.
///
/// Broadcast notifications reuse the forwarded method name with
/// `{peer, result}` params; the handler records those instead of echoing,
/// so each peer's recorder holds exactly the notifications it received.
pub async fn echo_peer(url: &str, name: &str, tag: &'static str) -> (HolonClient, String, Recorded) {
    let client = HolonClient::connect(url, test_config())
        .await
        .expect("connect peer");
    let notifications: Recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&notifications);
    client
        .register("Echo/Ping", move |params| {
            let sink = Arc::clone(&sink);
            async move {
                if params.contains_key("peer") {
                    sink.lock().unwrap().push(params);
                    return Ok(json!({}));
                }
                Ok(json!({
                    "from": tag,
                    "message": params.get("message").cloned().unwrap_or(Value::Null),
                }))
            }
        })
        .await;
    let peer_id = client.register_name(name).await.expect("register name");
    (client, peer_id, notifications)
}
