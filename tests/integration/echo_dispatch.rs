//! Echo round-trip and directed dispatch by holon name.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{echo_peer, spawn_broker, test_config};
use holon_client::HolonClient;
use serde_json::{Value, json};

#[tokio::test]
async fn echo_round_trip_through_the_broker() {
    let (url, _state) = spawn_broker().await;

    let (peer_a, _a_id, _) = echo_peer(&url, "caller", "A").await;
    let peer_b = HolonClient::connect(&url, test_config()).await.unwrap();

    let result = peer_b
        .invoke("caller.Echo/Ping", json!({"message": "hi"}))
        .await
        .unwrap();
    assert_eq!(result, json!({"from": "A", "message": "hi"}));

    peer_a.close().await;
    peer_b.close().await;
}

#[tokio::test]
async fn dispatch_by_name_targets_one_peer_and_strips_hints() {
    let (url, _state) = spawn_broker().await;

    let peer_a = HolonClient::connect(&url, test_config()).await.unwrap();

    // B and C count their requests and capture observed params.
    let b_calls = Arc::new(AtomicUsize::new(0));
    let b_seen: common::Recorded = Arc::new(std::sync::Mutex::new(Vec::new()));
    let peer_b = HolonClient::connect(&url, test_config()).await.unwrap();
    {
        let calls = Arc::clone(&b_calls);
        let seen = Arc::clone(&b_seen);
        peer_b
            .register("Echo/Ping", move |params| {
                let calls = Arc::clone(&calls);
                let seen = Arc::clone(&seen);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    seen.lock().unwrap().push(params.clone());
                    Ok(json!({
                        "from": "B",
                        "message": params.get("message").cloned().unwrap_or(Value::Null),
                    }))
                }
            })
            .await;
    }
    peer_b.register_name("compute").await.unwrap();

    let c_calls = Arc::new(AtomicUsize::new(0));
    let peer_c = HolonClient::connect(&url, test_config()).await.unwrap();
    {
        let calls = Arc::clone(&c_calls);
        peer_c
            .register("Echo/Ping", move |_params| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"from": "C"}))
                }
            })
            .await;
    }
    peer_c.register_name("storage").await.unwrap();

    let result = peer_a
        .invoke("compute.Echo/Ping", json!({"message": "x", "_routing": ""}))
        .await
        .unwrap();
    assert_eq!(result, json!({"from": "B", "message": "x"}));

    assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    assert_eq!(c_calls.load(Ordering::SeqCst), 0);

    let seen = b_seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(!seen[0].contains_key("_routing"));
    assert!(!seen[0].contains_key("_peer"));

    for client in [peer_a, peer_b, peer_c] {
        client.close().await;
    }
}

#[tokio::test]
async fn explicit_peer_hint_overrides_name_resolution() {
    let (url, _state) = spawn_broker().await;

    let (peer_b, b_id, _) = echo_peer(&url, "compute", "B").await;
    let (peer_c, c_id, _) = echo_peer(&url, "compute", "C").await;
    let peer_a = HolonClient::connect(&url, test_config()).await.unwrap();

    // Name resolution would pick B (first registered); _peer forces C.
    let result = peer_a
        .invoke("Echo/Ping", json!({"message": "m", "_peer": c_id}))
        .await
        .unwrap();
    assert_eq!(result.get("from"), Some(&json!("C")));

    let result = peer_a
        .invoke("compute.Echo/Ping", json!({"message": "m"}))
        .await
        .unwrap();
    assert_eq!(result.get("from"), Some(&json!("B")));
    assert!(!b_id.is_empty());

    for client in [peer_a, peer_b, peer_c] {
        client.close().await;
    }
}

#[tokio::test]
async fn directed_dispatch_never_selects_the_caller() {
    let (url, _state) = spawn_broker().await;

    // Only the caller is registered under the name: holon not found.
    let (peer_a, _a_id, _) = echo_peer(&url, "compute", "A").await;
    let err = peer_a
        .invoke("compute.Echo/Ping", json!({"message": "m"}))
        .await
        .unwrap_err();
    assert_eq!(err.code, holon_protocol::codes::NOT_FOUND);
    assert_eq!(err.message, "holon \"compute\" not found");

    // A second peer under the same name resolves past the caller.
    let (peer_b, b_id, _) = echo_peer(&url, "compute", "B").await;
    let result = peer_a
        .invoke("compute.Echo/Ping", json!({"message": "m"}))
        .await
        .unwrap();
    assert_eq!(result.get("from"), Some(&json!("B")));
    assert!(!b_id.is_empty());

    peer_a.close().await;
    peer_b.close().await;
}

#[tokio::test]
async fn unknown_names_and_methods_surface_dispatch_errors() {
    let (url, _state) = spawn_broker().await;
    let client = HolonClient::connect(&url, test_config()).await.unwrap();

    // No registration anywhere: the dotted name falls through to the
    // broker's (empty) handler table.
    let err = client
        .invoke("nowhere.Echo/Ping", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.code, holon_protocol::codes::METHOD_NOT_FOUND);
    assert_eq!(err.message, "method \"nowhere.Echo/Ping\" not found");

    let err = client.invoke("Bare", json!({})).await.unwrap_err();
    assert_eq!(err.code, holon_protocol::codes::METHOD_NOT_FOUND);

    client.close().await;
}
