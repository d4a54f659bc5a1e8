//! Disconnect handling: pending failure, registry cleanup, upgrade
//! validation, and broker close.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use axum::routing::get;
use common::{echo_peer, spawn_broker, test_config};
use holon_client::HolonClient;
use serde_json::json;

#[tokio::test]
async fn peer_disconnect_fails_inflight_requests_and_clears_the_registry() {
    let (url, state) = spawn_broker().await;

    let peer_a = HolonClient::connect(&url, test_config()).await.unwrap();
    let peer_b = HolonClient::connect(&url, test_config()).await.unwrap();
    peer_b
        .register("Echo/Block", |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!({}))
        })
        .await;
    let b_id = peer_b.register_name("slow").await.unwrap();

    // Kick B while A's request is parked in B's handler.
    let kick = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        state.peer(&b_id).await.unwrap().request_close();
    };
    let (outcome, ()) = tokio::join!(peer_a.invoke("slow.Echo/Block", json!({})), kick);

    let err = outcome.unwrap_err();
    assert_eq!(err.code, holon_protocol::codes::UNAVAILABLE);
    assert_eq!(err.message, "holon-rpc connection closed");

    // B's registration is gone with it: the dotted name no longer routes.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let err = peer_a
        .invoke("slow.Echo/Block", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.code, holon_protocol::codes::METHOD_NOT_FOUND);

    peer_a.close().await;
    peer_b.close().await;
}

#[tokio::test]
async fn closing_the_client_fails_pending_requests_exactly_once() {
    let (url, state) = spawn_broker().await;
    state
        .handlers()
        .register_fn("Hang", |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!({}))
        })
        .await;

    let client = Arc::new(HolonClient::connect(&url, test_config()).await.unwrap());
    let inflight = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.invoke("Hang", json!({})).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    client.close().await;
    client.close().await; // idempotent

    let err = inflight.await.unwrap().unwrap_err();
    assert_eq!(err.code, holon_protocol::codes::UNAVAILABLE);

    let err = client.invoke("Hang", json!({})).await.unwrap_err();
    assert_eq!(err.code, holon_protocol::codes::UNAVAILABLE);
}

#[tokio::test]
async fn wait_for_client_yields_peer_ids_in_accept_order() {
    let (url, state) = spawn_broker().await;

    let first = HolonClient::connect(&url, test_config()).await.unwrap();
    let first_id = first.register_name("first").await.unwrap();
    let second = HolonClient::connect(&url, test_config()).await.unwrap();
    let second_id = second.register_name("second").await.unwrap();

    let queued_first = state
        .wait_for_client(Some(Duration::from_secs(1)))
        .await
        .unwrap();
    let queued_second = state
        .wait_for_client(Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(queued_first, first_id);
    assert_eq!(queued_second, second_id);

    first.close().await;
    second.close().await;
}

#[tokio::test]
async fn broker_close_fails_waiters_and_disconnects_peers() {
    let (url, state) = spawn_broker().await;

    let (peer, _id, _) = echo_peer(&url, "a", "A").await;
    let _ = state
        .wait_for_client(Some(Duration::from_secs(1)))
        .await
        .unwrap();
    peer.close().await;

    state.close().await;
    let err = state
        .wait_for_client(Some(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, broker::WaitError::Closed));

    // New connections are refused after close; anything dialed late can
    // never complete a call.
    let late = HolonClient::connect(&url, test_config()).await;
    if let Ok(late) = late {
        assert!(late.invoke("Ping", json!({})).await.is_err());
        late.close().await;
    }
}

#[tokio::test]
async fn upgrades_without_the_subprotocol_are_rejected() {
    let (url, _state) = spawn_broker().await;

    // A raw dial that never offers `holon-rpc` must not upgrade.
    let outcome = tokio_tungstenite::connect_async(url.as_str()).await;
    assert!(outcome.is_err(), "upgrade without subprotocol must fail");

    // The real client negotiates it and connects fine.
    let client = HolonClient::connect(&url, test_config()).await.unwrap();
    assert!(client.is_connected());
    client.close().await;
}

#[tokio::test]
async fn clients_reject_servers_that_skip_subprotocol_negotiation() {
    async fn plain_upgrade(ws: WebSocketUpgrade) -> Response {
        ws.on_upgrade(|_socket| async {})
    }
    let router = axum::Router::new().route("/rpc", get(plain_upgrade));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    let outcome = HolonClient::connect(&format!("ws://{addr}/rpc"), test_config()).await;
    assert!(
        outcome.is_err(),
        "a connection without the holon-rpc subprotocol must be refused"
    );
}
