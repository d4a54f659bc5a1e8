//! Fan-out aggregation and both broadcast modes.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{echo_peer, spawn_broker, test_config};
use holon_client::HolonClient;
use serde_json::{Value, json};

/// Broadcast delivery is asynchronous; give the sockets a moment.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn fan_out_reaches_every_other_peer() {
    let (url, _state) = spawn_broker().await;

    let peer_a = HolonClient::connect(&url, test_config()).await.unwrap();
    let (peer_b, b_id, _) = echo_peer(&url, "b", "B").await;
    let (peer_c, c_id, _) = echo_peer(&url, "c", "C").await;
    let (peer_d, d_id, _) = echo_peer(&url, "d", "D").await;

    let result = peer_a
        .invoke("*.Echo/Ping", json!({"message": "f"}))
        .await
        .unwrap();

    // The aggregate is an array, normalized under "value".
    let entries = result
        .get("value")
        .and_then(Value::as_array)
        .expect("fan-out result should be {\"value\": [...]}");
    assert_eq!(entries.len(), 3);

    let peers: HashSet<&str> = entries
        .iter()
        .map(|entry| entry.get("peer").and_then(Value::as_str).unwrap())
        .collect();
    let expected: HashSet<&str> =
        [b_id.as_str(), c_id.as_str(), d_id.as_str()].into_iter().collect();
    assert_eq!(peers, expected);

    for entry in entries {
        let result = entry.get("result").expect("every entry should have a result");
        assert!(result.is_object());
        assert_eq!(result.get("message"), Some(&json!("f")));
        assert!(entry.get("error").is_none());
    }

    for client in [peer_a, peer_b, peer_c, peer_d] {
        client.close().await;
    }
}

#[tokio::test]
async fn fan_out_with_no_other_peers_is_not_found() {
    let (url, _state) = spawn_broker().await;
    let client = HolonClient::connect(&url, test_config()).await.unwrap();

    let err = client.invoke("*.Echo/Ping", json!({})).await.unwrap_err();
    assert_eq!(err.code, holon_protocol::codes::NOT_FOUND);
    assert_eq!(err.message, "no connected peers");

    client.close().await;
}

#[tokio::test]
async fn broadcast_response_notifies_non_participants() {
    let (url, _state) = spawn_broker().await;

    let (peer_a, _a_id, a_notes) = echo_peer(&url, "a", "A").await;
    let (peer_b, _b_id, b_notes) = echo_peer(&url, "b", "B").await;
    let (peer_c, c_id, c_notes) = echo_peer(&url, "storage", "C").await;
    let (peer_d, _d_id, d_notes) = echo_peer(&url, "d", "D").await;

    let result = peer_a
        .invoke(
            "storage.Echo/Ping",
            json!({"_routing": "broadcast-response", "message": "m"}),
        )
        .await
        .unwrap();
    assert_eq!(result, json!({"from": "C", "message": "m"}));

    settle().await;

    // B and D each see one notification naming the target; the caller and
    // the target see none.
    for notes in [&b_notes, &d_notes] {
        let notes = notes.lock().unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(
            notes[0].get("peer").and_then(Value::as_str),
            Some(c_id.as_str())
        );
        let carried = notes[0].get("result").unwrap();
        assert_eq!(carried.get("from"), Some(&json!("C")));
    }
    assert!(a_notes.lock().unwrap().is_empty());
    assert!(c_notes.lock().unwrap().is_empty());

    for client in [peer_a, peer_b, peer_c, peer_d] {
        client.close().await;
    }
}

#[tokio::test]
async fn full_broadcast_notifies_per_entry_excluding_the_source() {
    let (url, _state) = spawn_broker().await;

    let (peer_a, _a_id, a_notes) = echo_peer(&url, "a", "A").await;
    let (peer_b, b_id, b_notes) = echo_peer(&url, "b", "B").await;
    let (peer_c, c_id, c_notes) = echo_peer(&url, "c", "C").await;
    let (peer_d, d_id, d_notes) = echo_peer(&url, "d", "D").await;

    let result = peer_a
        .invoke(
            "*.Echo/Ping",
            json!({"_routing": "full-broadcast", "message": "m"}),
        )
        .await
        .unwrap();
    assert_eq!(result.get("value").and_then(Value::as_array).unwrap().len(), 3);

    settle().await;

    // Each of B, C, D receives one notification per *other* fan-out entry.
    for (own_id, notes) in [(&b_id, &b_notes), (&c_id, &c_notes), (&d_id, &d_notes)] {
        let notes = notes.lock().unwrap();
        assert_eq!(notes.len(), 2, "peer {own_id} should see two entries");
        let sources: HashSet<&str> = notes
            .iter()
            .map(|n| n.get("peer").and_then(Value::as_str).unwrap())
            .collect();
        assert_eq!(sources.len(), 2);
        assert!(!sources.contains(own_id.as_str()));
        for note in notes.iter() {
            assert!(note.get("result").is_some());
        }
    }
    // The caller is excluded from every entry's broadcast.
    assert!(a_notes.lock().unwrap().is_empty());

    for client in [peer_a, peer_b, peer_c, peer_d] {
        client.close().await;
    }
}

#[tokio::test]
async fn full_broadcast_without_fan_out_is_invalid_params() {
    let (url, _state) = spawn_broker().await;
    let (peer_a, _, _) = echo_peer(&url, "a", "A").await;
    let (peer_b, _, _) = echo_peer(&url, "b", "B").await;

    let err = peer_a
        .invoke("b.Echo/Ping", json!({"_routing": "full-broadcast"}))
        .await
        .unwrap_err();
    assert_eq!(err.code, holon_protocol::codes::INVALID_PARAMS);

    peer_a.close().await;
    peer_b.close().await;
}

#[tokio::test]
async fn fan_out_collects_errors_without_losing_results() {
    let (url, _state) = spawn_broker().await;

    let peer_a = HolonClient::connect(&url, test_config()).await.unwrap();
    let (peer_b, b_id, _) = echo_peer(&url, "b", "B").await;
    // C has no Echo/Ping handler: its entry must carry an error.
    let peer_c = HolonClient::connect(&url, test_config()).await.unwrap();
    let c_id = peer_c.register_name("c").await.unwrap();

    let result = peer_a
        .invoke("*.Echo/Ping", json!({"message": "f"}))
        .await
        .unwrap();
    let entries = result.get("value").and_then(Value::as_array).unwrap();
    assert_eq!(entries.len(), 2);

    for entry in entries {
        let peer = entry.get("peer").and_then(Value::as_str).unwrap();
        if peer == b_id {
            assert!(entry.get("result").is_some());
        } else {
            assert_eq!(peer, c_id);
            let error = entry.get("error").unwrap();
            assert_eq!(
                error.get("code"),
                Some(&json!(holon_protocol::codes::METHOD_NOT_FOUND))
            );
        }
    }

    for client in [peer_a, peer_b, peer_c] {
        client.close().await;
    }
}
