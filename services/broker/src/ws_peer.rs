//! WebSocket upgrade path and per-peer session loop.

use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use holon_endpoint::{Dispatch, Endpoint, Role};
use holon_protocol::SUBPROTOCOL;

use crate::dispatch::RoutingDispatcher;
use crate::state::{BrokerState, PeerHandle, teardown_peer};

/// The upgrade only proceeds when the client offers the `holon-rpc`
/// subprotocol; anything else is a protocol error.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<BrokerState>,
    headers: HeaderMap,
) -> Response {
    if !offers_subprotocol(&headers) {
        warn!("rejecting websocket upgrade without the holon-rpc subprotocol");
        return (
            StatusCode::BAD_REQUEST,
            format!("subprotocol {SUBPROTOCOL} required"),
        )
            .into_response();
    }
    ws.protocols([SUBPROTOCOL])
        .on_upgrade(move |socket| handle_peer_socket(socket, state))
}

fn offers_subprotocol(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|offered| offered.trim() == SUBPROTOCOL)
}

async fn handle_peer_socket(mut socket: WebSocket, state: BrokerState) {
    if state.is_closed() {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    let peer_id = state.allocate_peer_id();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let dispatcher: Arc<dyn Dispatch> = Arc::new(RoutingDispatcher::new(state.clone()));
    let endpoint = Endpoint::new(Role::Server, &peer_id, out_tx, dispatcher);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let peer = PeerHandle::new(peer_id.clone(), endpoint.clone(), shutdown_tx);
    state.insert_peer(peer.clone()).await;
    info!(peer_id = %peer_id, "peer connected");

    loop {
        tokio::select! {
            out = out_rx.recv() => match out {
                Some(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => endpoint.process_text(&text).await,
                Some(Ok(Message::Binary(data))) => endpoint.process_binary(&data).await,
                Some(Ok(Message::Ping(data))) => { let _ = socket.send(Message::Pong(data)).await; }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    info!(peer_id = %peer_id, "peer disconnected");
                    break;
                }
                Some(Err(e)) => {
                    warn!(peer_id = %peer_id, error = %e, "websocket error");
                    break;
                }
            },
            _ = shutdown_rx.changed() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }

    teardown_peer(&state, &peer).await;
    info!(peer_id = %peer_id, "peer session ended");
}
