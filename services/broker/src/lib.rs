pub mod dispatch;
pub mod registry;
pub mod routing;
pub mod state;
pub mod ws_peer;

pub use state::{BrokerConfig, BrokerState, PeerHandle, WaitError};

use axum::{Router, routing::get};

/// Build the broker's router: the WebSocket upgrade on the configured path
/// plus liveness routes.
pub fn build_router(state: BrokerState) -> Router {
    let rpc_path = state.config().rpc_path.clone();
    Router::new()
        .route(&rpc_path, get(ws_peer::ws_handler))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
