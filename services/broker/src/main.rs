use std::env;

use broker::{BrokerConfig, BrokerState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned());
    let rpc_path = env::var("RPC_PATH")
        .unwrap_or_else(|_| holon_protocol::DEFAULT_RPC_PATH.to_owned());

    let state = BrokerState::new(BrokerConfig { rpc_path, ..BrokerConfig::default() });
    let router = broker::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "broker listening");

    // Closing the state first asks every peer socket to wind down, so the
    // graceful-shutdown drain actually completes: WebSocket sessions never
    // end on their own.
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            wait_for_termination().await;
            state.close().await;
        })
        .await
        .expect("broker error");
    info!("broker stopped");
}

/// Resolves once the operator asks the broker to stop (SIGINT, or SIGTERM
/// where available).
async fn wait_for_termination() {
    let interrupt = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("SIGTERM handler");
        tokio::select! {
            _ = interrupt => info!("interrupt received, draining peers"),
            _ = term.recv() => info!("termination requested, draining peers"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = interrupt.await;
        info!("interrupt received, draining peers");
    }
}
