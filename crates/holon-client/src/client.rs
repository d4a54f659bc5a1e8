//! Peer client: one long-lived broker connection with a reconnect
//! supervisor.
//!
//! # Lifecycle
//! 1. `connect` dials once, asking for the `holon-rpc` subprotocol; a
//!    refused negotiation fails fast.
//! 2. A supervisor task owns the connection: session loop, heartbeat timer,
//!    and exponential-backoff redial with jitter after every disconnect.
//! 3. `invoke` waits for the connection gate (bounded by the connect
//!    timeout) before sending.
//! 4. `close` is idempotent: normal-closure close frame, timers cancelled,
//!    remaining pending requests failed.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, Notify, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{info, warn};

use holon_endpoint::{Endpoint, HandlerError, HandlerTable, Role};
use holon_protocol::{Failure, SUBPROTOCOL, methods};

use crate::config::ClientConfig;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connect(String),
    #[error("timed out establishing the connection")]
    ConnectTimeout,
    #[error("server did not negotiate the {SUBPROTOCOL} subprotocol")]
    Subprotocol,
}

struct ClientShared {
    url: String,
    config: ClientConfig,
    handlers: HandlerTable,
    /// Endpoint of the current connection, if any.
    conn: RwLock<Option<Arc<Endpoint>>>,
    /// Close-command sender of the current connection, if any.
    close_cmd: RwLock<Option<mpsc::Sender<CloseCode>>>,
    /// The `awaitConnected` gate: true while a connection is up.
    connected: watch::Sender<bool>,
    closed: AtomicBool,
    /// Wakes the supervisor out of a backoff sleep on close.
    close_notify: Notify,
    /// Heartbeat probes acknowledged by the broker, across reconnects.
    heartbeats: AtomicU64,
}

impl ClientShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A peer client handle.  Cheap to share by reference; all methods take
/// `&self`.
pub struct HolonClient {
    shared: Arc<ClientShared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl HolonClient {
    /// Dial the broker and start the reconnect supervisor.
    ///
    /// The initial dial failing (or negotiating the wrong subprotocol)
    /// surfaces here; once connected, every later drop is handled by the
    /// supervisor's backoff redial.
    pub async fn connect(url: &str, config: ClientConfig) -> Result<Self, ClientError> {
        let (connected, _) = watch::channel(false);
        let shared = Arc::new(ClientShared {
            url: url.to_owned(),
            config,
            handlers: HandlerTable::new(),
            conn: RwLock::new(None),
            close_cmd: RwLock::new(None),
            connected,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            heartbeats: AtomicU64::new(0),
        });

        let socket = dial(&shared.url, &shared.config).await?;
        let supervisor = tokio::spawn(supervise(Arc::clone(&shared), socket));
        Ok(HolonClient { shared, supervisor: Mutex::new(Some(supervisor)) })
    }

    /// Install a handler for inbound requests (and notifications) named
    /// `method`.  Duplicate registration replaces.
    pub async fn register<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.shared.handlers.register_fn(method, handler).await;
    }

    /// Call a method through the broker and wait for the response.
    pub async fn invoke(&self, method: &str, params: Value) -> Result<Value, Failure> {
        let endpoint = self.current_endpoint().await?;
        endpoint
            .invoke(method, params, self.shared.config.request_timeout())
            .await
    }

    /// Send a notification through the broker.  Fire-and-forget.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), Failure> {
        let endpoint = self.current_endpoint().await?;
        endpoint.notify(method, params)
    }

    /// Declare this peer's holon name via `rpc.register`; returns the
    /// broker-assigned peer id.
    pub async fn register_name(&self, name: &str) -> Result<String, Failure> {
        let result = self.invoke(methods::REGISTER, json!({ "name": name })).await?;
        Ok(result
            .get("peer")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned())
    }

    /// Drop this peer's holon name via `rpc.unregister`.
    pub async fn unregister_name(&self) -> Result<(), Failure> {
        self.invoke(methods::UNREGISTER, json!({})).await.map(|_| ())
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Heartbeat probes the broker has acknowledged since this client was
    /// created, cumulative across reconnects.
    pub fn heartbeat_count(&self) -> u64 {
        self.shared.heartbeats.load(Ordering::Relaxed)
    }

    /// Close the client for good: no reconnect will fire afterwards.
    /// Idempotent.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.close_notify.notify_waiters();
        let close_cmd = self.shared.close_cmd.read().await.clone();
        if let Some(tx) = close_cmd {
            let _ = tx.try_send(CloseCode::Normal);
        }
        let supervisor = self.supervisor.lock().await.take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        info!("client closed");
    }

    async fn current_endpoint(&self) -> Result<Arc<Endpoint>, Failure> {
        if self.shared.is_closed() {
            return Err(Failure::unavailable("client closed"));
        }
        let mut gate = self.shared.connected.subscribe();
        let wait = gate.wait_for(|connected| *connected);
        match tokio::time::timeout(self.shared.config.connect_timeout(), wait).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => return Err(Failure::unavailable("client closed")),
            Err(_) => return Err(Failure::unavailable("not connected")),
        }
        match self.shared.conn.read().await.clone() {
            Some(endpoint) => Ok(endpoint),
            None => Err(Failure::unavailable("not connected")),
        }
    }
}

impl Drop for HolonClient {
    fn drop(&mut self) {
        // Explicit close is the graceful path; dropping just stops the
        // supervisor so no reconnect outlives the handle.
        if let Ok(mut guard) = self.supervisor.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dialing
// ---------------------------------------------------------------------------

async fn dial(url: &str, config: &ClientConfig) -> Result<WsStream, ClientError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ClientError::Connect(format!("invalid URL '{url}': {e}")))?;
    request.headers_mut().insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(SUBPROTOCOL),
    );

    let (mut ws, response) = tokio::time::timeout(config.connect_timeout(), connect_async(request))
        .await
        .map_err(|_| ClientError::ConnectTimeout)?
        .map_err(|e| ClientError::Connect(e.to_string()))?;

    let negotiated = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if negotiated != Some(SUBPROTOCOL) {
        let _ = ws
            .close(Some(CloseFrame {
                code: CloseCode::Protocol,
                reason: "subprotocol holon-rpc required".into(),
            }))
            .await;
        return Err(ClientError::Subprotocol);
    }
    Ok(ws)
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

async fn supervise(shared: Arc<ClientShared>, first: WsStream) {
    let mut socket = Some(first);
    let mut attempt: u32 = 0;
    loop {
        if shared.is_closed() {
            break;
        }
        let ws = match socket.take() {
            Some(ws) => ws,
            None => match dial(&shared.url, &shared.config).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(error = %e, attempt, "reconnect attempt failed");
                    let delay = reconnect_delay(&shared.config, attempt);
                    attempt = attempt.saturating_add(1);
                    if !sleep_unless_closed(&shared, delay).await {
                        break;
                    }
                    continue;
                }
            },
        };
        // A close() racing the dial: drop the fresh socket instead of
        // serving it.
        if shared.is_closed() {
            break;
        }
        attempt = 0;
        info!(url = %shared.url, "connected to broker");
        run_connection(&shared, ws).await;
        if shared.is_closed() {
            break;
        }
        let delay = reconnect_delay(&shared.config, attempt);
        attempt = attempt.saturating_add(1);
        warn!(delay_ms = delay.as_millis() as u64, "disconnected from broker, reconnecting");
        if !sleep_unless_closed(&shared, delay).await {
            break;
        }
    }
}

/// `min(base * factor^attempt, max) + U[0, base * jitter)`.
fn reconnect_delay(config: &ClientConfig, attempt: u32) -> Duration {
    let base = config.reconnect_min_delay_ms as f64;
    let capped = (base * config.reconnect_factor.powi(attempt as i32))
        .min(config.reconnect_max_delay_ms as f64);
    let span = base * config.reconnect_jitter;
    let jitter = if span > 0.0 {
        rand::thread_rng().gen_range(0.0..span)
    } else {
        0.0
    };
    Duration::from_millis((capped + jitter) as u64)
}

/// Returns false when the client closed during the sleep.
async fn sleep_unless_closed(shared: &ClientShared, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => !shared.is_closed(),
        _ = shared.close_notify.notified() => false,
    }
}

// ---------------------------------------------------------------------------
// One connection
// ---------------------------------------------------------------------------

async fn run_connection(shared: &Arc<ClientShared>, mut ws: WsStream) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let endpoint = Endpoint::new(Role::Client, "", out_tx, Arc::new(shared.handlers.clone()));
    let (close_tx, mut close_rx) = mpsc::channel::<CloseCode>(1);

    *shared.conn.write().await = Some(Arc::clone(&endpoint));
    *shared.close_cmd.write().await = Some(close_tx.clone());
    shared.connected.send_replace(true);

    let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; the broker does not need a probe
    // right after the handshake.
    heartbeat.tick().await;
    let probe_in_flight = Arc::new(AtomicBool::new(false));

    loop {
        // Covers a close() that slipped in between the gate opening and the
        // close-command channel being observed.
        if shared.is_closed() {
            let _ = ws
                .close(Some(CloseFrame { code: CloseCode::Normal, reason: "".into() }))
                .await;
            break;
        }
        // Close commands win over traffic, and queued outbound frames drain
        // before more inbound is read.
        tokio::select! {
            biased;
            cmd = close_rx.recv() => {
                let code = cmd.unwrap_or(CloseCode::Normal);
                let _ = ws.close(Some(CloseFrame { code, reason: "".into() })).await;
                break;
            }
            out = out_rx.recv() => match out {
                Some(text) => {
                    if ws.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => endpoint.process_text(text.as_str()).await,
                Some(Ok(Message::Binary(data))) => endpoint.process_binary(&data).await,
                Some(Ok(Message::Ping(data))) => { let _ = ws.send(Message::Pong(data)).await; }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(error = %e, "websocket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
            _ = heartbeat.tick() => {
                spawn_heartbeat_probe(shared, &endpoint, &close_tx, &probe_in_flight);
            }
        }
    }

    shared.connected.send_replace(false);
    *shared.conn.write().await = None;
    *shared.close_cmd.write().await = None;
    endpoint
        .close(Failure::unavailable("holon-rpc connection closed"))
        .await;
}

/// Issue one `rpc.heartbeat` probe off the session loop.  A failed or timed
/// out probe closes the socket "going away"; disconnect handling then
/// schedules the reconnect.
fn spawn_heartbeat_probe(
    shared: &Arc<ClientShared>,
    endpoint: &Arc<Endpoint>,
    close_tx: &mpsc::Sender<CloseCode>,
    in_flight: &Arc<AtomicBool>,
) {
    if in_flight.swap(true, Ordering::AcqRel) {
        return;
    }
    let shared = Arc::clone(shared);
    let endpoint = Arc::clone(endpoint);
    let close_tx = close_tx.clone();
    let in_flight = Arc::clone(in_flight);
    tokio::spawn(async move {
        let outcome = endpoint
            .invoke(methods::HEARTBEAT, json!({}), shared.config.heartbeat_timeout())
            .await;
        in_flight.store(false, Ordering::Release);
        match outcome {
            Ok(_) => {
                shared.heartbeats.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(error = %e, "heartbeat failed, closing connection");
                let _ = close_tx.try_send(CloseCode::Away);
            }
        }
    });
}
