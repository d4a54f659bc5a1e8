use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, RwLock, watch};
use tracing::info;

use holon_endpoint::{Endpoint, HandlerTable};
use holon_protocol::Failure;

use crate::registry::Registry;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// URL path serving the WebSocket upgrade.
    pub rpc_path: String,
    /// Bound on broker-originated invokes (forwarding, fan-out legs).
    pub request_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            rpc_path: holon_protocol::DEFAULT_RPC_PATH.to_owned(),
            request_timeout_ms: 30_000,
        }
    }
}

impl BrokerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// One connected peer: its endpoint plus a close request channel watched by
/// the socket task.
#[derive(Clone)]
pub struct PeerHandle {
    pub peer_id: String,
    pub endpoint: Arc<Endpoint>,
    shutdown: watch::Sender<bool>,
}

impl PeerHandle {
    pub fn new(peer_id: String, endpoint: Arc<Endpoint>, shutdown: watch::Sender<bool>) -> Self {
        PeerHandle { peer_id, endpoint, shutdown }
    }

    /// Ask the socket task to close this peer's connection.
    pub fn request_close(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for a client")]
    TimedOut,
    #[error("broker closed")]
    Closed,
}

/// Shared broker state: peer table, registry, broker-local handlers, and the
/// connected-peer queue behind `wait_for_client`.
#[derive(Clone)]
pub struct BrokerState {
    config: Arc<BrokerConfig>,
    peers: Arc<RwLock<HashMap<String, PeerHandle>>>,
    registry: Arc<RwLock<Registry>>,
    handlers: HandlerTable,
    next_peer_id: Arc<AtomicU64>,
    connected: Arc<Mutex<VecDeque<String>>>,
    connected_notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl BrokerState {
    pub fn new(config: BrokerConfig) -> Self {
        BrokerState {
            config: Arc::new(config),
            peers: Arc::new(RwLock::new(HashMap::new())),
            registry: Arc::new(RwLock::new(Registry::new())),
            handlers: HandlerTable::new(),
            next_peer_id: Arc::new(AtomicU64::new(0)),
            connected: Arc::new(Mutex::new(VecDeque::new())),
            connected_notify: Arc::new(Notify::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Broker-local method handlers (the step-9 fallback of the dispatch
    /// order).
    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn registry(&self) -> &Arc<RwLock<Registry>> {
        &self.registry
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Peer ids are unique for the broker lifetime: a plain counter.
    pub fn allocate_peer_id(&self) -> String {
        let n = self.next_peer_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("c{n}")
    }

    pub async fn insert_peer(&self, peer: PeerHandle) {
        let peer_id = peer.peer_id.clone();
        self.peers.write().await.insert(peer_id.clone(), peer);
        self.connected.lock().await.push_back(peer_id);
        self.connected_notify.notify_waiters();
    }

    /// Drop the peer record and its registrations.
    pub async fn remove_peer(&self, peer_id: &str) {
        self.peers.write().await.remove(peer_id);
        self.registry.write().await.deregister(peer_id);
    }

    pub async fn peer(&self, peer_id: &str) -> Option<PeerHandle> {
        self.peers.read().await.get(peer_id).cloned()
    }

    /// Every connected peer except the given ids.
    pub async fn peers_except(&self, exclude: &[&str]) -> Vec<PeerHandle> {
        self.peers
            .read()
            .await
            .values()
            .filter(|peer| !exclude.contains(&peer.peer_id.as_str()))
            .cloned()
            .collect()
    }

    /// Pop the next connected peer id, FIFO in accept order.
    ///
    /// With `timeout: None` this blocks until a peer connects or the broker
    /// closes; with a timeout it fails with [`WaitError::TimedOut`].
    pub async fn wait_for_client(&self, timeout: Option<Duration>) -> Result<String, WaitError> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            // Arm the notification before checking the queue so a push
            // between the check and the await cannot be missed.
            let notified = self.connected_notify.notified();
            if let Some(peer_id) = self.connected.lock().await.pop_front() {
                return Ok(peer_id);
            }
            if self.is_closed() {
                return Err(WaitError::Closed);
            }
            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return match self.connected.lock().await.pop_front() {
                            Some(peer_id) => Ok(peer_id),
                            None => Err(WaitError::TimedOut),
                        };
                    }
                }
            }
        }
    }

    /// Close the broker: fail `wait_for_client` waiters and ask every peer
    /// socket to close (which fails their pending maps).  Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("broker closing, disconnecting all peers");
        self.connected_notify.notify_waiters();
        let peers: Vec<PeerHandle> = self.peers.read().await.values().cloned().collect();
        for peer in peers {
            peer.request_close();
        }
    }
}

/// Teardown for one disconnected peer: registrations dropped, every pending
/// invoke failed exactly once.
pub async fn teardown_peer(state: &BrokerState, peer: &PeerHandle) {
    state.remove_peer(&peer.peer_id).await;
    peer.endpoint
        .close(Failure::unavailable("holon-rpc connection closed"))
        .await;
}
