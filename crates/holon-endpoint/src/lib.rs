//! Symmetric per-connection JSON-RPC endpoint.
//!
//! One `Endpoint` instance sits on each side of a WebSocket connection: the
//! broker creates one per accepted peer, the client one per dial.  A single
//! reader feeds inbound frames into [`Endpoint::process_text`], which
//! demultiplexes by envelope shape: responses resolve the pending waiter
//! registered by [`Endpoint::invoke`], requests run through the configured
//! [`Dispatch`] implementation (a plain [`HandlerTable`] on the client, the
//! routing dispatcher on the broker).
//!
//! Outbound frames are queued on an in-process channel drained by the task
//! that owns the socket, so the endpoint itself never touches the transport.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{debug, warn};

use holon_protocol::{Envelope, ErrorObject, Failure, codes, methods};

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Which side of the connection this endpoint is.
///
/// The role picks the correlation-id namespace (`c<N>` for client-originated
/// requests, `s<N>` for broker-originated ones) and the internal-error code
/// surfaced when a handler fails with something other than a [`Failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn id_prefix(self) -> &'static str {
        match self {
            Role::Client => "c",
            Role::Server => "s",
        }
    }

    fn internal_failure(self) -> Failure {
        match self {
            Role::Client => Failure::new(codes::INTERNAL, "internal"),
            Role::Server => Failure::new(codes::INTERNAL_ERROR, "internal error"),
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers and dispatch
// ---------------------------------------------------------------------------

/// What a handler (or a dispatcher) may fail with.
///
/// A [`Failure`] crosses the wire verbatim; anything else is translated to
/// the role's generic internal error at the endpoint boundary.
#[derive(Debug)]
pub enum HandlerError {
    Rpc(Failure),
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Rpc(failure) => write!(f, "{failure}"),
            HandlerError::Other(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<Failure> for HandlerError {
    fn from(f: Failure) -> Self {
        HandlerError::Rpc(f)
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for HandlerError {
    fn from(e: Box<dyn std::error::Error + Send + Sync>) -> Self {
        HandlerError::Other(e)
    }
}

pub type HandlerFuture = futures_util::future::BoxFuture<'static, Result<Value, HandlerError>>;

/// An installed method handler: decoded params object in, result object out.
pub type Handler = Arc<dyn Fn(Map<String, Value>) -> HandlerFuture + Send + Sync>;

/// A decoded inbound request, after envelope validation and params decode.
#[derive(Debug)]
pub struct InboundRequest {
    pub method: String,
    pub params: Map<String, Value>,
    /// Broker-assigned id of the peer the request arrived from; empty on the
    /// client side, where there is only one remote.
    pub peer_id: String,
    /// True when the request carried no id: the outcome is discarded.
    pub notification: bool,
}

/// The seam between the endpoint state machine and request semantics.
///
/// The endpoint validates and decodes; the dispatcher decides what a request
/// means.  The client installs its [`HandlerTable`]; the broker installs the
/// routing dispatcher.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, request: InboundRequest) -> HandlerFuture;
}

/// Method-name → handler registry.  Duplicate registration replaces.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: Arc<RwLock<HashMap<String, Handler>>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, method: &str, handler: Handler) {
        self.handlers.write().await.insert(method.to_owned(), handler);
    }

    /// Register a plain async closure.
    pub async fn register_fn<F, Fut>(&self, method: &str, f: F)
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(method, Arc::new(move |params| Box::pin(f(params)))).await;
    }

    pub async fn lookup(&self, method: &str) -> Option<Handler> {
        self.handlers.read().await.get(method).cloned()
    }
}

impl Dispatch for HandlerTable {
    fn dispatch(&self, request: InboundRequest) -> HandlerFuture {
        let table = self.clone();
        Box::pin(async move {
            match table.lookup(&request.method).await {
                Some(handler) => handler(request.params).await,
                None => Err(Failure::method_not_found(&request.method).into()),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

type Waiter = oneshot::Sender<Result<Value, Failure>>;

pub struct Endpoint {
    role: Role,
    peer_id: String,
    out: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<String, Waiter>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    dispatch: Arc<dyn Dispatch>,
}

impl Endpoint {
    /// Create an endpoint whose outbound frames land on `out`.
    ///
    /// `peer_id` is carried into every [`InboundRequest`] this endpoint
    /// produces; the client passes an empty string.
    pub fn new(
        role: Role,
        peer_id: &str,
        out: mpsc::UnboundedSender<String>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Arc<Self> {
        Arc::new(Endpoint {
            role,
            peer_id: peer_id.to_owned(),
            out,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            dispatch,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Call a method on the remote side and wait for its response.
    ///
    /// Allocates one correlation id, released when the response arrives, the
    /// timeout fires (`deadline exceeded`), or the endpoint closes
    /// (`unavailable`).  A reply that arrives after the timeout is ignored.
    pub async fn invoke(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, Failure> {
        if self.is_closed() {
            return Err(Failure::unavailable("holon-rpc connection closed"));
        }
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{}{}", self.role.id_prefix(), seq);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let envelope = Envelope::request(id.clone(), method, params);
        if self.send_envelope(&envelope).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(Failure::unavailable("holon-rpc connection closed"));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Waiter dropped without resolution: the endpoint closed between
            // our send and the reply.
            Ok(Err(_)) => Err(Failure::unavailable("holon-rpc connection closed")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Failure::deadline_exceeded())
            }
        }
    }

    /// Send an id-less request.  Fire-and-forget: no response will ever
    /// arrive and delivery is only as reliable as the socket.
    pub fn notify(&self, method: &str, params: Value) -> Result<(), Failure> {
        if self.is_closed() {
            return Err(Failure::unavailable("holon-rpc connection closed"));
        }
        self.send_envelope(&Envelope::notification(method, params))
            .map_err(|_| Failure::unavailable("holon-rpc connection closed"))
    }

    /// Feed one inbound text frame.
    pub async fn process_text(&self, text: &str) {
        match holon_protocol::decode_text(text) {
            Ok(envelope) => self.handle_envelope(envelope).await,
            Err(e) => self.send_decode_error(&e),
        }
    }

    /// Feed one inbound binary frame (decoded as UTF-8 text).
    pub async fn process_binary(&self, data: &[u8]) {
        match holon_protocol::decode_binary(data) {
            Ok(envelope) => self.handle_envelope(envelope).await,
            Err(e) => self.send_decode_error(&e),
        }
    }

    /// Tear the endpoint down: every pending waiter is failed with `reason`,
    /// exactly once, and subsequent invokes fail immediately.  Idempotent.
    pub async fn close(&self, reason: Failure) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let waiters: Vec<Waiter> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for waiter in waiters {
            let _ = waiter.send(Err(reason.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // Inbound handling
    // -----------------------------------------------------------------------

    async fn handle_envelope(&self, envelope: Envelope) {
        if envelope.is_request() {
            self.handle_request(envelope).await;
        } else if envelope.is_response() {
            self.resolve_response(envelope).await;
        } else {
            // Neither method nor result/error: not a JSON-RPC message.
            self.respond_error(envelope.id, Failure::invalid_request("invalid request"));
        }
    }

    async fn handle_request(&self, envelope: Envelope) {
        let id = envelope.id;

        if envelope.jsonrpc != holon_protocol::JSONRPC_VERSION {
            return self.respond_error(id, Failure::invalid_request("invalid request"));
        }
        let method = match envelope.method {
            Some(m) if !m.is_empty() => m,
            _ => return self.respond_error(id, Failure::invalid_request("invalid request")),
        };

        // Requests addressed to us must carry ids from the remote side's
        // namespace; the check runs on receive, not send.  Only the server's
        // namespace is pinned by the protocol.
        let id_valid = match id.as_ref().map(Value::as_str) {
            None => true,
            Some(string_id) => match self.role {
                Role::Client => string_id.is_some_and(|s| s.starts_with('s')),
                Role::Server => string_id.is_some(),
            },
        };
        if !id_valid {
            let message = match self.role {
                Role::Client => "server request id must start with 's'",
                Role::Server => "invalid request",
            };
            return self.respond_error(id, Failure::invalid_request(message));
        }

        // Heartbeats never reach the handler table.
        if method == methods::HEARTBEAT {
            if let Some(id) = id {
                self.send_result(id, json!({}));
            }
            return;
        }

        let params = match holon_protocol::decode_params(envelope.params) {
            Ok(map) => map,
            Err(failure) => return self.respond_error(id, failure),
        };

        let request = InboundRequest {
            method,
            params,
            peer_id: self.peer_id.clone(),
            notification: id.is_none(),
        };

        // Dispatch on its own task so a slow handler never blocks the reader;
        // responses interleave and are correlated by id.
        let responder = self.responder();
        let dispatch = Arc::clone(&self.dispatch);
        tokio::spawn(async move {
            let outcome = dispatch.dispatch(request).await;
            let Some(id) = id else {
                // Notification: the outcome is discarded.
                if let Err(e) = outcome {
                    debug!(error = %e, "notification handler failed");
                }
                return;
            };
            match outcome {
                Ok(result) => responder.send_result(id, result),
                Err(e) => responder.respond_error(Some(id), responder.translate(e)),
            }
        });
    }

    async fn resolve_response(&self, envelope: Envelope) {
        let Some(id) = envelope.id.as_ref().and_then(Value::as_str) else {
            debug!("response without a string id, ignoring");
            return;
        };
        let Some(waiter) = self.pending.lock().await.remove(id) else {
            // Late reply after a timeout, or an id we never issued.
            debug!(id, "no pending waiter for response, ignoring");
            return;
        };
        let outcome = match envelope.error {
            Some(error) => Err(Failure::from(error)),
            None => Ok(envelope.result.unwrap_or_else(|| json!({}))),
        };
        let _ = waiter.send(outcome);
    }

    // -----------------------------------------------------------------------
    // Outbound helpers
    // -----------------------------------------------------------------------

    fn responder(&self) -> Responder {
        Responder { out: self.out.clone(), role: self.role }
    }

    fn send_result(&self, id: Value, result: Value) {
        self.responder().send_result(id, result);
    }

    fn respond_error(&self, id: Option<Value>, failure: Failure) {
        self.responder().respond_error(id, failure);
    }

    fn send_decode_error(&self, error: &holon_protocol::DecodeError) {
        warn!(error = %error, "dropping undecodable frame");
        let _ = write_envelope(&self.out, &Envelope::failure(Value::Null, error.to_error_object()));
    }

    fn send_envelope(&self, envelope: &Envelope) -> Result<(), ()> {
        write_envelope(&self.out, envelope)
    }
}

/// The slice of an endpoint a spawned dispatch task needs to answer its
/// request: the outbound queue and the role's error translation.
#[derive(Clone)]
struct Responder {
    out: mpsc::UnboundedSender<String>,
    role: Role,
}

impl Responder {
    fn send_result(&self, id: Value, result: Value) {
        let _ = write_envelope(&self.out, &Envelope::result(id, result));
    }

    /// Emit an error response.  Skipped entirely for notifications: a
    /// request without an id never yields a response envelope.
    fn respond_error(&self, id: Option<Value>, failure: Failure) {
        let Some(id) = id else { return };
        let _ = write_envelope(&self.out, &Envelope::failure(id, ErrorObject::from(failure)));
    }

    fn translate(&self, error: HandlerError) -> Failure {
        match error {
            HandlerError::Rpc(failure) => failure,
            HandlerError::Other(e) => {
                warn!(error = %e, "handler failed with a non-protocol error");
                self.role.internal_failure()
            }
        }
    }
}

fn write_envelope(out: &mpsc::UnboundedSender<String>, envelope: &Envelope) -> Result<(), ()> {
    match holon_protocol::encode(envelope) {
        Ok(text) => out.send(text).map_err(|_| ()),
        Err(e) => {
            warn!(error = %e, "failed to serialize envelope");
            Err(())
        }
    }
}
