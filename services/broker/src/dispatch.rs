//! The broker's request dispatcher.
//!
//! Installed as the [`Dispatch`] hook of every broker-side endpoint.  The
//! endpoint has already validated the envelope, answered heartbeats, and
//! decoded the params; this module decides what the request means:
//! built-ins (`rpc.register`, `rpc.unregister`), fan-out, directed dispatch
//! by `_peer` or `<name>.<method>` route, or a broker-local handler.
//!
//! Notifications run the identical path; the endpoint discards the outcome
//! instead of answering.

use futures_util::future::join_all;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use holon_endpoint::{Dispatch, HandlerError, HandlerFuture, InboundRequest};
use holon_protocol::{ErrorObject, Failure, methods};

use crate::registry::parse_dispatch_route;
use crate::routing::{RouteHints, RoutingMode};
use crate::state::BrokerState;

pub struct RoutingDispatcher {
    state: BrokerState,
}

impl RoutingDispatcher {
    pub fn new(state: BrokerState) -> Self {
        RoutingDispatcher { state }
    }
}

impl Dispatch for RoutingDispatcher {
    fn dispatch(&self, request: InboundRequest) -> HandlerFuture {
        let state = self.state.clone();
        Box::pin(async move { dispatch_request(state, request).await })
    }
}

async fn dispatch_request(
    state: BrokerState,
    request: InboundRequest,
) -> Result<Value, HandlerError> {
    match request.method.as_str() {
        methods::REGISTER => register_holon(&state, &request).await,
        methods::UNREGISTER => {
            state.registry().write().await.deregister(&request.peer_id);
            info!(peer_id = %request.peer_id, "holon unregistered");
            Ok(json!({}))
        }
        _ => route(state, request).await,
    }
}

async fn register_holon(
    state: &BrokerState,
    request: &InboundRequest,
) -> Result<Value, HandlerError> {
    let name = request
        .params
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let stored = state
        .registry()
        .write()
        .await
        .register(&request.peer_id, name)
        .ok_or_else(|| Failure::invalid_params("rpc.register requires a non-empty name"))?;
    info!(peer_id = %request.peer_id, name = %stored, "holon registered");
    Ok(json!({ "peer": request.peer_id, "name": stored }))
}

async fn route(state: BrokerState, request: InboundRequest) -> Result<Value, HandlerError> {
    let caller = request.peer_id;
    let mut params = request.params;
    let mut hints = RouteHints::parse(&request.method, &mut params)?;

    if hints.fan_out {
        return fan_out(&state, &caller, &hints, params).await;
    }

    if let Some(target) = hints.target_peer.take() {
        return directed(&state, &caller, &target, &hints, params).await;
    }

    if let Some((name, method)) = parse_dispatch_route(&hints.method) {
        // A parsed route only binds when the name is registered; otherwise
        // the method may simply be a dotted broker-local one.
        let resolved = {
            let registry = state.registry().read().await;
            if registry.contains_name(&name) {
                Some(registry.resolve(&name, &caller))
            } else {
                None
            }
        };
        match resolved {
            Some(Some(peer_id)) => {
                hints.method = method;
                return directed(&state, &caller, &peer_id, &hints, params).await;
            }
            Some(None) => {
                return Err(Failure::not_found(format!("holon \"{name}\" not found")).into());
            }
            None => {}
        }
    }

    local(&state, &hints.method, params).await
}

/// Forward to one peer and relay its result or error verbatim.
async fn directed(
    state: &BrokerState,
    caller: &str,
    target: &str,
    hints: &RouteHints,
    params: Map<String, Value>,
) -> Result<Value, HandlerError> {
    let Some(peer) = state.peer(target).await else {
        return Err(Failure::not_found(format!("peer \"{target}\" not found")).into());
    };
    debug!(caller, target, method = %hints.method, "directed dispatch");

    let result = peer
        .endpoint
        .invoke(
            &hints.method,
            Value::Object(params),
            state.config().request_timeout(),
        )
        .await
        .map_err(HandlerError::from)?;

    if hints.mode == RoutingMode::BroadcastResponse {
        let note = json!({ "peer": target, "result": result });
        notify_peers(state, &hints.method, &note, &[caller, target]).await;
    }
    Ok(result)
}

/// Invoke every connected peer except the caller, concurrently, and gather
/// per-target entries.  In full-broadcast mode each entry is then pushed to
/// every peer other than the caller and the entry's source.
async fn fan_out(
    state: &BrokerState,
    caller: &str,
    hints: &RouteHints,
    params: Map<String, Value>,
) -> Result<Value, HandlerError> {
    let targets = state.peers_except(&[caller]).await;
    if targets.is_empty() {
        return Err(Failure::not_found("no connected peers").into());
    }
    debug!(caller, method = %hints.method, targets = targets.len(), "fan-out dispatch");

    let params = Value::Object(params);
    let timeout = state.config().request_timeout();
    let calls = targets.into_iter().map(|peer| {
        let method = hints.method.clone();
        let params = params.clone();
        async move {
            match peer.endpoint.invoke(&method, params, timeout).await {
                Ok(result) => json!({ "peer": peer.peer_id, "result": result }),
                Err(failure) => {
                    json!({ "peer": peer.peer_id, "error": ErrorObject::from(failure) })
                }
            }
        }
    });
    let entries = join_all(calls).await;

    if hints.mode == RoutingMode::FullBroadcast {
        for entry in &entries {
            let source = entry
                .get("peer")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            notify_peers(state, &hints.method, entry, &[caller, source.as_str()]).await;
        }
    }

    Ok(Value::Array(entries))
}

async fn local(
    state: &BrokerState,
    method: &str,
    params: Map<String, Value>,
) -> Result<Value, HandlerError> {
    match state.handlers().lookup(method).await {
        Some(handler) => handler(params).await,
        None => Err(Failure::method_not_found(method).into()),
    }
}

/// Best-effort notification to every peer not excluded.  A failed send to
/// one peer never affects delivery to the rest.
async fn notify_peers(state: &BrokerState, method: &str, params: &Value, exclude: &[&str]) {
    for peer in state.peers_except(exclude).await {
        if peer.endpoint.notify(method, params.clone()).is_err() {
            debug!(peer_id = %peer.peer_id, "dropping notification to closed peer");
        }
    }
}
