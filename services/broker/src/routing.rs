//! Route hints carried inside a request's method name and params.
//!
//! `_peer` and `_routing` live in the params so the same handler registry
//! can serve local and routed calls; both are stripped exactly once here,
//! before the params are forwarded.  A leading `*.` on the method selects
//! fan-out.

use serde_json::{Map, Value};

use holon_protocol::Failure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    Default,
    /// After the caller's direct reply, notify non-participants.
    BroadcastResponse,
    /// After fan-out aggregation, notify per entry; requires fan-out.
    FullBroadcast,
}

#[derive(Debug, Clone)]
pub struct RouteHints {
    /// Explicit target from `_peer`.
    pub target_peer: Option<String>,
    pub mode: RoutingMode,
    /// True when the method carried the `*.` fan-out sigil.
    pub fan_out: bool,
    /// Method name with the fan-out sigil stripped.
    pub method: String,
}

impl RouteHints {
    /// Extract and strip the hints.  `params` is left exactly as handlers
    /// must observe it: no `_peer`, no `_routing`.
    pub fn parse(method: &str, params: &mut Map<String, Value>) -> Result<RouteHints, Failure> {
        let mode = match params.remove("_routing") {
            None => RoutingMode::Default,
            Some(Value::String(s)) => match s.as_str() {
                "" => RoutingMode::Default,
                "broadcast-response" => RoutingMode::BroadcastResponse,
                "full-broadcast" => RoutingMode::FullBroadcast,
                _ => return Err(Failure::invalid_params("invalid params")),
            },
            Some(_) => return Err(Failure::invalid_params("invalid params")),
        };

        let target_peer = match params.remove("_peer") {
            None => None,
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            Some(_) => return Err(Failure::invalid_params("invalid params")),
        };

        let (fan_out, method) = match method.strip_prefix("*.") {
            Some(rest) => (true, rest.to_owned()),
            None => (false, method.to_owned()),
        };

        if mode == RoutingMode::FullBroadcast && !fan_out {
            return Err(Failure::invalid_params("invalid params"));
        }

        Ok(RouteHints { target_peer, mode, fan_out, method })
    }
}
