// holon-protocol: JSON-RPC 2.0 envelope types and frame codec.
//
// One envelope per WebSocket text frame; binary frames are decoded as
// UTF-8 text.  Request/response demultiplexing is by envelope shape:
// presence of `method` marks a request, `result`/`error` mark a response.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Protocol version carried in every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// WebSocket subprotocol both sides must negotiate.
pub const SUBPROTOCOL: &str = "holon-rpc";

/// Default broker path for the WebSocket upgrade.
pub const DEFAULT_RPC_PATH: &str = "/rpc";

/// Reserved method names handled by the broker itself.
pub mod methods {
    pub const HEARTBEAT: &str = "rpc.heartbeat";
    pub const REGISTER: &str = "rpc.register";
    pub const UNREGISTER: &str = "rpc.unregister";
}

/// Frozen error codes: the JSON-RPC standard set plus domain codes.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal error surfaced by the broker side.
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const DEADLINE_EXCEEDED: i64 = 4;
    /// Target holon or peer not found.
    pub const NOT_FOUND: i64 = 5;
    /// Internal error surfaced by a peer handler.
    pub const INTERNAL: i64 = 13;
    /// Connection closed before a response arrived.
    pub const UNAVAILABLE: i64 = 14;
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One JSON-RPC 2.0 message.
///
/// Absent fields are omitted on the wire.  A request carries `method` and
/// optionally `id`; absence of `id` marks a notification (no response may
/// be sent).  A response carries `id` and exactly one of `result`/`error`.
/// An explicit `"id": null` deserializes to `None`, so a null-id request is
/// treated as a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Always `"2.0"` on well-formed messages; defaulted empty when missing
    /// so the receiver can answer `invalid request` instead of failing the
    /// parse.
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Envelope {
    pub fn request(id: impl Into<String>, method: &str, params: Value) -> Self {
        Envelope {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: Some(Value::String(id.into())),
            method: Some(method.to_owned()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Envelope {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: None,
            method: Some(method.to_owned()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Success response.  The result is normalized so the wire value is
    /// always a JSON object: non-objects are wrapped as `{"value": <raw>}`.
    pub fn result(id: Value, result: Value) -> Self {
        Envelope {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(normalize_result(result)),
            error: None,
        }
    }

    /// Error response.  `id` is `Value::Null` when the failing request's id
    /// could not be identified.
    pub fn failure(id: Value, error: ErrorObject) -> Self {
        Envelope {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    /// True when this is a request without an id: no response may be sent.
    pub fn is_notification(&self) -> bool {
        self.is_request() && self.id.is_none()
    }
}

/// Wrap a non-object result as `{"value": <raw>}`.
///
/// Responses are object-shaped by contract; fan-out aggregates (arrays) and
/// scalar handler results pass through this before hitting the wire.
pub fn normalize_result(value: Value) -> Value {
    if value.is_object() { value } else { json!({ "value": value }) }
}

// ---------------------------------------------------------------------------
// Error object / failure
// ---------------------------------------------------------------------------

/// The `error` member of a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A typed HolonRPC failure.
///
/// Handlers raise it to surface `code/message/data` verbatim across the
/// wire; invokers observe it as the error side of `invoke`.  Any other
/// handler error is translated to a generic internal failure at the
/// endpoint boundary, so implementation details never leak.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct Failure {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl Failure {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Failure { code, message: message.into(), data: None }
    }

    pub fn with_data(code: i64, message: impl Into<String>, data: Value) -> Self {
        Failure { code, message: message.into(), data: Some(data) }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Failure::new(codes::INVALID_REQUEST, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Failure::new(codes::INVALID_PARAMS, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Failure::new(codes::METHOD_NOT_FOUND, format!("method \"{method}\" not found"))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Failure::new(codes::NOT_FOUND, message)
    }

    pub fn deadline_exceeded() -> Self {
        Failure::new(codes::DEADLINE_EXCEEDED, "deadline exceeded")
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Failure::new(codes::UNAVAILABLE, message)
    }
}

impl From<ErrorObject> for Failure {
    fn from(e: ErrorObject) -> Self {
        Failure { code: e.code, message: e.message, data: e.data }
    }
}

impl From<Failure> for ErrorObject {
    fn from(f: Failure) -> Self {
        ErrorObject { code: f.code, message: f.message, data: f.data }
    }
}

// ---------------------------------------------------------------------------
// Frame codec
// ---------------------------------------------------------------------------

/// Why an inbound frame could not be decoded into an envelope.
///
/// The distinction matters on the wire: malformed JSON answers `-32700`,
/// structurally wrong JSON answers `-32600`, both with a null id.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("parse error: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("binary frame is not valid UTF-8")]
    Utf8(#[source] std::str::Utf8Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("invalid envelope: {0}")]
    BadEnvelope(#[source] serde_json::Error),
}

impl DecodeError {
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            DecodeError::Parse(_) | DecodeError::Utf8(_) => ErrorObject {
                code: codes::PARSE_ERROR,
                message: "parse error".to_owned(),
                data: None,
            },
            DecodeError::NotAnObject | DecodeError::BadEnvelope(_) => ErrorObject {
                code: codes::INVALID_REQUEST,
                message: "invalid request".to_owned(),
                data: None,
            },
        }
    }
}

/// Decode one text frame into an envelope.
pub fn decode_text(text: &str) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(DecodeError::Parse)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    serde_json::from_value(value).map_err(DecodeError::BadEnvelope)
}

/// Decode one binary frame: UTF-8 text carrying a JSON envelope.
pub fn decode_binary(data: &[u8]) -> Result<Envelope, DecodeError> {
    let text = std::str::from_utf8(data).map_err(DecodeError::Utf8)?;
    decode_text(text)
}

/// Encode an envelope as one text frame.
pub fn encode(envelope: &Envelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

/// Decode the `params` member: absent and null are equivalent to `{}`;
/// anything that is not an object is rejected.
pub fn decode_params(params: Option<Value>) -> Result<Map<String, Value>, Failure> {
    match params {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(Failure::invalid_params("invalid params")),
    }
}
