//! Holon-RPC: a bidirectional JSON-RPC 2.0 message bus over WebSocket.
//!
//! One broker process routes calls between peer clients addressed by holon
//! name, with fan-out (`*.<method>`) and broadcast side channels.  This
//! facade re-exports the workspace crates:
//!
//! - [`protocol`] — envelope types, error codes, frame codec.
//! - [`endpoint`] — the symmetric per-connection state machine.
//! - [`client`] — the reconnecting peer client.
//! - [`broker`] — the broker service (router, registry, dispatcher).

pub use broker;
pub use holon_client as client;
pub use holon_endpoint as endpoint;
pub use holon_protocol as protocol;
