//! # Session Events
//!
//! A [`crate::session::Session`] is driven by method calls and reports
//! everything that happens back through an [`EventSink`]. The sink is the
//! single seam between the core and whatever frontend hosts it: a UI can
//! forward events to its render loop, a test can collect them in a channel.
//!
//! Events fall into three groups:
//!
//! * **Lifecycle**: connection progress and state transitions.
//! * **Schema**: the service list and per-method input views, together with
//!   any payload/header seeds restored from the store.
//! * **Per-call**: [`ProtocolEvent`]s mirroring the wire exchange of a single
//!   RPC, bracketed by [`SessionEvent::RpcStarted`] and
//!   [`SessionEvent::RpcEnded`].
//!
//! All payloads are serializable so hosts can ship them to a frontend as JSON
//! without further mapping.
use crate::connection::ConnectivityState;
use crate::view::MessageView;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Receiver side of the session's event flow.
///
/// Implementations must be cheap and non-blocking; events are emitted from
/// async tasks and a slow sink would stall in-flight calls.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

/// An unbounded channel sender works directly as a sink. Dropped receivers
/// are ignored, so a host shutting down mid-call is not an error.
impl EventSink for tokio::sync::mpsc::UnboundedSender<SessionEvent> {
    fn emit(&self, event: SessionEvent) {
        let _ = self.send(event);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A dial attempt has begun.
    ConnectStarted { address: String },
    /// The transport is established and the schema has been resolved.
    Connected { address: String },
    /// The connection moved to a new state.
    StateChanged { state: ConnectivityState },
    /// The resolved schema changed; carries the full service listing and,
    /// when the store remembers one, the previously selected method.
    ServicesChanged {
        services: Vec<ServiceSelect>,
        selected: Option<MethodSeed>,
    },
    /// A method was selected; carries the input form and any seeds the store
    /// remembers for it.
    MethodInputChanged {
        method: MethodSeed,
        view: MessageView,
        payload_seed: Option<String>,
        header_seed: Vec<(String, String)>,
    },
    /// An RPC was admitted and is now in flight.
    RpcStarted {
        client_streaming: bool,
        server_streaming: bool,
    },
    /// The in-flight RPC finished, failed or was cancelled.
    RpcEnded(RpcEnd),
    /// Wire-level detail of the in-flight RPC.
    Protocol(ProtocolEvent),
    /// Something went wrong outside the RPC status model.
    Error { title: String, message: String },
}

/// One entry in the service listing.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSelect {
    /// Fully qualified service name (e.g. `echo.EchoService`).
    pub name: String,
    pub methods: Vec<MethodSelect>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodSelect {
    pub name: String,
    /// gRPC path of the method (e.g. `/echo.EchoService/UnaryEcho`).
    pub full_name: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

/// A (service, method) pair, used both for selections and store seeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSeed {
    pub service: String,
    pub method: String,
}

/// Mirrors the wire exchange of a single RPC, in the order it happens.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ProtocolEvent {
    Begin,
    OutHeaders { headers: Vec<(String, String)> },
    OutPayload { rendered: String },
    InHeaders { headers: Vec<(String, String)> },
    InPayload { rendered: String },
    InTrailers { trailers: Vec<(String, String)> },
    End { status: String, duration: Duration },
}

/// Terminal summary of an RPC.
#[derive(Debug, Clone, Serialize)]
pub struct RpcEnd {
    /// Numeric gRPC status code.
    pub code: i32,
    /// Human readable status name (e.g. `Ok`, `Cancelled`).
    pub status: String,
    pub duration: Duration,
}
