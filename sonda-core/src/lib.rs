//! # Sonda Core
//!
//! `sonda-core` is the engine of a dynamic gRPC workbench: it talks to any
//! gRPC server without compile-time knowledge of the Protobuf schema, and
//! reports everything it does as serializable events a frontend can render.
//!
//! ## Key Components
//!
//! * **[`session::Session`]:** The main entry point. It owns the connection,
//!   the resolved schema and the single in-flight call, and emits
//!   [`events::SessionEvent`]s through an [`events::EventSink`].
//! * **[`schema`]:** Schema resolution from server reflection
//!   (`grpc.reflection.v1`) or from local proto files compiled with `protoc`.
//! * **[`view`]:** Conversion of message descriptors into renderable input
//!   forms, with cycle detection.
//! * **[`connection`]:** Endpoint construction, TLS, dial timeouts and the
//!   connectivity state machine.
//! * **[`store`]:** Optional persistence of options and per-method request
//!   seeds.
//!
//! ## Internal clients
//!
//! The lower-level pieces are public as well, for hosts that need to bypass
//! the session orchestration:
//!
//! * **[`grpc::client::GrpcClient`]:** A dynamic gRPC client over a custom
//!   JSON codec, one method per streaming shape.
//! * **[`schema::reflection::ReflectionResolver`]:** A reflection client that
//!   resolves a server's complete schema over one stream.
//!
//! ## Re-exports
//!
//! This crate re-exports `prost`, `prost-reflect` and `tonic` to ensure that
//! consumers use compatible versions of these underlying dependencies.
pub mod connection;
pub mod events;
pub mod grpc;
pub mod observer;
pub mod options;
pub mod schema;
pub mod session;
pub mod store;
pub mod view;

// Re-exports
pub use prost;
pub use prost_reflect;
pub use tonic;

/// Type alias for the standard boxed error used in generic bounds.
type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
