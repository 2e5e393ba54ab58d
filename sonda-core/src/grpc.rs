//! # Dynamic gRPC Transport
//!
//! The schema-agnostic wire layer: a [`client::GrpcClient`] that can call any
//! method given only its descriptor, and the [`codec::JsonCodec`] that
//! transcodes `serde_json::Value` payloads to protobuf bytes on the fly.
pub mod client;
pub mod codec;
