//! # Generic gRPC Client
//!
//! Wraps `tonic::client::Grpc` behind an interface that takes a
//! `MethodDescriptor` plus JSON data and performs the call, one method per
//! streaming shape. The HTTP/2 path is built from the descriptor at runtime
//! and headers are converted into tonic metadata.
//!
//! Calls return the full `tonic::Response` rather than the inner payload so
//! callers can observe response metadata and, for streams, trailers.
use super::codec::JsonCodec;
use crate::BoxError;
use futures_util::Stream;
use http_body::Body as HttpBody;
use prost_reflect::MethodDescriptor;
use std::str::FromStr;
use tonic::{
    client::GrpcService,
    metadata::{
        MetadataKey, MetadataValue,
        errors::{InvalidMetadataKey, InvalidMetadataValue},
    },
    transport::Channel,
};

#[derive(thiserror::Error, Debug)]
pub enum GrpcRequestError {
    #[error("Internal error, the client was not ready: '{0}'")]
    ClientNotReady(#[source] BoxError),
    #[error("Invalid metadata (header) key '{key}': '{source}'")]
    InvalidMetadataKey {
        key: String,
        source: InvalidMetadataKey,
    },
    #[error("Invalid metadata (header) value for key '{key}': '{source}'")]
    InvalidMetadataValue {
        key: String,
        source: InvalidMetadataValue,
    },
}

/// A gRPC client that is agnostic to the messages being exchanged.
pub struct GrpcClient<S = Channel> {
    client: tonic::client::Grpc<S>,
}

impl<S> GrpcClient<S>
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub fn new(service: S) -> Self {
        let client = tonic::client::Grpc::new(service);
        Self { client }
    }

    /// Performs a Unary gRPC call (Single Request -> Single Response).
    ///
    /// # Returns
    /// * `Ok(Ok(Response))` - Successful RPC execution.
    /// * `Ok(Err(Status))` - RPC executed, but server returned an error.
    /// * `Err(GrpcRequestError)` - Failed to send request or connect.
    pub async fn unary(
        &mut self,
        method: MethodDescriptor,
        payload: serde_json::Value,
        headers: Vec<(String, String)>,
    ) -> Result<Result<tonic::Response<serde_json::Value>, tonic::Status>, GrpcRequestError> {
        self.client
            .ready()
            .await
            .map_err(|e| GrpcRequestError::ClientNotReady(e.into()))?;

        let codec = JsonCodec::new(method.input(), method.output());
        let path = http_path(&method);
        let request = build_request(payload, headers)?;

        Ok(self.client.unary(request, path, codec).await)
    }

    /// Performs a Server Streaming gRPC call (Single Request -> Stream of Responses).
    pub async fn server_streaming(
        &mut self,
        method: MethodDescriptor,
        payload: serde_json::Value,
        headers: Vec<(String, String)>,
    ) -> Result<
        Result<tonic::Response<tonic::Streaming<serde_json::Value>>, tonic::Status>,
        GrpcRequestError,
    > {
        self.client
            .ready()
            .await
            .map_err(|e| GrpcRequestError::ClientNotReady(e.into()))?;

        let codec = JsonCodec::new(method.input(), method.output());
        let path = http_path(&method);
        let request = build_request(payload, headers)?;

        Ok(self.client.server_streaming(request, path, codec).await)
    }

    /// Performs a Client Streaming gRPC call (Stream of Requests -> Single Response).
    pub async fn client_streaming(
        &mut self,
        method: MethodDescriptor,
        payload_stream: impl Stream<Item = serde_json::Value> + Send + 'static,
        headers: Vec<(String, String)>,
    ) -> Result<Result<tonic::Response<serde_json::Value>, tonic::Status>, GrpcRequestError> {
        self.client
            .ready()
            .await
            .map_err(|e| GrpcRequestError::ClientNotReady(e.into()))?;

        let codec = JsonCodec::new(method.input(), method.output());
        let path = http_path(&method);
        let request = build_request(payload_stream, headers)?;

        Ok(self.client.client_streaming(request, path, codec).await)
    }

    /// Performs a Bidirectional Streaming gRPC call (Stream of Requests -> Stream of Responses).
    pub async fn bidirectional_streaming(
        &mut self,
        method: MethodDescriptor,
        payload_stream: impl Stream<Item = serde_json::Value> + Send + 'static,
        headers: Vec<(String, String)>,
    ) -> Result<
        Result<tonic::Response<tonic::Streaming<serde_json::Value>>, tonic::Status>,
        GrpcRequestError,
    > {
        self.client
            .ready()
            .await
            .map_err(|e| GrpcRequestError::ClientNotReady(e.into()))?;

        let codec = JsonCodec::new(method.input(), method.output());
        let path = http_path(&method);
        let request = build_request(payload_stream, headers)?;

        Ok(self.client.streaming(request, path, codec).await)
    }
}

fn http_path(method: &MethodDescriptor) -> http::uri::PathAndQuery {
    let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
    http::uri::PathAndQuery::from_str(&path).expect("valid gRPC path")
}

fn build_request<T>(
    payload: T,
    headers: Vec<(String, String)>,
) -> Result<tonic::Request<T>, GrpcRequestError> {
    let mut request = tonic::Request::new(payload);
    for (k, v) in headers {
        // Frontends commonly send empty rows from the headers form.
        if k.is_empty() {
            continue;
        }
        let key =
            MetadataKey::from_str(&k).map_err(|source| GrpcRequestError::InvalidMetadataKey {
                key: k.clone(),
                source,
            })?;
        let val = MetadataValue::from_str(&v)
            .map_err(|source| GrpcRequestError::InvalidMetadataValue { key: k, source })?;
        request.metadata_mut().insert(key, val);
    }
    Ok(request)
}
