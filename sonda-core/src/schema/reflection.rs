//! # Reflection Resolver
//!
//! Resolves a server's full schema through `grpc.reflection.v1` in one
//! bidirectional stream: list the exposed services, ask for the file
//! containing each service symbol, then recursively fetch any imports the
//! returned files mention until the dependency graph is closed.
//!
//! Servers commonly answer different symbols with overlapping file sets, so
//! collected files are keyed by name and each dependency is requested at most
//! once.
//!
//! ## References
//!
//! * [gRPC Server Reflection Protocol](https://github.com/grpc/grpc/blob/master/doc/server-reflection.md)
use crate::BoxError;
use http_body::Body as HttpBody;
use prost::Message;
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::client::GrpcService;
use tonic::metadata::errors::{InvalidMetadataKey, InvalidMetadataValue};
use tonic::metadata::{MetadataKey, MetadataMap, MetadataValue};
use tonic::transport::Channel;
use tonic::Streaming;
use tonic_reflection::pb::v1::server_reflection_client::ServerReflectionClient;
use tonic_reflection::pb::v1::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1::{ServerReflectionRequest, ServerReflectionResponse};

#[derive(Debug, thiserror::Error)]
pub enum ReflectionResolveError {
    #[error(
        "Failed to start a stream request with the reflection server, reflection might not be supported: '{0}'"
    )]
    ServerStreamInitFailed(#[source] tonic::Status),

    #[error("The server stream returned an error status: '{0}'")]
    ServerStreamFailure(#[source] tonic::Status),

    #[error("Reflection stream closed unexpectedly")]
    StreamClosed,

    #[error("Internal error: Failed to send request to stream")]
    SendFailed,

    #[error("Server returned reflection error code {code}: {message}")]
    ServerError { code: i32, message: String },

    #[error("Protocol error: Received unexpected response type: {0}")]
    UnexpectedResponseType(String),

    #[error("Failed to decode FileDescriptorProto: {0}")]
    DecodeError(#[from] prost::DecodeError),

    #[error("Invalid reflection header key '{key}': '{source}'")]
    InvalidHeaderKey {
        key: String,
        source: InvalidMetadataKey,
    },

    #[error("Invalid reflection header value for key '{key}': '{source}'")]
    InvalidHeaderValue {
        key: String,
        source: InvalidMetadataValue,
    },
}

// The host field of reflection requests is undocumented and servers ignore
// it, so it is not surfaced to callers.
const EMPTY_HOST: &str = "";

/// A client for the gRPC Server Reflection Protocol that resolves the whole
/// schema a server exposes.
pub struct ReflectionResolver<S = Channel> {
    client: ServerReflectionClient<S>,
}

impl<S> ReflectionResolver<S>
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub fn new(service: S) -> Self {
        let client = ServerReflectionClient::new(service);
        Self { client }
    }

    /// Resolves every service the server lists into one `FileDescriptorSet`.
    ///
    /// `headers` are attached to the reflection stream itself, for servers
    /// that gate reflection behind authentication. Pairs with an empty key
    /// are skipped.
    pub async fn resolve(
        &mut self,
        headers: &[(String, String)],
    ) -> Result<FileDescriptorSet, ReflectionResolveError> {
        let (tx, rx) = mpsc::channel(64);

        let mut request = tonic::Request::new(ReceiverStream::new(rx));
        apply_headers(request.metadata_mut(), headers)?;

        let mut response_stream = self
            .client
            .server_reflection_info(request)
            .await
            .map_err(ReflectionResolveError::ServerStreamInitFailed)?
            .into_inner();

        tx.send(ServerReflectionRequest {
            host: EMPTY_HOST.to_string(),
            message_request: Some(MessageRequest::ListServices(String::new())),
        })
        .await
        .map_err(|_| ReflectionResolveError::SendFailed)?;

        let services = read_service_list(&mut response_stream).await?;
        tracing::debug!(services = services.len(), "listed services via reflection");

        let mut inflight = 0;
        for service in &services {
            tx.send(ServerReflectionRequest {
                host: EMPTY_HOST.to_string(),
                message_request: Some(MessageRequest::FileContainingSymbol(service.clone())),
            })
            .await
            .map_err(|_| ReflectionResolveError::SendFailed)?;
            inflight += 1;
        }

        let file_map = collect_descriptors(&mut response_stream, tx, inflight).await?;
        tracing::debug!(files = file_map.len(), "collected file descriptors");

        Ok(FileDescriptorSet {
            file: file_map.into_values().collect(),
        })
    }
}

fn apply_headers(
    metadata: &mut MetadataMap,
    headers: &[(String, String)],
) -> Result<(), ReflectionResolveError> {
    for (k, v) in headers {
        if k.is_empty() {
            continue;
        }
        let key = MetadataKey::from_str(k).map_err(|source| {
            ReflectionResolveError::InvalidHeaderKey {
                key: k.clone(),
                source,
            }
        })?;
        let val = MetadataValue::from_str(v).map_err(|source| {
            ReflectionResolveError::InvalidHeaderValue {
                key: k.clone(),
                source,
            }
        })?;
        metadata.insert(key, val);
    }
    Ok(())
}

async fn read_service_list(
    response_stream: &mut Streaming<ServerReflectionResponse>,
) -> Result<Vec<String>, ReflectionResolveError> {
    let response = next_response(response_stream).await?;

    match response.message_response {
        Some(MessageResponse::ListServicesResponse(resp)) => {
            Ok(resp.service.into_iter().map(|s| s.name).collect())
        }
        Some(MessageResponse::ErrorResponse(e)) => Err(ReflectionResolveError::ServerError {
            code: e.error_code,
            message: e.error_message,
        }),
        Some(other) => Err(ReflectionResolveError::UnexpectedResponseType(format!(
            "{other:?}",
        ))),
        None => Err(ReflectionResolveError::UnexpectedResponseType(
            "Empty Message".into(),
        )),
    }
}

async fn next_response(
    response_stream: &mut Streaming<ServerReflectionResponse>,
) -> Result<ServerReflectionResponse, ReflectionResolveError> {
    response_stream
        .message()
        .await
        .map_err(ReflectionResolveError::ServerStreamFailure)?
        .ok_or(ReflectionResolveError::StreamClosed)
}

async fn collect_descriptors(
    response_stream: &mut Streaming<ServerReflectionResponse>,
    request_channel: mpsc::Sender<ServerReflectionRequest>,
    mut inflight: usize,
) -> Result<HashMap<String, FileDescriptorProto>, ReflectionResolveError> {
    let mut collected_files = HashMap::new();
    let mut requested = HashSet::new();

    while inflight > 0 {
        let response = next_response(response_stream).await?;
        inflight -= 1;

        match response.message_response {
            Some(MessageResponse::FileDescriptorResponse(res)) => {
                let sent_count = process_descriptor_batch(
                    res.file_descriptor_proto,
                    &mut collected_files,
                    &mut requested,
                    &request_channel,
                )
                .await?;

                inflight += sent_count;
            }
            Some(MessageResponse::ErrorResponse(e)) => {
                return Err(ReflectionResolveError::ServerError {
                    message: e.error_message,
                    code: e.error_code,
                });
            }
            Some(other) => {
                return Err(ReflectionResolveError::UnexpectedResponseType(format!(
                    "{other:?}",
                )));
            }
            None => {
                return Err(ReflectionResolveError::UnexpectedResponseType(
                    "Empty Message".into(),
                ));
            }
        }
    }

    Ok(collected_files)
}

async fn process_descriptor_batch(
    raw_protos: Vec<Vec<u8>>,
    collected_files: &mut HashMap<String, FileDescriptorProto>,
    requested: &mut HashSet<String>,
    tx: &mpsc::Sender<ServerReflectionRequest>,
) -> Result<usize, ReflectionResolveError> {
    let mut sent_count = 0;

    for raw in raw_protos {
        let fd = FileDescriptorProto::decode(raw.as_ref())?;

        if let Some(name) = &fd.name
            && !collected_files.contains_key(name)
        {
            sent_count += queue_dependencies(&fd, collected_files, requested, tx).await?;

            collected_files.insert(name.clone(), fd);
        }
    }

    Ok(sent_count)
}

async fn queue_dependencies(
    fd: &FileDescriptorProto,
    collected_files: &HashMap<String, FileDescriptorProto>,
    requested: &mut HashSet<String>,
    tx: &mpsc::Sender<ServerReflectionRequest>,
) -> Result<usize, ReflectionResolveError> {
    let mut count = 0;

    for dep in &fd.dependency {
        if !collected_files.contains_key(dep) && requested.insert(dep.clone()) {
            let req = ServerReflectionRequest {
                host: EMPTY_HOST.to_string(),
                message_request: Some(MessageRequest::FileByFilename(dep.clone())),
            };

            tx.send(req)
                .await
                .map_err(|_| ReflectionResolveError::SendFailed)?;
            count += 1;
        }
    }

    Ok(count)
}
