//! # Echo Service
//!
//! **INTERNAL USE ONLY**: This crate exists solely to provide gRPC server
//! implementations and a descriptor set for integration testing `sonda-core`.
//! It is not intended for production use.

use std::pin::Pin;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};

pub mod pb {
    include!(concat!(env!("OUT_DIR"), "/echo.rs"));
}

pub use pb::echo_service_server::{EchoService, EchoServiceServer};
pub use pb::sidecar_service_server::{SidecarService, SidecarServiceServer};
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("descriptors");

use pb::{EchoRequest, EchoResponse, Payload};

type EchoStream = Pin<Box<dyn Stream<Item = Result<EchoResponse, Status>> + Send>>;

/// Echoes requests back over all four call shapes.
///
/// `ServerStreamingEcho` replies three times, or not at all when the request
/// message is empty, so tests can exercise zero-message streams.
pub struct EchoServiceImpl;

#[tonic::async_trait]
impl EchoService for EchoServiceImpl {
    type ServerStreamingEchoStream = EchoStream;
    type BidirectionalEchoStream = EchoStream;

    async fn unary_echo(
        &self,
        request: Request<EchoRequest>,
    ) -> Result<Response<EchoResponse>, Status> {
        let message = request.into_inner().message;
        Ok(Response::new(EchoResponse { message }))
    }

    async fn server_streaming_echo(
        &self,
        request: Request<EchoRequest>,
    ) -> Result<Response<Self::ServerStreamingEchoStream>, Status> {
        let message = request.into_inner().message;
        let replies: Vec<Result<EchoResponse, Status>> = if message.is_empty() {
            Vec::new()
        } else {
            (0..3)
                .map(|_| {
                    Ok(EchoResponse {
                        message: message.clone(),
                    })
                })
                .collect()
        };
        Ok(Response::new(Box::pin(tokio_stream::iter(replies))))
    }

    async fn client_streaming_echo(
        &self,
        request: Request<Streaming<EchoRequest>>,
    ) -> Result<Response<EchoResponse>, Status> {
        let mut stream = request.into_inner();
        let mut message = String::new();
        while let Some(req) = stream.message().await? {
            message.push_str(&req.message);
        }
        Ok(Response::new(EchoResponse { message }))
    }

    async fn bidirectional_echo(
        &self,
        request: Request<Streaming<EchoRequest>>,
    ) -> Result<Response<Self::BidirectionalEchoStream>, Status> {
        let stream = request.into_inner().map(|req| {
            req.map(|req| EchoResponse {
                message: format!("echo: {}", req.message),
            })
        });
        Ok(Response::new(Box::pin(stream)))
    }

    async fn inspect(&self, request: Request<Payload>) -> Result<Response<Payload>, Status> {
        Ok(Response::new(request.into_inner()))
    }
}

/// Minimal second service so reflection tests cover multi-service listings
/// and shared-dependency deduplication.
pub struct SidecarServiceImpl;

#[tonic::async_trait]
impl SidecarService for SidecarServiceImpl {
    async fn check(&self, request: Request<EchoRequest>) -> Result<Response<EchoResponse>, Status> {
        let message = request.into_inner().message;
        Ok(Response::new(EchoResponse { message }))
    }
}
