#![allow(dead_code)]
//! Shared wiring for the integration tests: an in-process gRPC router with
//! the echo services plus reflection, and helpers to collect session events.
use echo_service::{
    EchoServiceImpl, EchoServiceServer, FILE_DESCRIPTOR_SET, SidecarServiceImpl,
    SidecarServiceServer,
};
use sonda_core::events::SessionEvent;
use sonda_core::session::Session;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tonic::service::Routes;

pub fn routes() -> Routes {
    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()
        .unwrap();

    Routes::new(reflection)
        .add_service(EchoServiceServer::new(EchoServiceImpl))
        .add_service(SidecarServiceServer::new(SidecarServiceImpl))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn session() -> (Session<Routes>, UnboundedReceiver<SessionEvent>) {
    init_tracing();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let session = Session::from_service(routes(), Arc::new(tx));
    (session, rx)
}

/// A session with the schema already resolved and its setup events drained.
pub async fn connected_session() -> (Session<Routes>, UnboundedReceiver<SessionEvent>) {
    let (mut session, mut rx) = session();
    session.load_schema().await.unwrap();
    drain(&mut rx);
    (session, rx)
}

/// Collects everything already sitting in the event channel.
pub fn drain(rx: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Collects events until the next `RpcEnded`, inclusive.
pub async fn collect_until_rpc_end(rx: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for the call to end")
            .expect("event channel closed");
        let done = matches!(event, SessionEvent::RpcEnded(_));
        events.push(event);
        if done {
            return events;
        }
    }
}
