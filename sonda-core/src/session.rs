//! # Session
//!
//! The orchestration layer tying everything together: a [`Session`] owns the
//! connection, the resolved schema and the single in-flight call, and turns
//! frontend intents (connect, select, invoke, cancel) into events on its
//! [`EventSink`].
//!
//! ## Invocation model
//!
//! At most one RPC is in flight per session. [`Session::invoke`] validates
//! the payload, admits the call and spawns a driver task that performs the
//! exchange and reports it through a [`CallObserver`]; the method itself
//! returns as soon as the call is admitted. While a client-streaming call is
//! open, further invocations of a client-streaming method feed the open
//! stream instead of starting a new call; [`Session::close_send`] half-closes
//! it and [`Session::cancel`] drops the call outright.
//!
//! The generic parameter `S` is the transport. Real sessions run over a
//! `tonic` [`Channel`]; tests inject an in-process service instead.
use crate::BoxError;
use crate::connection::{ConnectError, ConnectionManager, ConnectivityState};
use crate::events::{EventSink, MethodSeed, MethodSelect, RpcEnd, ServiceSelect, SessionEvent};
use crate::grpc::client::{GrpcClient, GrpcRequestError};
use crate::observer::CallObserver;
use crate::options::ConnectionOptions;
use crate::schema::reflection::ReflectionResolver;
use crate::schema::{self, DescriptorRegistry, SchemaError};
use crate::store::{self, Store};
use crate::view;
use http_body::Body as HttpBody;
use prost_reflect::{DeserializeOptions, DynamicMessage, MethodDescriptor};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::client::GrpcService;
use tonic::transport::Channel;
use tonic::{Code, Status};

/// Buffer for messages fed into an open client stream.
const STREAM_BUFFER: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("not connected to a server")]
    NotConnected,

    #[error("no schema has been loaded")]
    SchemaNotLoaded,

    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    #[error("another call is already in flight")]
    CallInFlight,

    #[error("request payload does not match the method input: '{0}'")]
    InvalidPayload(#[source] serde_json::Error),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    View(#[from] view::ViewError),
}

#[derive(Default)]
struct CallState {
    in_flight: Option<InFlight>,
    /// Monotonic call counter; a driver task only clears the slot if it still
    /// belongs to its own call.
    generation: u64,
}

struct InFlight {
    generation: u64,
    method_path: String,
    client_streaming: bool,
    /// Feeder for an open client stream; `None` once half-closed.
    stream_tx: Option<mpsc::Sender<serde_json::Value>>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

enum Admission {
    /// Feed the payload into the already-open client stream.
    Continue(mpsc::Sender<serde_json::Value>),
    /// Start a new call.
    Start {
        generation: u64,
        cancel_rx: oneshot::Receiver<()>,
        feeder: Option<mpsc::Receiver<serde_json::Value>>,
    },
}

enum Outbound {
    Single(serde_json::Value),
    Stream(ReceiverStream<serde_json::Value>),
}

/// A dynamic gRPC workbench session over transport `S`.
pub struct Session<S = Channel> {
    sink: Arc<dyn EventSink>,
    store: Option<Arc<dyn Store>>,
    options: ConnectionOptions,
    manager: ConnectionManager,
    service: Option<S>,
    state_tx: Option<watch::Sender<ConnectivityState>>,
    registry: Option<DescriptorRegistry>,
    call: Arc<Mutex<CallState>>,
}

impl<S> Session<S>
where
    S: GrpcService<tonic::body::Body> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
    S::Future: Send,
{
    /// Builds a session over an already-constructed transport, bypassing the
    /// connection manager. Intended for in-process services in tests.
    pub fn from_service(service: S, sink: Arc<dyn EventSink>) -> Self {
        Self {
            manager: ConnectionManager::new(sink.clone()),
            sink,
            store: None,
            options: ConnectionOptions::default(),
            service: Some(service),
            state_tx: None,
            registry: None,
            call: Arc::new(Mutex::new(CallState::default())),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn registry(&self) -> Option<&DescriptorRegistry> {
        self.registry.as_ref()
    }

    /// Resolves the schema and publishes the service listing.
    ///
    /// Local proto files take precedence when configured; otherwise the
    /// server is asked via reflection. When reflection is disabled and no
    /// files are configured, the load is skipped and the registry stays
    /// unset.
    pub async fn load_schema(&mut self) -> Result<(), SessionError> {
        // Resolution is all-or-nothing; a failed load must not leave a stale
        // registry from a previous server behind.
        self.registry = None;

        let set = if !self.options.proto_files.is_empty() {
            schema::disk::compile(&self.options.proto_files, &self.options.import_paths)
                .await
                .map_err(SchemaError::from)?
        } else if self.options.reflection {
            let service = self.service.clone().ok_or(SessionError::NotConnected)?;
            ReflectionResolver::new(service)
                .resolve(&self.options.reflection_metadata)
                .await
                .map_err(SchemaError::from)?
        } else {
            tracing::warn!("reflection is disabled and no proto files are configured; skipping the schema load");
            return Ok(());
        };

        let registry = DescriptorRegistry::from_file_descriptor_set(set)?;
        let services = service_listing(&registry);
        let selected = self.restore_selection();
        self.registry = Some(registry);

        self.sink
            .emit(SessionEvent::ServicesChanged { services, selected });
        Ok(())
    }

    /// Marks a method as selected: publishes its input form together with the
    /// payload and headers last used for it, and remembers the selection.
    pub fn select_method(&mut self, service: &str, method: &str) -> Result<(), SessionError> {
        self.try_select_method(service, method).inspect_err(|error| {
            self.sink.emit(SessionEvent::Error {
                title: "Unable to select the method".to_string(),
                message: error.to_string(),
            });
        })
    }

    fn try_select_method(&mut self, service: &str, method: &str) -> Result<(), SessionError> {
        let registry = self.registry.as_ref().ok_or(SessionError::SchemaNotLoaded)?;
        let path = format!("/{service}/{method}");
        let descriptor = registry
            .find_method(&path)
            .ok_or_else(|| SessionError::UnknownMethod(path.clone()))?;

        let view = view::message_view(&descriptor.input())?;
        let seed = MethodSeed {
            service: service.to_string(),
            method: method.to_string(),
        };

        let payload_seed =
            self.stored_string(&store::message_key(&self.options.address, &path));
        let header_seed = self
            .stored_json::<Vec<(String, String)>>(&store::metadata_key(
                &self.options.address,
                &path,
            ))
            .unwrap_or_default();

        self.persist(
            &store::selection_key(&self.options.address),
            serde_json::to_vec(&seed),
        );

        self.sink.emit(SessionEvent::MethodInputChanged {
            method: seed,
            view,
            payload_seed,
            header_seed,
        });
        Ok(())
    }

    /// Admits and launches an RPC, or feeds an open client stream.
    ///
    /// Returns as soon as the call is admitted; progress and the outcome
    /// arrive as events. An empty `payload_json` stands for an empty message.
    pub async fn invoke(
        &mut self,
        method_path: &str,
        payload_json: &str,
        headers: Vec<(String, String)>,
    ) -> Result<(), SessionError> {
        match self.try_invoke(method_path, payload_json, headers).await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.sink.emit(SessionEvent::Error {
                    title: "Unable to send the request".to_string(),
                    message: error.to_string(),
                });
                Err(error)
            }
        }
    }

    async fn try_invoke(
        &mut self,
        method_path: &str,
        payload_json: &str,
        headers: Vec<(String, String)>,
    ) -> Result<(), SessionError> {
        let service = self.service.clone().ok_or(SessionError::NotConnected)?;
        let registry = self.registry.as_ref().ok_or(SessionError::SchemaNotLoaded)?;
        let method = registry
            .find_method(method_path)
            .ok_or_else(|| SessionError::UnknownMethod(method_path.to_string()))?;

        let payload_json = if payload_json.trim().is_empty() {
            "{}"
        } else {
            payload_json
        };
        let payload: serde_json::Value =
            serde_json::from_str(payload_json).map_err(SessionError::InvalidPayload)?;

        // Validate up front so a malformed payload never occupies the
        // in-flight slot or reaches the wire.
        DynamicMessage::deserialize_with_options(
            method.input(),
            payload.clone(),
            &DeserializeOptions::new().deny_unknown_fields(false),
        )
        .map_err(SessionError::InvalidPayload)?;

        let client_streaming = method.is_client_streaming();
        let server_streaming = method.is_server_streaming();

        self.persist(
            &store::message_key(&self.options.address, method_path),
            Ok(payload_json.as_bytes().to_vec()),
        );
        self.persist(
            &store::metadata_key(&self.options.address, method_path),
            serde_json::to_vec(&headers),
        );

        // Two attempts: the first can race a client stream that finished but
        // whose driver task has not cleared the slot yet.
        for _ in 0..2 {
            match self.admit(method_path, client_streaming, &payload)? {
                Admission::Continue(tx) => {
                    if tx.send(payload.clone()).await.is_ok() {
                        return Ok(());
                    }
                }
                Admission::Start {
                    generation,
                    cancel_rx,
                    feeder,
                } => {
                    self.sink.emit(SessionEvent::RpcStarted {
                        client_streaming,
                        server_streaming,
                    });

                    let observer = CallObserver::new(self.sink.clone());
                    observer.begin();

                    let outbound = match feeder {
                        Some(rx) => Outbound::Stream(ReceiverStream::new(rx)),
                        None => Outbound::Single(payload.clone()),
                    };

                    let call = self.call.clone();
                    let sink = self.sink.clone();
                    let state_tx = self.state_tx.clone();
                    let headers = headers.clone();

                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel_rx => {
                                tracing::debug!("in-flight call dropped after cancellation");
                            }
                            _ = drive_call(service, method, outbound, headers, observer, sink, state_tx) => {}
                        }

                        let mut call = lock(&call);
                        if call.in_flight.as_ref().map(|f| f.generation) == Some(generation) {
                            call.in_flight = None;
                        }
                    });

                    return Ok(());
                }
            }
        }

        Err(SessionError::CallInFlight)
    }

    /// Cancels the in-flight call, if any. Safe to call repeatedly; only the
    /// first cancellation of a call emits an end event.
    pub fn cancel(&self) {
        let taken = lock(&self.call).in_flight.take();
        let Some(mut in_flight) = taken else {
            tracing::debug!("cancel requested with no call in flight");
            return;
        };

        if let Some(cancel_tx) = in_flight.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }

        self.sink.emit(SessionEvent::RpcEnded(RpcEnd {
            code: Code::Cancelled as i32,
            status: format!("{:?}", Code::Cancelled),
            duration: Duration::ZERO,
        }));
    }

    /// Half-closes the open client stream; the server's response then ends
    /// the call normally. No-op when nothing is streaming.
    pub fn close_send(&self) {
        let mut call = lock(&self.call);
        if let Some(in_flight) = &mut call.in_flight {
            // Dropping the feeder ends the outbound stream, which closes the
            // send side of the call.
            in_flight.stream_tx = None;
        }
    }

    fn admit(
        &self,
        method_path: &str,
        client_streaming: bool,
        payload: &serde_json::Value,
    ) -> Result<Admission, SessionError> {
        let mut call = lock(&self.call);

        // A finished client stream may not be cleared yet if its driver task
        // is still unwinding.
        if let Some(in_flight) = &call.in_flight
            && in_flight.stream_tx.as_ref().is_some_and(|tx| tx.is_closed())
        {
            call.in_flight = None;
        }

        match &call.in_flight {
            // Only the same method may feed the open stream; a different one
            // would be validated against the wrong input descriptor.
            Some(in_flight)
                if in_flight.client_streaming
                    && client_streaming
                    && in_flight.method_path == method_path =>
            {
                match &in_flight.stream_tx {
                    Some(tx) => Ok(Admission::Continue(tx.clone())),
                    // Already half-closed; nothing more may be written.
                    None => Err(SessionError::CallInFlight),
                }
            }
            Some(_) => Err(SessionError::CallInFlight),
            None => {
                call.generation += 1;
                let generation = call.generation;
                let (cancel_tx, cancel_rx) = oneshot::channel();

                let (stream_tx, feeder) = if client_streaming {
                    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
                    // Fresh channel, guaranteed room for the opening message.
                    let _ = tx.try_send(payload.clone());
                    (Some(tx), Some(rx))
                } else {
                    (None, None)
                };

                call.in_flight = Some(InFlight {
                    generation,
                    method_path: method_path.to_string(),
                    client_streaming,
                    stream_tx,
                    cancel_tx: Some(cancel_tx),
                });

                Ok(Admission::Start {
                    generation,
                    cancel_rx,
                    feeder,
                })
            }
        }
    }

    fn restore_selection(&self) -> Option<MethodSeed> {
        self.stored_json(&store::selection_key(&self.options.address))
    }

    fn restore_reflection_metadata(&mut self) {
        if !self.options.reflection_metadata.is_empty() {
            return;
        }
        let key = store::reflection_metadata_key(&self.options.address);
        if let Some(restored) = self.stored_json::<Vec<(String, String)>>(&key) {
            self.options.reflection_metadata = restored;
        }
    }

    fn stored_string(&self, key: &str) -> Option<String> {
        let store = self.store.as_ref()?;
        match store.get(key) {
            Ok(bytes) => bytes.and_then(|b| String::from_utf8(b).ok()),
            Err(error) => {
                tracing::warn!(key, %error, "failed to read from the store");
                None
            }
        }
    }

    fn stored_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let store = self.store.as_ref()?;
        match store.get(key) {
            Ok(bytes) => bytes.and_then(|b| serde_json::from_slice(&b).ok()),
            Err(error) => {
                tracing::warn!(key, %error, "failed to read from the store");
                None
            }
        }
    }

    // Persistence is best effort; a broken store must not break the call.
    fn persist(&self, key: &str, value: Result<Vec<u8>, serde_json::Error>) {
        let Some(store) = &self.store else {
            return;
        };
        match value {
            Ok(bytes) => {
                if let Err(error) = store.set(key, &bytes) {
                    tracing::warn!(key, %error, "failed to write to the store");
                }
            }
            Err(error) => {
                tracing::warn!(key, %error, "failed to serialize a value for the store");
            }
        }
    }
}

impl Session<Channel> {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            manager: ConnectionManager::new(sink.clone()),
            sink,
            store: None,
            options: ConnectionOptions::default(),
            service: None,
            state_tx: None,
            registry: None,
            call: Arc::new(Mutex::new(CallState::default())),
        }
    }

    /// Connects to a server and loads its schema, replacing any previous
    /// connection. Any in-flight call is cancelled first.
    pub async fn connect(&mut self, options: ConnectionOptions) -> Result<(), SessionError> {
        self.sink.emit(SessionEvent::ConnectStarted {
            address: options.address.clone(),
        });

        if lock(&self.call).in_flight.is_some() {
            self.cancel();
        }

        self.options = options;
        self.restore_reflection_metadata();

        let channel = match self.manager.connect(&self.options).await {
            Ok(channel) => channel,
            Err(error) => {
                self.sink.emit(SessionEvent::Error {
                    title: "Unable to connect".to_string(),
                    message: error.to_string(),
                });
                return Err(error.into());
            }
        };

        self.service = Some(channel);
        self.state_tx = self.manager.state_sender();

        self.persist(store::OPTIONS_KEY, serde_json::to_vec(&self.options));
        self.persist(
            &store::reflection_metadata_key(&self.options.address),
            serde_json::to_vec(&self.options.reflection_metadata),
        );

        self.sink.emit(SessionEvent::Connected {
            address: self.options.address.clone(),
        });

        if let Err(error) = self.load_schema().await {
            self.sink.emit(SessionEvent::Error {
                title: "Unable to load the schema".to_string(),
                message: error.to_string(),
            });
            return Err(error);
        }

        Ok(())
    }

    /// Invokes a method, first nudging a failed connection back to ready.
    pub async fn send(
        &mut self,
        method_path: &str,
        payload_json: &str,
        headers: Vec<(String, String)>,
    ) -> Result<(), SessionError> {
        match self.manager.retry_connect().await {
            Ok(Some(channel)) => self.service = Some(channel),
            Ok(None) => {}
            Err(error) => {
                self.sink.emit(SessionEvent::Error {
                    title: "Unable to reconnect".to_string(),
                    message: error.to_string(),
                });
                return Err(error.into());
            }
        }

        self.invoke(method_path, payload_json, headers).await
    }

    /// Explicitly re-dials a connection stuck in transient failure.
    pub async fn retry_connection(&mut self) -> Result<(), SessionError> {
        match self.manager.retry_connect().await {
            Ok(Some(channel)) => {
                self.service = Some(channel);
                Ok(())
            }
            Ok(None) => Err(SessionError::NotConnected),
            Err(error) => {
                self.sink.emit(SessionEvent::Error {
                    title: "Unable to reconnect".to_string(),
                    message: error.to_string(),
                });
                Err(error.into())
            }
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.manager.state()
    }

    /// Cancels any in-flight call and tears the connection down.
    pub async fn close(&mut self) {
        self.cancel();
        self.manager.close().await;
        self.service = None;
        self.state_tx = None;
        self.registry = None;
    }
}

fn service_listing(registry: &DescriptorRegistry) -> Vec<ServiceSelect> {
    registry
        .services()
        .iter()
        // The reflection service itself is plumbing, not something to call.
        .filter(|s| !s.full_name().starts_with("grpc.reflection."))
        .map(|s| {
            let mut methods: Vec<_> = s
                .methods()
                .map(|m| MethodSelect {
                    name: m.name().to_string(),
                    full_name: format!("/{}/{}", s.full_name(), m.name()),
                    client_streaming: m.is_client_streaming(),
                    server_streaming: m.is_server_streaming(),
                })
                .collect();
            methods.sort_by(|a, b| a.name.cmp(&b.name));
            ServiceSelect {
                name: s.full_name().to_string(),
                methods,
            }
        })
        .collect()
}

fn lock(call: &Mutex<CallState>) -> MutexGuard<'_, CallState> {
    // A poisoned call slot is still usable.
    call.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn drive_call<S>(
    service: S,
    method: MethodDescriptor,
    outbound: Outbound,
    headers: Vec<(String, String)>,
    observer: CallObserver,
    sink: Arc<dyn EventSink>,
    state_tx: Option<watch::Sender<ConnectivityState>>,
) where
    S: GrpcService<tonic::body::Body> + Send + 'static,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
    S::Future: Send,
{
    let mut client = GrpcClient::new(service);
    observer.out_headers(&headers);
    let server_streaming = method.is_server_streaming();

    match (outbound, server_streaming) {
        (Outbound::Single(payload), false) => {
            observer.out_payload(&payload);
            let result = client.unary(method, payload, headers).await;
            finish_single(result, &observer, &sink, &state_tx);
        }
        (Outbound::Single(payload), true) => {
            observer.out_payload(&payload);
            let result = client.server_streaming(method, payload, headers).await;
            finish_stream(result, &observer, &sink, &state_tx).await;
        }
        (Outbound::Stream(feeder), false) => {
            let tap = observer.clone();
            let feeder = feeder.map(move |payload| {
                tap.out_payload(&payload);
                payload
            });
            let result = client.client_streaming(method, feeder, headers).await;
            finish_single(result, &observer, &sink, &state_tx);
        }
        (Outbound::Stream(feeder), true) => {
            let tap = observer.clone();
            let feeder = feeder.map(move |payload| {
                tap.out_payload(&payload);
                payload
            });
            let result = client.bidirectional_streaming(method, feeder, headers).await;
            finish_stream(result, &observer, &sink, &state_tx).await;
        }
    }
}

fn finish_single(
    result: Result<Result<tonic::Response<serde_json::Value>, Status>, GrpcRequestError>,
    observer: &CallObserver,
    sink: &Arc<dyn EventSink>,
    state_tx: &Option<watch::Sender<ConnectivityState>>,
) {
    match result {
        Ok(Ok(response)) => {
            observer.in_headers(response.metadata());
            let payload = response.into_inner();
            observer.in_payload(&payload);
            observer.end(&Status::new(Code::Ok, ""));
        }
        Ok(Err(status)) => observer.end(&status),
        Err(error) => fail(error, observer, sink, state_tx),
    }
}

async fn finish_stream(
    result: Result<
        Result<tonic::Response<tonic::Streaming<serde_json::Value>>, Status>,
        GrpcRequestError,
    >,
    observer: &CallObserver,
    sink: &Arc<dyn EventSink>,
    state_tx: &Option<watch::Sender<ConnectivityState>>,
) {
    match result {
        Ok(Ok(response)) => {
            observer.in_headers(response.metadata());
            let mut stream = response.into_inner();

            loop {
                match stream.message().await {
                    Ok(Some(payload)) => observer.in_payload(&payload),
                    Ok(None) => break,
                    Err(status) => {
                        observer.end(&status);
                        return;
                    }
                }
            }

            match stream.trailers().await {
                Ok(Some(trailers)) => observer.in_trailers(&trailers),
                Ok(None) => {}
                Err(status) => {
                    observer.end(&status);
                    return;
                }
            }

            observer.end(&Status::new(Code::Ok, ""));
        }
        Ok(Err(status)) => observer.end(&status),
        Err(error) => fail(error, observer, sink, state_tx),
    }
}

// Request-level failures never reached the server, so they end the call with
// a synthetic status and flag the transport when it was at fault.
fn fail(
    error: GrpcRequestError,
    observer: &CallObserver,
    sink: &Arc<dyn EventSink>,
    state_tx: &Option<watch::Sender<ConnectivityState>>,
) {
    if matches!(error, GrpcRequestError::ClientNotReady(_))
        && let Some(state_tx) = state_tx
    {
        state_tx.send_replace(ConnectivityState::TransientFailure);
    }

    tracing::warn!(%error, "request failed before reaching the server");
    sink.emit(SessionEvent::Error {
        title: "Request failed".to_string(),
        message: error.to_string(),
    });
    observer.end(&Status::unknown(error.to_string()));
}
