//! # Connection Manager
//!
//! Owns the transport to one server: building the endpoint from
//! [`ConnectionOptions`], dialing with a timeout, and tracking a
//! [`ConnectivityState`] machine whose transitions are reported through the
//! session's [`EventSink`].
//!
//! `tonic`'s `Channel` reconnects transparently and exposes no state of its
//! own, so the state here is driven by the manager and by the invocation
//! engine: the engine flips to [`ConnectivityState::TransientFailure`] when a
//! call finds the transport unusable, and [`ConnectionManager::retry_connect`]
//! dials again to move back to ready. A monitor task watches the state and
//! forwards every transition to the sink until the connection is closed.
use crate::events::{EventSink, SessionEvent};
use crate::options::ConnectionOptions;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};

/// Upper bound for the initial dial.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for a retry dial, and the slice length the monitor wakes at.
const STATE_WAIT_SLICE: Duration = Duration::from_secs(5);

/// Grace period on close, giving the monitor time to drain pending
/// transitions before the final state is published.
const MONITOR_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid server address '{address}': '{source}'")]
    InvalidAddress {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("client certificate and key must both be provided")]
    IncompleteClientIdentity,

    #[error("failed to read certificate file '{path}': '{source}'")]
    ReadCertificate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to configure TLS for '{address}': '{source}'")]
    Tls {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("timed out after {CONNECT_TIMEOUT:?} connecting to '{address}'")]
    Timeout { address: String },

    #[error("failed to connect to '{address}': '{source}'")]
    Transport {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },
}

struct Connection {
    endpoint: Endpoint,
    channel: Channel,
    state_tx: watch::Sender<ConnectivityState>,
    stop_tx: watch::Sender<bool>,
    monitor: JoinHandle<()>,
}

/// Manages at most one live connection, replacing it on re-connect.
pub struct ConnectionManager {
    sink: Arc<dyn EventSink>,
    current: Option<Connection>,
}

impl ConnectionManager {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            current: None,
        }
    }

    /// Dials `options.address`, replacing any previous connection.
    ///
    /// On success the returned `Channel` is a cheap clone of the managed one.
    pub async fn connect(&mut self, options: &ConnectionOptions) -> Result<Channel, ConnectError> {
        self.close().await;

        let endpoint = build_endpoint(options).await?;

        let (state_tx, state_rx) = watch::channel(ConnectivityState::Idle);
        let (stop_tx, stop_rx) = watch::channel(false);
        let monitor = tokio::spawn(monitor_states(state_rx, stop_rx, self.sink.clone()));

        state_tx.send_replace(ConnectivityState::Connecting);

        let channel = match tokio::time::timeout(CONNECT_TIMEOUT, endpoint.connect()).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(source)) => {
                state_tx.send_replace(ConnectivityState::TransientFailure);
                return Err(ConnectError::Transport {
                    address: options.address.clone(),
                    source,
                });
            }
            Err(_) => {
                state_tx.send_replace(ConnectivityState::TransientFailure);
                return Err(ConnectError::Timeout {
                    address: options.address.clone(),
                });
            }
        };

        tracing::info!(address = %options.address, "connected");
        state_tx.send_replace(ConnectivityState::Ready);

        self.current = Some(Connection {
            endpoint,
            channel: channel.clone(),
            state_tx,
            stop_tx,
            monitor,
        });

        Ok(channel)
    }

    /// Dials the current endpoint again if the connection sits in
    /// [`ConnectivityState::TransientFailure`].
    ///
    /// Returns the channel to use, or `None` when there is nothing to retry
    /// (never connected, or already shut down).
    pub async fn retry_connect(&mut self) -> Result<Option<Channel>, ConnectError> {
        let Some(conn) = &mut self.current else {
            return Ok(None);
        };

        let state = *conn.state_tx.borrow();
        match state {
            ConnectivityState::Shutdown => Ok(None),
            ConnectivityState::TransientFailure => {
                conn.state_tx.send_replace(ConnectivityState::Connecting);
                let address = conn.endpoint.uri().to_string();
                tracing::info!(%address, "retrying connection");

                match tokio::time::timeout(STATE_WAIT_SLICE, conn.endpoint.connect()).await {
                    Ok(Ok(channel)) => {
                        conn.channel = channel.clone();
                        conn.state_tx.send_replace(ConnectivityState::Ready);
                        Ok(Some(channel))
                    }
                    Ok(Err(source)) => {
                        conn.state_tx
                            .send_replace(ConnectivityState::TransientFailure);
                        Err(ConnectError::Transport { address, source })
                    }
                    Err(_) => {
                        conn.state_tx
                            .send_replace(ConnectivityState::TransientFailure);
                        Err(ConnectError::Timeout { address })
                    }
                }
            }
            _ => Ok(Some(conn.channel.clone())),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.current
            .as_ref()
            .map(|c| *c.state_tx.borrow())
            .unwrap_or(ConnectivityState::Idle)
    }

    /// A handle other components can use to flip the state, typically to
    /// [`ConnectivityState::TransientFailure`] on transport errors.
    pub fn state_sender(&self) -> Option<watch::Sender<ConnectivityState>> {
        self.current.as_ref().map(|c| c.state_tx.clone())
    }

    pub fn channel(&self) -> Option<Channel> {
        self.current.as_ref().map(|c| c.channel.clone())
    }

    /// Shuts the connection down. Safe to call repeatedly.
    pub async fn close(&mut self) {
        let Some(conn) = self.current.take() else {
            return;
        };

        let _ = conn.stop_tx.send(true);
        tokio::time::sleep(MONITOR_GRACE).await;

        conn.state_tx.send_replace(ConnectivityState::Shutdown);
        // The monitor has already stopped, so the final transition is
        // published here.
        self.sink.emit(SessionEvent::StateChanged {
            state: ConnectivityState::Shutdown,
        });

        let _ = conn.monitor.await;
        tracing::info!("connection closed");
    }
}

/// Forwards every state transition to the sink. Wakes at least every
/// [`STATE_WAIT_SLICE`] so a lost watch notification cannot park it forever.
async fn monitor_states(
    mut state_rx: watch::Receiver<ConnectivityState>,
    mut stop_rx: watch::Receiver<bool>,
    sink: Arc<dyn EventSink>,
) {
    loop {
        tokio::select! {
            // Pending transitions are drained before a stop is honored, so
            // the final states of a failed dial are not lost.
            biased;
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let state = *state_rx.borrow_and_update();
                tracing::debug!(?state, "connectivity state changed");
                sink.emit(SessionEvent::StateChanged { state });
                if state == ConnectivityState::Shutdown {
                    return;
                }
            }
            _ = stop_rx.changed() => return,
            _ = tokio::time::sleep(STATE_WAIT_SLICE) => {}
        }
    }
}

async fn build_endpoint(options: &ConnectionOptions) -> Result<Endpoint, ConnectError> {
    let address = if options.address.contains("://") {
        options.address.clone()
    } else if options.plaintext {
        format!("http://{}", options.address)
    } else {
        format!("https://{}", options.address)
    };

    let invalid = |source| ConnectError::InvalidAddress {
        address: options.address.clone(),
        source,
    };

    let endpoint = Endpoint::from_shared(address)
        .map_err(invalid)?
        .user_agent(concat!("sonda/", env!("CARGO_PKG_VERSION")))
        .map_err(invalid)?;

    if options.plaintext {
        return Ok(endpoint);
    }

    if options.insecure_skip_verify {
        tracing::warn!(
            "skipping certificate verification is not supported; native trust roots remain in effect"
        );
    }

    let mut tls = ClientTlsConfig::new().with_native_roots();

    if let Some(path) = &options.ca_certificate {
        let pem = read_pem(path).await?;
        tls = tls.ca_certificate(Certificate::from_pem(pem));
    }

    match (&options.client_certificate, &options.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let cert = read_pem(cert_path).await?;
            let key = read_pem(key_path).await?;
            tls = tls.identity(Identity::from_pem(cert, key));
        }
        (None, None) => {}
        _ => return Err(ConnectError::IncompleteClientIdentity),
    }

    endpoint.tls_config(tls).map_err(|source| ConnectError::Tls {
        address: options.address.clone(),
        source,
    })
}

async fn read_pem(path: &Path) -> Result<Vec<u8>, ConnectError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| ConnectError::ReadCertificate {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bare_addresses_get_a_scheme() {
        let endpoint = build_endpoint(&ConnectionOptions::plaintext("localhost:50051"))
            .await
            .unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("http"));

        let options = ConnectionOptions {
            address: "localhost:50051".to_string(),
            ..Default::default()
        };
        let endpoint = build_endpoint(&options).await.unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("https"));
    }

    #[tokio::test]
    async fn explicit_schemes_are_kept() {
        let endpoint = build_endpoint(&ConnectionOptions::plaintext("https://example.com:443"))
            .await
            .unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("https"));
    }

    #[tokio::test]
    async fn partial_client_identity_is_rejected() {
        let options = ConnectionOptions {
            address: "example.com:443".to_string(),
            client_certificate: Some("client.pem".into()),
            ..Default::default()
        };
        let err = build_endpoint(&options).await.unwrap_err();
        assert!(matches!(err, ConnectError::IncompleteClientIdentity));
    }
}
