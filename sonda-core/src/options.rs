//! # Connection Options
//!
//! Everything needed to reach a gRPC server and resolve its schema. Options are
//! serializable so a [`crate::store::Store`] implementation can persist them
//! between sessions.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Server address, with or without an explicit `http://`/`https://` scheme.
    pub address: String,
    /// Dial without TLS.
    pub plaintext: bool,
    /// Request that server certificate verification be skipped.
    ///
    /// `rustls` offers no safe way to disable verification, so this flag is
    /// recorded and logged but the native trust roots still apply.
    pub insecure_skip_verify: bool,
    /// PEM file with an extra CA certificate to trust.
    pub ca_certificate: Option<PathBuf>,
    /// PEM file with the client certificate for mutual TLS.
    pub client_certificate: Option<PathBuf>,
    /// PEM file with the client private key for mutual TLS.
    pub client_key: Option<PathBuf>,
    /// Resolve the schema through server reflection. On by default; when
    /// disabled and no proto files are configured, no schema is loaded.
    pub reflection: bool,
    /// Proto files to compile with `protoc` instead of using server reflection.
    pub proto_files: Vec<PathBuf>,
    /// Additional `--proto_path` roots passed to `protoc`.
    pub import_paths: Vec<PathBuf>,
    /// Metadata attached to server reflection requests.
    pub reflection_metadata: Vec<(String, String)>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            address: String::new(),
            plaintext: false,
            insecure_skip_verify: false,
            ca_certificate: None,
            client_certificate: None,
            client_key: None,
            reflection: true,
            proto_files: Vec::new(),
            import_paths: Vec::new(),
            reflection_metadata: Vec::new(),
        }
    }
}

impl ConnectionOptions {
    /// Options for a plaintext connection to `address` using server reflection.
    pub fn plaintext(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            plaintext: true,
            ..Self::default()
        }
    }
}
