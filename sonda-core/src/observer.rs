//! # Call Observer
//!
//! Translates the lifecycle of one RPC into [`ProtocolEvent`]s. The observer
//! is created when a call is admitted and emits events in wire order: begin,
//! outbound headers and payloads, inbound headers, payloads and trailers, and
//! finally a terminal status with the measured duration.
//!
//! Payloads are rendered to pretty-printed JSON here, once, so every frontend
//! shows the same text.
use crate::events::{EventSink, ProtocolEvent, RpcEnd, SessionEvent};
use std::sync::Arc;
use std::time::Instant;
use tonic::metadata::{KeyAndValueRef, MetadataMap};

#[derive(Clone)]
pub struct CallObserver {
    sink: Arc<dyn EventSink>,
    started: Instant,
}

impl CallObserver {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            started: Instant::now(),
        }
    }

    pub fn begin(&self) {
        self.emit(ProtocolEvent::Begin);
    }

    pub fn out_headers(&self, headers: &[(String, String)]) {
        self.emit(ProtocolEvent::OutHeaders {
            headers: headers.to_vec(),
        });
    }

    pub fn out_payload(&self, payload: &serde_json::Value) {
        self.emit(ProtocolEvent::OutPayload {
            rendered: render(payload),
        });
    }

    pub fn in_headers(&self, metadata: &MetadataMap) {
        self.emit(ProtocolEvent::InHeaders {
            headers: metadata_pairs(metadata),
        });
    }

    pub fn in_payload(&self, payload: &serde_json::Value) {
        self.emit(ProtocolEvent::InPayload {
            rendered: render(payload),
        });
    }

    pub fn in_trailers(&self, metadata: &MetadataMap) {
        self.emit(ProtocolEvent::InTrailers {
            trailers: metadata_pairs(metadata),
        });
    }

    /// Emits the terminal protocol event and the end-of-call summary.
    pub fn end(&self, status: &tonic::Status) {
        let duration = self.started.elapsed();
        let code = status.code();

        self.emit(ProtocolEvent::End {
            status: format!("{code:?}"),
            duration,
        });
        self.sink.emit(SessionEvent::RpcEnded(RpcEnd {
            code: code as i32,
            status: format!("{code:?}"),
            duration,
        }));
    }

    fn emit(&self, event: ProtocolEvent) {
        self.sink.emit(SessionEvent::Protocol(event));
    }
}

fn render(payload: &serde_json::Value) -> String {
    serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string())
}

fn metadata_pairs(metadata: &MetadataMap) -> Vec<(String, String)> {
    metadata
        .iter()
        .map(|entry| match entry {
            KeyAndValueRef::Ascii(key, value) => (
                key.to_string(),
                value
                    .to_str()
                    .map(str::to_string)
                    .unwrap_or_else(|_| String::from("<invalid ascii>")),
            ),
            KeyAndValueRef::Binary(key, value) => (key.to_string(), format!("{value:?}")),
        })
        .collect()
}
