//! Minimal JSON-RPC connection served by the `sluice` binary.
//!
//! Answers `initialize`, `ping` and `echo`; everything else gets
//! `-32601 Method not found`. A `GET` opens an event stream that only carries
//! keepalive comments until the connection closes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};
use sluice_core::errors::jsonrpc_error;
use sluice_core::{ConnectionError, SessionId};
use sluice_transport::{
    CloseHook, ConnectionFactory, ConnectionPair, ProtocolServer, ResponseWriter,
    ServerTransport, TransportOptions, TransportRequest,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Protocol revision advertised when the client does not ask for one.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-03-26";

const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;
const JSONRPC_INVALID_REQUEST: i64 = -32600;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Factory for [`EchoTransport`] / [`EchoServer`] pairs.
#[derive(Debug, Default)]
pub struct EchoFactory;

#[async_trait]
impl ConnectionFactory for EchoFactory {
    async fn create(&self, options: TransportOptions) -> Result<ConnectionPair, ConnectionError> {
        Ok(ConnectionPair::new(
            Arc::new(EchoServer),
            Arc::new(EchoTransport::new(options)),
        ))
    }
}

/// Protocol half of the echo connection. Holds nothing.
#[derive(Debug)]
pub struct EchoServer;

#[async_trait]
impl ProtocolServer for EchoServer {
    async fn close(&self) -> Result<(), ConnectionError> {
        debug!("echo server closed");
        Ok(())
    }
}

/// Transport half of the echo connection.
pub struct EchoTransport {
    options: TransportOptions,
    session_id: Mutex<Option<SessionId>>,
    close_hook: Mutex<Option<CloseHook>>,
    streams: Mutex<Vec<ResponseWriter>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl EchoTransport {
    /// Create a transport; session tracking follows `options`.
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            session_id: Mutex::new(None),
            close_hook: Mutex::new(None),
            streams: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Session confirmed by this transport, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id.lock().clone()
    }

    /// Event streams whose consumer is still reading.
    pub fn open_streams(&self) -> usize {
        let mut streams = self.streams.lock();
        streams.retain(ResponseWriter::is_writable);
        streams.len()
    }

    fn establish(&self) {
        let id = {
            let mut slot = self.session_id.lock();
            if slot.is_some() {
                return;
            }
            let Some(id) = self.options.generate_session_id() else {
                return;
            };
            *slot = Some(id.clone());
            id
        };
        debug!(session_id = %id, "echo session established");
        self.options.session_established(&id);
    }

    fn open_event_stream(&self, response: ResponseWriter) {
        let _ = response.write_head(
            StatusCode::OK,
            [
                ("content-type".to_owned(), "text/event-stream"),
                ("cache-control".to_owned(), "no-cache"),
            ],
        );
        let _ = response.write(Bytes::from_static(b": connected\n\n"));
        {
            let mut streams = self.streams.lock();
            streams.retain(ResponseWriter::is_writable);
            streams.push(response.clone());
        }

        let cancel = self.cancel.clone();
        drop(tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            let _ = interval.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if !response.write(Bytes::from_static(b": keepalive\n\n")) {
                            response.end(None);
                            break;
                        }
                    }
                }
            }
        }));
    }
}

#[async_trait]
impl ServerTransport for EchoTransport {
    async fn handle_request(
        &self,
        request: TransportRequest,
        response: ResponseWriter,
        body: Option<Value>,
    ) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Request("transport closed".into()));
        }
        let Some(body) = body else {
            debug!(method = %request.method, "opening event stream");
            self.open_event_stream(response);
            return Ok(());
        };

        if self.options.is_stateful() && self.session_id().is_none() {
            if !crate::binding::is_initialize_request(&body) {
                let payload =
                    jsonrpc_error(JSONRPC_INVALID_REQUEST, "Bad Request: Server not initialized");
                write_json(&response, StatusCode::BAD_REQUEST, &payload);
                return Ok(());
            }
            self.establish();
        }

        let reply = match body {
            Value::Array(batch) => {
                let replies: Vec<Value> = batch.iter().filter_map(dispatch).collect();
                (!replies.is_empty()).then_some(Value::Array(replies))
            }
            single => dispatch(&single),
        };

        match reply {
            Some(reply) => write_json(&response, StatusCode::OK, &reply),
            None => {
                let _ = response.write_head(StatusCode::ACCEPTED, Vec::<(String, String)>::new());
                response.end(None);
            }
        }
        Ok(())
    }

    fn on_close(&self, hook: CloseHook) {
        *self.close_hook.lock() = Some(hook);
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();
        let streams = std::mem::take(&mut *self.streams.lock());
        for stream in streams {
            stream.end(None);
        }
        let hook = self.close_hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        debug!(session_id = ?self.session_id(), "echo transport closed");
        Ok(())
    }
}

fn write_json(response: &ResponseWriter, status: StatusCode, payload: &Value) {
    let _ = response.write_head(status, [("content-type".to_owned(), "application/json")]);
    response.end(Some(Bytes::from(payload.to_string())));
}

/// Answer one message. Notifications and responses yield `None`.
fn dispatch(message: &Value) -> Option<Value> {
    let id = message.get("id")?.clone();
    let method = message.get("method").and_then(Value::as_str)?;
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    let result = match method {
        "initialize" => {
            let version = params
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_PROTOCOL_VERSION);
            json!({
                "protocolVersion": version,
                "capabilities": {},
                "serverInfo": {
                    "name": "sluice-echo",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })
        }
        "ping" => json!({}),
        "echo" => params,
        other => {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {
                    "code": JSONRPC_METHOD_NOT_FOUND,
                    "message": format!("Method not found: {other}"),
                },
            }));
        }
    };
    Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}
