//! Scripted in-memory connections for tests.
//!
//! [`FakeFactory`] builds [`FakeTransport`]/[`FakeServer`] pairs whose
//! behaviour is driven by a [`FakeScript`], and counts every lifecycle event
//! in shared [`FakeStats`].
//!
//! Transport behaviour:
//! - the first request on a session-capable connection mints an ID and
//!   announces it (unless `skip_establish` is set)
//! - `POST` answers with a JSON-RPC echo and ends the response
//! - `GET` opens an event stream that stays open until the transport closes

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use parking_lot::Mutex;
use serde_json::{Value, json};
use sluice_core::{ConnectionError, SessionId};

use crate::bridge::ResponseWriter;
use crate::connection::{
    CloseHook, ConnectionFactory, ConnectionPair, ProtocolServer, ServerTransport,
    TransportOptions, TransportRequest,
};
use crate::headers::LegacyHeaderValue;
use crate::manager::SESSION_ID_HEADER;

/// A JSON-RPC `initialize` request body.
pub fn initialize_body() -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "clientInfo": {"name": "test-client", "version": "0.0.0"}
        }
    })
}

/// Behaviour switches for fake connections.
#[derive(Clone, Debug, Default)]
pub struct FakeScript {
    /// The factory fails instead of building a pair.
    pub fail_create: bool,
    /// Every request fails before writing anything.
    pub fail_request: bool,
    /// The first request announces its session, then fails.
    pub fail_after_establish: bool,
    /// Never announce a session.
    pub skip_establish: bool,
    /// `close()` on the transport reports an error (after closing).
    pub fail_close: bool,
    /// Sleep this long inside every request before responding.
    pub request_delay: Option<Duration>,
}

/// Shared lifecycle counters.
#[derive(Debug, Default)]
pub struct FakeStats {
    created: AtomicUsize,
    requests: AtomicUsize,
    transport_closes: AtomicUsize,
    server_closes: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeStats {
    /// Pairs built by the factory.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Requests handed to any transport.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Calls to `ServerTransport::close`.
    pub fn transport_closes(&self) -> usize {
        self.transport_closes.load(Ordering::SeqCst)
    }

    /// Calls to `ProtocolServer::close`.
    pub fn server_closes(&self) -> usize {
        self.server_closes.load(Ordering::SeqCst)
    }

    /// Highest number of requests observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Factory producing scripted pairs.
#[derive(Default)]
pub struct FakeFactory {
    script: FakeScript,
    stats: Arc<FakeStats>,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeFactory {
    /// Factory following `script`.
    pub fn new(script: FakeScript) -> Self {
        Self {
            script,
            stats: Arc::default(),
            transports: Mutex::default(),
        }
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<FakeStats> {
        self.stats.clone()
    }

    /// Every transport built so far.
    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.transports.lock().clone()
    }

    /// The most recently built transport.
    pub fn last_transport(&self) -> Option<Arc<FakeTransport>> {
        self.transports.lock().last().cloned()
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn create(&self, options: TransportOptions) -> Result<ConnectionPair, ConnectionError> {
        if self.script.fail_create {
            return Err(ConnectionError::Construction("scripted factory failure".into()));
        }
        let transport = Arc::new(FakeTransport {
            options,
            script: self.script.clone(),
            stats: self.stats.clone(),
            session: Mutex::new(None),
            on_close: Mutex::new(None),
            open_streams: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_next: AtomicBool::new(false),
        });
        self.transports.lock().push(transport.clone());
        let _ = self.stats.created.fetch_add(1, Ordering::SeqCst);
        let server = Arc::new(FakeServer {
            stats: self.stats.clone(),
        });
        Ok(ConnectionPair::new(server, transport))
    }
}

/// Scripted transport half.
pub struct FakeTransport {
    options: TransportOptions,
    script: FakeScript,
    stats: Arc<FakeStats>,
    session: Mutex<Option<SessionId>>,
    on_close: Mutex<Option<CloseHook>>,
    open_streams: Mutex<Vec<ResponseWriter>>,
    closed: AtomicBool,
    fail_next: AtomicBool,
}

impl FakeTransport {
    /// Session announced by this transport, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.lock().clone()
    }

    /// Whether the transport has closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make the next request fail.
    pub fn fail_next_request(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Close from the connection's side: end open streams and fire the close
    /// hook, without counting as a `close()` call.
    pub fn simulate_disconnect(&self) {
        self.shut();
    }

    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let streams: Vec<ResponseWriter> = self.open_streams.lock().drain(..).collect();
        for writer in streams {
            writer.end(None);
        }
        let hook = self.on_close.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn establish(&self) -> Option<SessionId> {
        let mut session = self.session.lock();
        if session.is_none() && !self.script.skip_establish {
            if let Some(id) = self.options.generate_session_id() {
                *session = Some(id);
                let announced = session.clone();
                drop(session);
                if let Some(id) = &announced {
                    self.options.session_established(id);
                }
                return announced;
            }
        }
        session.clone()
    }

    fn respond(
        &self,
        request: &TransportRequest,
        response: ResponseWriter,
        body: Option<&Value>,
    ) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Request("transport closed".into()));
        }
        if self.script.fail_request || self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ConnectionError::Request("scripted request failure".into()));
        }
        let session = self.establish();
        if self.script.fail_after_establish && session.is_some() {
            return Err(ConnectionError::Request(
                "scripted failure after establishment".into(),
            ));
        }

        let mut headers: Vec<(String, LegacyHeaderValue)> = Vec::new();
        if let Some(id) = &session {
            headers.push((SESSION_ID_HEADER.to_owned(), id.as_str().into()));
        }

        if request.method == Method::GET {
            headers.push(("content-type".into(), "text/event-stream".into()));
            headers.push(("cache-control".into(), "no-cache".into()));
            let _ = response.write_head(StatusCode::OK, headers);
            let _ = response.write(Bytes::from_static(b": stream open\n\n"));
            self.open_streams.lock().push(response);
            return Ok(());
        }

        let id = body.and_then(|b| b.get("id")).cloned().unwrap_or(Value::Null);
        let reply = json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "echo": body,
                "sessionId": session,
            }
        });
        headers.push(("content-type".into(), "application/json".into()));
        let _ = response.write_head(StatusCode::OK, headers);
        response.end(Some(Bytes::from(reply.to_string())));
        Ok(())
    }
}

#[async_trait]
impl ServerTransport for FakeTransport {
    async fn handle_request(
        &self,
        request: TransportRequest,
        response: ResponseWriter,
        body: Option<Value>,
    ) -> Result<(), ConnectionError> {
        let _ = self.stats.requests.fetch_add(1, Ordering::SeqCst);
        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.stats.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.script.request_delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.respond(&request, response, body.as_ref());

        let _ = self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn on_close(&self, hook: CloseHook) {
        *self.on_close.lock() = Some(hook);
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        let _ = self.stats.transport_closes.fetch_add(1, Ordering::SeqCst);
        self.shut();
        if self.script.fail_close {
            return Err(ConnectionError::Close("scripted close failure".into()));
        }
        Ok(())
    }
}

/// Scripted protocol half.
pub struct FakeServer {
    stats: Arc<FakeStats>,
}

#[async_trait]
impl ProtocolServer for FakeServer {
    async fn close(&self) -> Result<(), ConnectionError> {
        let _ = self.stats.server_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::response_bridge;
    use http::HeaderMap;

    #[tokio::test]
    async fn stateful_fake_announces_once() {
        let announced = Arc::new(AtomicUsize::new(0));
        let count = announced.clone();
        let options = TransportOptions::stateful(
            Arc::new(SessionId::generate),
            Arc::new(move |_: &SessionId| {
                let _ = count.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let factory = FakeFactory::new(FakeScript::default());
        let pair = factory.create(options).await.unwrap();

        for _ in 0..2 {
            let (writer, _stream) = response_bridge();
            let request = TransportRequest::for_endpoint("/mcp", &HeaderMap::new(), true);
            pair.handle(request, writer, Some(initialize_body()))
                .await
                .unwrap();
        }
        assert_eq!(announced.load(Ordering::SeqCst), 1);
        assert!(factory.last_transport().unwrap().session_id().is_some());
        assert_eq!(factory.stats().requests(), 2);
    }

    #[tokio::test]
    async fn close_ends_open_streams() {
        let factory = FakeFactory::new(FakeScript::default());
        let pair = factory.create(TransportOptions::stateless()).await.unwrap();
        let (writer, stream) = response_bridge();
        let request = TransportRequest::for_endpoint("/mcp", &HeaderMap::new(), false);
        pair.handle(request, writer.clone(), None).await.unwrap();
        assert!(writer.headers_sent());

        pair.release().await.unwrap();
        let body = stream.read_to_end().await.unwrap();
        assert_eq!(&body[..], b": stream open\n\n");
        assert!(factory.last_transport().unwrap().is_closed());
    }
}
