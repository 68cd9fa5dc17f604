//! Connection abstractions consumed by the managers.
//!
//! A [`ConnectionFactory`] manufactures a [`ConnectionPair`]: a protocol
//! server plus the transport that feeds it. The managers never look inside
//! either half; they only drive requests through the transport, subscribe to
//! its close signal, and release the pair when they are done with it.
//!
//! # Driving contract
//!
//! [`ServerTransport::handle_request`] must commit the response head
//! (`write_head` or the first `write`/`end`) before it returns. The body may
//! keep flowing through the [`ResponseWriter`] afterwards, e.g. for
//! server-sent event streams.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use http::{HeaderMap, Method, Uri};
use serde_json::Value;
use sluice_core::{ConnectionError, SessionId};
use tracing::{debug, warn};

use crate::bridge::ResponseWriter;

/// Strategy producing fresh session IDs.
pub type SessionIdGenerator = Arc<dyn Fn() -> SessionId + Send + Sync>;

/// Called by the transport once it has confirmed a new session.
pub type SessionEstablishedHook = Arc<dyn Fn(&SessionId) + Send + Sync>;

/// Called by the transport when it closes, for any reason.
pub type CloseHook = Box<dyn FnOnce() + Send>;

/// Synthetic request handed to the transport.
#[derive(Clone, Debug)]
pub struct TransportRequest {
    /// HTTP method (`POST` with a body, `GET` without).
    pub method: Method,
    /// Endpoint URI.
    pub uri: Uri,
    /// Inbound headers.
    pub headers: HeaderMap,
}

impl TransportRequest {
    /// Build a request for the endpoint at `path`. Picks `POST` when a body is
    /// present and `GET` otherwise.
    pub fn for_endpoint(path: &str, headers: &HeaderMap, has_body: bool) -> Self {
        let method = if has_body { Method::POST } else { Method::GET };
        let uri = path.parse().unwrap_or_else(|_| Uri::from_static("/"));
        Self {
            method,
            uri,
            headers: headers.clone(),
        }
    }
}

/// Options passed to the factory for each new connection.
///
/// Stateless connections get neither a generator nor a hook.
#[derive(Clone, Default)]
pub struct TransportOptions {
    /// Session ID strategy. `None` disables session tracking.
    pub session_id_generator: Option<SessionIdGenerator>,
    /// Hook fired once the transport confirms a session.
    pub on_session_established: Option<SessionEstablishedHook>,
}

impl TransportOptions {
    /// Options for a one-shot connection.
    pub fn stateless() -> Self {
        Self::default()
    }

    /// Options for a session-capable connection.
    pub fn stateful(generator: SessionIdGenerator, on_established: SessionEstablishedHook) -> Self {
        Self {
            session_id_generator: Some(generator),
            on_session_established: Some(on_established),
        }
    }

    /// Whether session tracking is enabled.
    pub fn is_stateful(&self) -> bool {
        self.session_id_generator.is_some()
    }

    /// Mint a session ID, if a generator is configured.
    pub fn generate_session_id(&self) -> Option<SessionId> {
        self.session_id_generator.as_ref().map(|g| g())
    }

    /// Fire the established hook, if configured.
    pub fn session_established(&self, id: &SessionId) {
        if let Some(hook) = &self.on_session_established {
            hook(id);
        }
    }
}

impl fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOptions")
            .field("stateful", &self.is_stateful())
            .finish()
    }
}

/// Transport half of a connection pair.
#[async_trait]
pub trait ServerTransport: Send + Sync {
    /// Drive one request. See the module docs for the head-commit contract.
    async fn handle_request(
        &self,
        request: TransportRequest,
        response: ResponseWriter,
        body: Option<Value>,
    ) -> Result<(), ConnectionError>;

    /// Subscribe to the close signal. Transports keep at most one hook; a
    /// second registration replaces the first.
    fn on_close(&self, hook: CloseHook);

    /// Close the transport and fire the close hook.
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Protocol half of a connection pair.
#[async_trait]
pub trait ProtocolServer: Send + Sync {
    /// Release protocol-level resources.
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Async constructor for connection pairs.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Build and connect a fresh pair.
    async fn create(&self, options: TransportOptions) -> Result<ConnectionPair, ConnectionError>;
}

/// A protocol server and its transport, owned by one session or one call.
pub struct ConnectionPair {
    server: Arc<dyn ProtocolServer>,
    transport: Arc<dyn ServerTransport>,
    released: AtomicBool,
}

impl ConnectionPair {
    /// Pair up a server and its transport.
    pub fn new(server: Arc<dyn ProtocolServer>, transport: Arc<dyn ServerTransport>) -> Self {
        Self {
            server,
            transport,
            released: AtomicBool::new(false),
        }
    }

    /// The transport half.
    pub fn transport(&self) -> &Arc<dyn ServerTransport> {
        &self.transport
    }

    /// The protocol half.
    pub fn server(&self) -> &Arc<dyn ProtocolServer> {
        &self.server
    }

    /// Whether [`release`](Self::release) has run.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Subscribe to the transport's close signal.
    pub fn on_close(&self, hook: CloseHook) {
        self.transport.on_close(hook);
    }

    /// Drive one request through the transport.
    pub async fn handle(
        &self,
        request: TransportRequest,
        response: ResponseWriter,
        body: Option<Value>,
    ) -> Result<(), ConnectionError> {
        if self.is_released() {
            return Err(ConnectionError::Request(
                "connection already released".into(),
            ));
        }
        self.transport.handle_request(request, response, body).await
    }

    /// Close the transport, then the server. Runs at most once; later calls
    /// return `Ok(())` without touching either half.
    ///
    /// Both halves are closed even if the first fails; the first error is
    /// returned.
    pub async fn release(&self) -> Result<(), ConnectionError> {
        if self.released.swap(true, Ordering::AcqRel) {
            debug!("connection pair already released");
            return Ok(());
        }
        let transport = self.transport.close().await;
        if let Err(ref e) = transport {
            warn!(error = %e, "transport close failed");
        }
        let server = self.server.close().await;
        if let Err(ref e) = server {
            warn!(error = %e, "server close failed");
        }
        transport.and(server)
    }
}

impl fmt::Debug for ConnectionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPair")
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}
