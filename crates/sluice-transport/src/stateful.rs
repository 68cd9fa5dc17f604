//! Stateful transport manager.
//!
//! Owns the session registry. A session is registered only after its
//! connection confirms it (the established hook), is served by one
//! long-lived connection pair, and ends on explicit deletion, on a stale
//! sweep, or when the connection closes on its own.
//!
//! ```text
//! UNINITIALIZED ──initialize_and_handle──▶ ACTIVE ──delete / gc / close──▶ CLOSED
//! ```
//!
//! A sweep runs every `gc_interval` and collects sessions that have been
//! idle for longer than `stale_timeout` **and** have no request in flight.
//! Overlapping requests on one session are not serialized; the only
//! guarantee is that a session with `active_requests > 0` is never
//! collected.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use http::{HeaderMap, HeaderValue, StatusCode};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde_json::{Value, json};
use sluice_core::{RequestContext, Result, SessionId, TransportError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, instrument, warn};

use crate::bridge::response_bridge;
use crate::cleanup::{DeferredRelease, observe_stream_errors};
use crate::connection::{
    ConnectionFactory, ConnectionPair, SessionEstablishedHook, SessionIdGenerator,
    TransportOptions, TransportRequest,
};
use crate::manager::{SESSION_ID_HEADER, TransportManager};
use crate::metrics::{
    GC_SKIPPED_ACTIVE_TOTAL, GC_SWEEPS_TOTAL, SESSIONS_ACTIVE, SESSIONS_CLOSED_TOTAL,
    SESSIONS_CREATED_TOTAL,
};
use crate::response::{StreamingResponse, TransportResponse};
use crate::session::{Session, SessionRegistry};

/// Shortest sweep period the manager accepts.
pub const MIN_GC_INTERVAL: Duration = Duration::from_millis(100);

/// Stateful manager configuration.
#[derive(Clone, Debug)]
pub struct StatefulConfig {
    /// Idle time after which a session without in-flight requests is collected.
    pub stale_timeout: Duration,
    /// Period of the stale-session sweep.
    pub gc_interval: Duration,
    /// Path of the protocol endpoint, used for synthetic requests.
    pub endpoint_path: String,
    /// Maximum registered sessions (`0` = unlimited).
    pub max_sessions: usize,
}

impl Default for StatefulConfig {
    fn default() -> Self {
        Self {
            stale_timeout: Duration::from_secs(30 * 60),
            gc_interval: Duration::from_secs(60),
            endpoint_path: "/mcp".into(),
            max_sessions: 0,
        }
    }
}

/// Why a session was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit delete request.
    Deleted,
    /// Collected by the stale sweep.
    Stale,
    /// The connection closed on its own.
    ConnectionClosed,
    /// Manager shutdown.
    Shutdown,
}

impl CloseReason {
    /// Metric label value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deleted => "delete",
            Self::Stale => "gc",
            Self::ConnectionClosed => "connection_closed",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Outcome of one stale sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions collected by this sweep.
    pub closed: Vec<SessionId>,
    /// Sessions idle past the timeout but still serving requests; they are
    /// re-evaluated on the next tick.
    pub skipped_active: Vec<SessionId>,
}

struct Inner {
    factory: Arc<dyn ConnectionFactory>,
    config: StatefulConfig,
    registry: SessionRegistry,
    id_generator: SessionIdGenerator,
}

impl Inner {
    fn register(&self, id: SessionId, pair: Arc<ConnectionPair>, reserved: bool) -> bool {
        let inserted = if reserved {
            self.registry.insert_reserved(id.clone(), pair.clone())
        } else {
            self.registry.insert(id.clone(), pair.clone())
        };
        if !inserted {
            warn!(session_id = %id, "duplicate session id, releasing new connection");
            let _ = DeferredRelease::new(pair).fire_detached();
            return false;
        }
        counter!(SESSIONS_CREATED_TOTAL).increment(1);
        self.record_active();
        info!(session_id = %id, "session established");
        true
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_active(&self) {
        debug_assert!(self.registry.is_consistent());
        gauge!(SESSIONS_ACTIVE).set(self.registry.len() as f64);
    }

    async fn close_session(&self, id: &SessionId, reason: CloseReason) -> bool {
        let Some(pair) = self.registry.remove(id) else {
            debug!(session_id = %id, reason = reason.as_str(), "session already closed");
            return false;
        };
        self.release(id, &pair, reason).await;
        true
    }

    async fn release(&self, id: &SessionId, pair: &ConnectionPair, reason: CloseReason) {
        if let Err(e) = pair.release().await {
            warn!(session_id = %id, error = %e, "error releasing session connection");
        }
        counter!(SESSIONS_CLOSED_TOTAL, "reason" => reason.as_str()).increment(1);
        self.record_active();
        info!(session_id = %id, reason = reason.as_str(), "session closed");
    }

    async fn cleanup_stale_sessions(&self) -> SweepReport {
        counter!(GC_SWEEPS_TOTAL).increment(1);
        let scan = self
            .registry
            .take_stale(Instant::now(), self.config.stale_timeout);

        for (id, active, idle) in &scan.skipped_active {
            debug!(
                session_id = %id,
                active_requests = active,
                idle_secs = idle.as_secs(),
                "stale session has requests in flight, deferring"
            );
        }
        if !scan.skipped_active.is_empty() {
            counter!(GC_SKIPPED_ACTIVE_TOTAL).increment(scan.skipped_active.len() as u64);
        }

        let _ = join_all(
            scan.collected
                .iter()
                .map(|(id, pair)| self.release(id, pair, CloseReason::Stale)),
        )
        .await;

        let report = SweepReport {
            closed: scan.collected.into_iter().map(|(id, _)| id).collect(),
            skipped_active: scan
                .skipped_active
                .into_iter()
                .map(|(id, _, _)| id)
                .collect(),
        };
        if !report.closed.is_empty() || !report.skipped_active.is_empty() {
            info!(
                closed = report.closed.len(),
                skipped_active = report.skipped_active.len(),
                "stale session sweep"
            );
        }
        report
    }
}

/// Tracks one initialization: the established hook may fire while the
/// factory is still constructing the pair, or while the first request is
/// being driven.
#[derive(Default)]
struct PendingSession {
    state: Mutex<PendingState>,
}

#[derive(Default)]
struct PendingState {
    cleanup: Option<Arc<DeferredRelease>>,
    announced: Option<SessionId>,
    registered: Option<SessionId>,
    sealed: bool,
    /// Holds one registry slot until the session registers or the
    /// initialization ends.
    slot: bool,
}

impl PendingSession {
    fn establish(&self, inner: &Inner, id: &SessionId) {
        let mut state = self.state.lock();
        if state.sealed || state.announced.is_some() || state.registered.is_some() {
            warn!(session_id = %id, "unexpected session announcement, ignoring");
            return;
        }
        match state.cleanup.clone() {
            Some(cleanup) => Self::register(&mut state, inner, &cleanup, id.clone()),
            None => state.announced = Some(id.clone()),
        }
    }

    fn arm(&self, inner: &Inner, cleanup: Arc<DeferredRelease>) {
        let mut state = self.state.lock();
        state.cleanup = Some(cleanup.clone());
        if let Some(id) = state.announced.take() {
            Self::register(&mut state, inner, &cleanup, id);
        }
    }

    fn register(
        state: &mut PendingState,
        inner: &Inner,
        cleanup: &DeferredRelease,
        id: SessionId,
    ) {
        let Some(pair) = cleanup.disarm() else {
            warn!(session_id = %id, "connection released before its session was registered");
            return;
        };
        let reserved = std::mem::take(&mut state.slot);
        if inner.register(id.clone(), pair, reserved) {
            state.registered = Some(id);
        }
    }

    /// Claim a registry slot against `limit`.
    fn reserve(&self, inner: &Inner, limit: usize) -> bool {
        let mut state = self.state.lock();
        if !inner.registry.reserve(limit) {
            return false;
        }
        state.slot = true;
        true
    }

    /// Return the slot if no session took it.
    fn release_slot(&self, inner: &Inner) {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.slot) {
            inner.registry.unreserve();
        }
    }

    /// Stop accepting announcements once the first request has been driven.
    fn seal(&self) {
        let mut state = self.state.lock();
        state.sealed = true;
        state.cleanup = None;
    }

    fn session_id(&self) -> Option<SessionId> {
        self.state.lock().registered.clone()
    }
}

/// Returns an unused slot when initialization ends, including when the
/// request future is dropped mid-drive.
struct SlotGuard<'a> {
    inner: &'a Inner,
    pending: &'a PendingSession,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.pending.release_slot(self.inner);
    }
}

/// Manager for persistent per-client sessions.
pub struct StatefulManager {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    gc: Mutex<Option<JoinHandle<()>>>,
}

impl StatefulManager {
    /// Create a manager and start its sweep task.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: StatefulConfig) -> Self {
        Self::with_id_generator(factory, config, Arc::new(SessionId::generate))
    }

    /// Like [`new`](Self::new), with a custom session ID strategy.
    pub fn with_id_generator(
        factory: Arc<dyn ConnectionFactory>,
        config: StatefulConfig,
        id_generator: SessionIdGenerator,
    ) -> Self {
        let mut config = config;
        if config.gc_interval < MIN_GC_INTERVAL {
            warn!(
                configured = ?config.gc_interval,
                min = ?MIN_GC_INTERVAL,
                "gc interval too short, clamping"
            );
            config.gc_interval = MIN_GC_INTERVAL;
        }
        let gc_interval = config.gc_interval;
        let inner = Arc::new(Inner {
            factory,
            config,
            registry: SessionRegistry::default(),
            id_generator,
        });
        let cancel = CancellationToken::new();
        let gc = spawn_gc(Arc::downgrade(&inner), gc_interval, cancel.clone());
        info!(
            stale_timeout_secs = inner.config.stale_timeout.as_secs(),
            gc_interval_secs = gc_interval.as_secs(),
            "stateful transport started"
        );
        Self {
            inner,
            cancel,
            gc: Mutex::new(Some(gc)),
        }
    }

    /// Manager configuration.
    pub fn config(&self) -> &StatefulConfig {
        &self.inner.config
    }

    /// Create a connection, drive the first request through it, and return
    /// its response.
    ///
    /// The session is registered only once the connection confirms it; the
    /// returned stream then carries the new ID in [`SESSION_ID_HEADER`].
    #[instrument(skip_all, fields(request_id = %ctx, session_id))]
    pub async fn initialize_and_handle(
        &self,
        headers: &HeaderMap,
        body: Option<Value>,
        ctx: &RequestContext,
    ) -> Result<TransportResponse> {
        let limit = self.inner.config.max_sessions;
        let pending = Arc::new(PendingSession::default());
        if !pending.reserve(&self.inner, limit) {
            warn!(limit, "session limit reached, rejecting initialization");
            return Ok(TransportResponse::from_error(
                &TransportError::SessionLimitReached { limit },
            ));
        }
        let _slot = SlotGuard {
            inner: &self.inner,
            pending: &pending,
        };

        let options =
            TransportOptions::stateful(self.inner.id_generator.clone(), self.established_hook(&pending));
        let pair = match self.inner.factory.create(options).await {
            Ok(pair) => Arc::new(pair),
            Err(e) => {
                warn!(error = %e, "connection factory failed");
                return Err(TransportError::initialization(e));
            }
        };

        let cleanup = DeferredRelease::new(pair.clone());
        self.watch_close(&pair, &pending);
        pending.arm(&self.inner, cleanup.clone());

        let (writer, stream) = response_bridge();
        observe_stream_errors(&writer);
        cleanup.attach(&writer);

        let request = TransportRequest::for_endpoint(
            &self.inner.config.endpoint_path,
            headers,
            body.is_some(),
        );
        let driven = pair.handle(request, writer.clone(), body).await;
        pending.seal();
        let session_id = pending.session_id();

        if let Err(e) = driven {
            if let Some(id) = &session_id {
                warn!(session_id = %id, error = %e, "initialization failed after registration");
            } else {
                warn!(error = %e, "initialization failed, releasing connection");
                let _ = cleanup.run().await;
            }
            return Err(TransportError::initialization(e));
        }

        let (status, mut response_headers) = writer.head_snapshot();
        match &session_id {
            Some(id) => {
                let _ = Span::current().record("session_id", id.as_str());
                if !response_headers.contains_key(SESSION_ID_HEADER) {
                    if let Ok(value) = HeaderValue::from_str(id) {
                        let _ = response_headers.insert(SESSION_ID_HEADER, value);
                    }
                }
            }
            None => debug!("no session established, connection released when the stream ends"),
        }

        Ok(TransportResponse::Streaming(StreamingResponse {
            status,
            headers: response_headers,
            stream,
            session_id,
        }))
    }

    /// Serve a request on an existing session.
    ///
    /// A missing ID yields a buffered 400, an unknown ID a buffered 404.
    #[instrument(skip_all, fields(request_id = %ctx, session_id = session_id.map(SessionId::as_str)))]
    pub async fn handle_request(
        &self,
        headers: &HeaderMap,
        body: Option<Value>,
        ctx: &RequestContext,
        session_id: Option<&SessionId>,
    ) -> Result<TransportResponse> {
        let Some(id) = session_id else {
            debug!("request without session id");
            return Ok(TransportResponse::from_error(&TransportError::InvalidInput(
                format!("{SESSION_ID_HEADER} header is required"),
            )));
        };
        let Some(active) = self.inner.registry.begin_request(id) else {
            debug!("unknown session");
            return Ok(TransportResponse::from_error(
                &TransportError::SessionNotFound(id.clone()),
            ));
        };

        let (writer, stream) = response_bridge();
        observe_stream_errors(&writer);
        let request = TransportRequest::for_endpoint(
            &self.inner.config.endpoint_path,
            headers,
            body.is_some(),
        );
        let driven = active.pair().handle(request, writer.clone(), body).await;
        drop(active);

        if let Err(e) = driven {
            warn!(error = %e, "request on session failed");
            return Err(e.into());
        }

        let (status, headers) = writer.head_snapshot();
        Ok(TransportResponse::Streaming(StreamingResponse {
            status,
            headers,
            stream,
            session_id: Some(id.clone()),
        }))
    }

    /// Close a session on explicit request.
    #[instrument(skip_all, fields(request_id = %ctx, session_id = %session_id))]
    pub async fn handle_delete_request(
        &self,
        session_id: &SessionId,
        ctx: &RequestContext,
    ) -> Result<TransportResponse> {
        if !self
            .inner
            .close_session(session_id, CloseReason::Deleted)
            .await
        {
            debug!("delete for unknown session");
            return Ok(TransportResponse::from_error(
                &TransportError::SessionNotFound(session_id.clone()),
            ));
        }
        Ok(TransportResponse::buffered_json(
            StatusCode::OK,
            &json!({ "success": true, "sessionId": session_id }),
        ))
    }

    /// Snapshot of a session's metadata.
    pub fn get_session(&self, session_id: &SessionId) -> Option<Session> {
        self.inner.registry.get(session_id)
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// IDs of every registered session.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.registry.ids()
    }

    /// Close one session. Idempotent: returns `false` without side effects if
    /// the session is already gone. Release errors are logged, not returned.
    pub async fn close_session(&self, session_id: &SessionId, reason: CloseReason) -> bool {
        self.inner.close_session(session_id, reason).await
    }

    /// Run one stale sweep now.
    pub async fn cleanup_stale_sessions(&self) -> SweepReport {
        self.inner.cleanup_stale_sessions().await
    }

    /// Stop the sweep task and close every session concurrently.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let gc = self.gc.lock().take();
        if let Some(handle) = gc {
            if let Err(e) = handle.await {
                warn!(error = %e, "session gc task ended abnormally");
            }
        }

        let drained = self.inner.registry.drain();
        let count = drained.len();
        let _ = join_all(
            drained
                .iter()
                .map(|(id, pair)| self.inner.release(id, pair, CloseReason::Shutdown)),
        )
        .await;
        info!(closed = count, "stateful transport shut down");
    }

    fn established_hook(&self, pending: &Arc<PendingSession>) -> SessionEstablishedHook {
        let inner = Arc::downgrade(&self.inner);
        let pending = pending.clone();
        Arc::new(move |id: &SessionId| {
            if let Some(inner) = inner.upgrade() {
                pending.establish(&inner, id);
            }
        })
    }

    fn watch_close(&self, pair: &ConnectionPair, pending: &Arc<PendingSession>) {
        let inner = Arc::downgrade(&self.inner);
        let pending = pending.clone();
        pair.on_close(Box::new(move || {
            let Some(id) = pending.session_id() else {
                return;
            };
            let Some(inner) = inner.upgrade() else {
                return;
            };
            match Handle::try_current() {
                Ok(handle) => {
                    drop(handle.spawn(async move {
                        let _ = inner.close_session(&id, CloseReason::ConnectionClosed).await;
                    }));
                }
                Err(_) => {
                    warn!(session_id = %id, "connection closed outside a runtime, leaving session to gc");
                }
            }
        }));
    }
}

impl Drop for StatefulManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl TransportManager for StatefulManager {
    async fn handle_request(
        &self,
        headers: &HeaderMap,
        body: Option<Value>,
        ctx: &RequestContext,
        session_id: Option<&SessionId>,
    ) -> Result<TransportResponse> {
        StatefulManager::handle_request(self, headers, body, ctx, session_id).await
    }

    async fn shutdown(&self) {
        StatefulManager::shutdown(self).await;
    }
}

fn spawn_gc(inner: Weak<Inner>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        let _ = ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else { break };
                    let _ = inner.cleanup_stale_sessions().await;
                }
                () = cancel.cancelled() => break,
            }
        }
        debug!("session gc stopped");
    })
}
