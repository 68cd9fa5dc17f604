//! Stateless transport manager: one connection pair per call.
//!
//! The pair is released once the returned stream is fully drained, dropped,
//! or errors. If construction or driving fails before a response exists,
//! the release runs inline before the error is returned.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use http::HeaderMap;
use metrics::{counter, gauge};
use serde_json::Value;
use sluice_core::{RequestContext, Result, SessionId, TransportError};
use tracing::{debug, instrument, warn};

use crate::bridge::response_bridge;
use crate::cleanup::{DeferredRelease, observe_stream_errors};
use crate::connection::{ConnectionFactory, TransportOptions, TransportRequest};
use crate::manager::TransportManager;
use crate::metrics::{STATELESS_INFLIGHT, STATELESS_REQUESTS_TOTAL};
use crate::response::{StreamingResponse, TransportResponse};

/// Manager for single-shot calls.
pub struct StatelessManager {
    factory: Arc<dyn ConnectionFactory>,
    endpoint_path: String,
    inflight: Arc<AtomicUsize>,
}

impl StatelessManager {
    /// Create a manager serving the default `/mcp` endpoint.
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self::with_endpoint_path(factory, "/mcp")
    }

    /// Create a manager for a custom endpoint path.
    pub fn with_endpoint_path(
        factory: Arc<dyn ConnectionFactory>,
        endpoint_path: impl Into<String>,
    ) -> Self {
        Self {
            factory,
            endpoint_path: endpoint_path.into(),
            inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Connection pairs created and not yet released.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Serve one call on a fresh connection pair.
    #[instrument(skip_all, fields(request_id = %ctx))]
    pub async fn handle_request(
        &self,
        headers: &HeaderMap,
        body: Option<Value>,
        ctx: &RequestContext,
    ) -> Result<TransportResponse> {
        counter!(STATELESS_REQUESTS_TOTAL).increment(1);

        let pair = match self.factory.create(TransportOptions::stateless()).await {
            Ok(pair) => Arc::new(pair),
            Err(e) => {
                warn!(error = %e, "connection factory failed");
                return Err(TransportError::initialization(e));
            }
        };
        self.track(1);
        let inflight = self.inflight.clone();
        let cleanup = DeferredRelease::with_callback(pair.clone(), move || {
            let _ = inflight.fetch_sub(1, Ordering::AcqRel);
            record_inflight(&inflight);
        });

        let (writer, stream) = response_bridge();
        observe_stream_errors(&writer);
        cleanup.attach(&writer);

        let request = TransportRequest::for_endpoint(&self.endpoint_path, headers, body.is_some());
        if let Err(e) = pair.handle(request, writer.clone(), body).await {
            warn!(error = %e, "stateless request failed, releasing connection");
            let _ = cleanup.run().await;
            return Err(e.into());
        }

        let (status, headers) = writer.head_snapshot();
        debug!(status = status.as_u16(), "stateless response ready");
        Ok(TransportResponse::Streaming(StreamingResponse {
            status,
            headers,
            stream,
            session_id: None,
        }))
    }

    /// Nothing to release: every pair is owned by its own call.
    pub async fn shutdown(&self) {
        debug!(inflight = self.inflight(), "stateless transport shut down");
    }

    fn track(&self, delta: usize) {
        let _ = self.inflight.fetch_add(delta, Ordering::AcqRel);
        record_inflight(&self.inflight);
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_inflight(inflight: &AtomicUsize) {
    gauge!(STATELESS_INFLIGHT).set(inflight.load(Ordering::Acquire) as f64);
}

#[async_trait]
impl TransportManager for StatelessManager {
    async fn handle_request(
        &self,
        headers: &HeaderMap,
        body: Option<Value>,
        ctx: &RequestContext,
        session_id: Option<&SessionId>,
    ) -> Result<TransportResponse> {
        if let Some(id) = session_id {
            debug!(session_id = %id, "ignoring session id in stateless mode");
        }
        StatelessManager::handle_request(self, headers, body, ctx).await
    }

    async fn shutdown(&self) {
        StatelessManager::shutdown(self).await;
    }
}
