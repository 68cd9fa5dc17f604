//! HTTP binding of the protocol endpoint.
//!
//! Maps `POST`/`GET`/`DELETE` on the endpoint onto whichever manager is
//! wired in, and renders the [`TransportResponse`] it returns onto the wire.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{ALLOW, HeaderName, HeaderValue};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use serde_json::Value;
use sluice_core::errors::{JSONRPC_BAD_REQUEST, JSONRPC_PARSE_ERROR, jsonrpc_error};
use sluice_core::{RequestContext, Result, SessionId, TransportError};
use sluice_settings::TransportMode;
use sluice_transport::{
    SESSION_ID_HEADER, StatefulManager, StatelessManager, TransportResponse,
    session_id_from_headers,
};
use tracing::{debug, error};

use crate::server::AppState;

/// Header carrying the per-call correlation ID, in both directions.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The manager wired behind the endpoint.
pub enum Transport {
    /// Persistent sessions.
    Stateful(Arc<StatefulManager>),
    /// One connection pair per call.
    Stateless(Arc<StatelessManager>),
}

impl Transport {
    /// Which mode this is.
    pub fn mode(&self) -> TransportMode {
        match self {
            Self::Stateful(_) => TransportMode::Stateful,
            Self::Stateless(_) => TransportMode::Stateless,
        }
    }

    /// Registered sessions (0 in stateless mode).
    pub fn active_sessions(&self) -> usize {
        match self {
            Self::Stateful(m) => m.session_count(),
            Self::Stateless(_) => 0,
        }
    }

    /// Unreleased stateless connection pairs (0 in stateful mode).
    pub fn inflight(&self) -> usize {
        match self {
            Self::Stateful(_) => 0,
            Self::Stateless(m) => m.inflight(),
        }
    }

    /// Release everything the wired manager owns.
    pub async fn shutdown(&self) {
        match self {
            Self::Stateful(m) => m.shutdown().await,
            Self::Stateless(m) => m.shutdown().await,
        }
    }
}

/// Whether `body` is a JSON-RPC `initialize` request, alone or in a batch.
pub fn is_initialize_request(body: &Value) -> bool {
    fn is_initialize(msg: &Value) -> bool {
        msg.get("method").and_then(Value::as_str) == Some("initialize")
    }
    match body {
        Value::Array(batch) => batch.iter().any(is_initialize),
        other => is_initialize(other),
    }
}

/// POST {endpoint}
pub(crate) async fn handle_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = request_context(&headers);
    let body: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            debug!(request_id = %ctx, error = %e, "malformed request body");
            let payload = jsonrpc_error(JSONRPC_PARSE_ERROR, &format!("Parse error: {e}"));
            return render(
                Ok(TransportResponse::buffered_json(StatusCode::BAD_REQUEST, &payload)),
                &ctx,
            );
        }
    };

    let result = match state.transport.as_ref() {
        Transport::Stateful(manager) => post_stateful(manager, &headers, body, &ctx).await,
        Transport::Stateless(manager) => manager.handle_request(&headers, Some(body), &ctx).await,
    };
    render(result, &ctx)
}

async fn post_stateful(
    manager: &StatefulManager,
    headers: &HeaderMap,
    body: Value,
    ctx: &RequestContext,
) -> Result<TransportResponse> {
    match session_header(headers) {
        Ok(Some(id)) => manager.handle_request(headers, Some(body), ctx, Some(&id)).await,
        Ok(None) if is_initialize_request(&body) => {
            manager.initialize_and_handle(headers, Some(body), ctx).await
        }
        Ok(None) => Ok(TransportResponse::from_error(&TransportError::InvalidInput(
            format!("{SESSION_ID_HEADER} header is required for non-initialize requests"),
        ))),
        Err(err) => Ok(TransportResponse::from_error(&err)),
    }
}

/// GET {endpoint}
pub(crate) async fn handle_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let ctx = request_context(&headers);
    let result = match state.transport.as_ref() {
        Transport::Stateful(manager) => match session_header(&headers) {
            Ok(id) => manager.handle_request(&headers, None, &ctx, id.as_ref()).await,
            Err(err) => Ok(TransportResponse::from_error(&err)),
        },
        Transport::Stateless(_) => return method_not_allowed(&ctx),
    };
    render(result, &ctx)
}

/// DELETE {endpoint}
pub(crate) async fn handle_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let ctx = request_context(&headers);
    let result = match state.transport.as_ref() {
        Transport::Stateful(manager) => match session_header(&headers) {
            Ok(Some(id)) => manager.handle_delete_request(&id, &ctx).await,
            Ok(None) => Ok(TransportResponse::from_error(&TransportError::InvalidInput(
                format!("{SESSION_ID_HEADER} header is required"),
            ))),
            Err(err) => Ok(TransportResponse::from_error(&err)),
        },
        Transport::Stateless(_) => return method_not_allowed(&ctx),
    };
    render(result, &ctx)
}

/// `Ok(None)` when the header is absent, `Err` when it is present but unusable.
fn session_header(headers: &HeaderMap) -> std::result::Result<Option<SessionId>, TransportError> {
    if !headers.contains_key(SESSION_ID_HEADER) {
        return Ok(None);
    }
    session_id_from_headers(headers).map(Some).ok_or_else(|| {
        TransportError::InvalidInput(format!("malformed {SESSION_ID_HEADER} header"))
    })
}

fn request_context(headers: &HeaderMap) -> RequestContext {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map_or_else(RequestContext::new, RequestContext::with_request_id)
}

fn method_not_allowed(ctx: &RequestContext) -> Response {
    let payload = jsonrpc_error(JSONRPC_BAD_REQUEST, "Method not allowed in stateless mode");
    let mut response = render(
        Ok(TransportResponse::buffered_json(
            StatusCode::METHOD_NOT_ALLOWED,
            &payload,
        )),
        ctx,
    );
    let _ = response
        .headers_mut()
        .insert(ALLOW, HeaderValue::from_static("POST"));
    response
}

/// Render a manager result as an HTTP response.
///
/// Errors that escape a manager become buffered JSON-RPC internal errors.
fn render(result: Result<TransportResponse>, ctx: &RequestContext) -> Response {
    let transport_response = match result {
        Ok(resp) => resp,
        Err(err) if err.is_client_error() => {
            debug!(request_id = %ctx, code = err.code(), error = %err, "transport request rejected");
            TransportResponse::from_error(&err)
        }
        Err(err) => {
            error!(request_id = %ctx, code = err.code(), error = %err, "transport request failed");
            TransportResponse::from_error(&err)
        }
    };

    let mut response = match transport_response {
        TransportResponse::Buffered(buffered) => {
            let mut response = Response::new(Body::from(buffered.body));
            *response.status_mut() = buffered.status;
            *response.headers_mut() = buffered.headers;
            response
        }
        TransportResponse::Streaming(streaming) => {
            let mut response = Response::new(Body::from_stream(streaming.stream));
            *response.status_mut() = streaming.status;
            *response.headers_mut() = streaming.headers;
            if let Some(id) = streaming.session_id {
                insert_if_absent(
                    response.headers_mut(),
                    HeaderName::from_static(SESSION_ID_HEADER),
                    id.as_str(),
                );
            }
            response
        }
    };

    insert_if_absent(
        response.headers_mut(),
        HeaderName::from_static(REQUEST_ID_HEADER),
        ctx.request_id().as_str(),
    );
    response
}

fn insert_if_absent(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if headers.contains_key(&name) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(value) {
        let _ = headers.insert(name, value);
    }
}
