//! Uniform return contract of both transport managers.

use std::fmt;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, StatusCode};
use serde_json::Value;
use sluice_core::{SessionId, TransportError};

use crate::bridge::ResponseStream;

/// A fully materialized response.
#[derive(Clone, Debug)]
pub struct BufferedResponse {
    /// HTTP status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Body bytes.
    pub body: Bytes,
}

/// A response whose body is still being produced by a connection.
pub struct StreamingResponse {
    /// HTTP status at the time the head was captured.
    pub status: StatusCode,
    /// Response headers, converted from the legacy header map.
    pub headers: HeaderMap,
    /// Body byte stream.
    pub stream: ResponseStream,
    /// Session the response belongs to, if any.
    pub session_id: Option<SessionId>,
}

impl fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Either a buffered or a streaming response.
#[derive(Debug)]
pub enum TransportResponse {
    /// Fully materialized body.
    Buffered(BufferedResponse),
    /// Body delivered incrementally.
    Streaming(StreamingResponse),
}

impl TransportResponse {
    /// Buffered JSON response.
    pub fn buffered_json(status: StatusCode, body: &Value) -> Self {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self::Buffered(BufferedResponse {
            status,
            headers,
            body: Bytes::from(body.to_string()),
        })
    }

    /// Buffered JSON-RPC error response for `err`.
    pub fn from_error(err: &TransportError) -> Self {
        let status = StatusCode::from_u16(err.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::buffered_json(status, &err.to_jsonrpc())
    }

    /// HTTP status.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Buffered(r) => r.status,
            Self::Streaming(r) => r.status,
        }
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        match self {
            Self::Buffered(r) => &r.headers,
            Self::Streaming(r) => &r.headers,
        }
    }

    /// Session ID for streaming responses that belong to a session.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Buffered(_) => None,
            Self::Streaming(r) => r.session_id.as_ref(),
        }
    }

    /// Whether the body is a stream.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming(_))
    }

    /// `"buffered"` or `"streaming"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Buffered(_) => "buffered",
            Self::Streaming(_) => "streaming",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::response_bridge;
    use serde_json::json;

    #[test]
    fn from_error_renders_jsonrpc_envelope() {
        let err = TransportError::SessionNotFound(SessionId::from("abc"));
        let resp = TransportResponse::from_error(&err);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.kind(), "buffered");
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");

        let TransportResponse::Buffered(buf) = resp else {
            panic!("expected buffered response");
        };
        let body: Value = serde_json::from_slice(&buf.body).unwrap();
        assert_eq!(body["jsonrpc"], "2.0");
        assert_eq!(body["error"]["code"], -32001);
        assert!(body["id"].is_null());
    }

    #[test]
    fn buffered_has_no_session_id() {
        let resp = TransportResponse::buffered_json(StatusCode::OK, &json!({"success": true}));
        assert!(resp.session_id().is_none());
        assert!(!resp.is_streaming());
    }

    #[test]
    fn streaming_exposes_session_id() {
        let (_writer, stream) = response_bridge();
        let resp = TransportResponse::Streaming(StreamingResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            stream,
            session_id: Some(SessionId::from("s-1")),
        });
        assert!(resp.is_streaming());
        assert_eq!(resp.kind(), "streaming");
        assert_eq!(resp.session_id().map(SessionId::as_str), Some("s-1"));
    }
}
