//! Uniform manager contract and the session header convention.

use async_trait::async_trait;
use http::HeaderMap;
use serde_json::Value;
use sluice_core::{RequestContext, Result, SessionId};

use crate::response::TransportResponse;

/// Header carrying the session identifier, in both directions.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Read a usable session ID from inbound headers.
///
/// Missing, non-UTF-8, blank, or non-header-safe values yield `None`.
pub fn session_id_from_headers(headers: &HeaderMap) -> Option<SessionId> {
    let raw = headers.get(SESSION_ID_HEADER)?.to_str().ok()?.trim();
    let id = SessionId::from(raw);
    id.is_header_safe().then_some(id)
}

/// Interface implemented by both transport managers.
///
/// Callers branch on the returned variant and, when a streaming response
/// carries a session ID, surface it as [`SESSION_ID_HEADER`].
#[async_trait]
pub trait TransportManager: Send + Sync {
    /// Serve one call.
    ///
    /// Client errors (missing or unknown session) come back as buffered
    /// responses; only connection failures are returned as `Err`.
    async fn handle_request(
        &self,
        headers: &HeaderMap,
        body: Option<Value>,
        ctx: &RequestContext,
        session_id: Option<&SessionId>,
    ) -> Result<TransportResponse>;

    /// Release everything the manager owns.
    async fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn reads_trimmed_session_id() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(SESSION_ID_HEADER, HeaderValue::from_static(" abc123 "));
        assert_eq!(
            session_id_from_headers(&headers).as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        let name = http::HeaderName::from_bytes(b"Mcp-Session-Id").unwrap();
        let _ = headers.insert(name, HeaderValue::from_static("xyz"));
        assert!(session_id_from_headers(&headers).is_some());
    }

    #[test]
    fn blank_or_missing_is_none() {
        assert!(session_id_from_headers(&HeaderMap::new()).is_none());
        let mut headers = HeaderMap::new();
        let _ = headers.insert(SESSION_ID_HEADER, HeaderValue::from_static("   "));
        assert!(session_id_from_headers(&headers).is_none());
    }
}
