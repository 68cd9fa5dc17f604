//! Error hierarchy for the transport layer.
//!
//! - [`TransportError`]: everything a manager can report to its caller
//! - [`ConnectionError`]: failures raised by the connection collaborator
//!   (factory, request driving, close)
//!
//! `InvalidInput`, `SessionNotFound` and `SessionLimitReached` are rendered as
//! buffered error responses by the managers and never escape them.
//! `InitializationFailure` and `Connection` propagate to the outer binding.

use serde_json::{Value, json};
use thiserror::Error;

use crate::ids::SessionId;

/// JSON-RPC error code for malformed transport-level requests.
pub const JSONRPC_BAD_REQUEST: i64 = -32000;
/// JSON-RPC error code for unknown or expired sessions.
pub const JSONRPC_SESSION_NOT_FOUND: i64 = -32001;
/// JSON-RPC error code for unparseable request bodies.
pub const JSONRPC_PARSE_ERROR: i64 = -32700;
/// JSON-RPC error code for internal failures.
pub const JSONRPC_INTERNAL_ERROR: i64 = -32603;

/// Error raised by a connection collaborator.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The factory could not build the connection pair.
    #[error("connection construction failed: {0}")]
    Construction(String),
    /// The connection failed while handling a request.
    #[error("request handling failed: {0}")]
    Request(String),
    /// Releasing the connection failed.
    #[error("connection close failed: {0}")]
    Close(String),
}

/// Error reported by a transport manager.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A required input (usually the session ID) was missing or malformed.
    #[error("Bad Request: {0}")]
    InvalidInput(String),

    /// The session ID is unknown or the session has expired.
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// The registry is at capacity.
    #[error("Session limit reached ({limit} active sessions)")]
    SessionLimitReached {
        /// Configured maximum.
        limit: usize,
    },

    /// The connection factory or the connect step failed.
    #[error("Session initialization failed: {source}")]
    InitializationFailure {
        /// Underlying cause.
        #[source]
        source: ConnectionError,
    },

    /// The response stream failed after it was handed to the caller.
    #[error("Response stream failed: {0}")]
    StreamFailure(String),

    /// The connection failed while driving a request on an established session.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl TransportError {
    /// Wrap a connection error raised before a session was registered.
    #[must_use]
    pub fn initialization(source: ConnectionError) -> Self {
        Self::InitializationFailure { source }
    }

    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::SessionLimitReached { .. } => "SESSION_LIMIT_REACHED",
            Self::InitializationFailure { .. } => "INITIALIZATION_FAILURE",
            Self::StreamFailure(_) => "STREAM_FAILURE",
            Self::Connection(_) => "CONNECTION_ERROR",
        }
    }

    /// HTTP status used when the error is rendered onto the wire.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::SessionNotFound(_) => 404,
            Self::SessionLimitReached { .. } => 503,
            Self::InitializationFailure { .. } | Self::StreamFailure(_) | Self::Connection(_) => {
                500
            }
        }
    }

    /// JSON-RPC error code used in the error payload.
    #[must_use]
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            Self::InvalidInput(_) | Self::SessionLimitReached { .. } => JSONRPC_BAD_REQUEST,
            Self::SessionNotFound(_) => JSONRPC_SESSION_NOT_FOUND,
            Self::InitializationFailure { .. } | Self::StreamFailure(_) | Self::Connection(_) => {
                JSONRPC_INTERNAL_ERROR
            }
        }
    }

    /// Whether managers convert this error into a buffered response instead
    /// of returning it.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_) | Self::SessionNotFound(_) | Self::SessionLimitReached { .. }
        )
    }

    /// JSON-RPC error envelope for this error.
    #[must_use]
    pub fn to_jsonrpc(&self) -> Value {
        jsonrpc_error(self.jsonrpc_code(), &self.to_string())
    }
}

/// Build a JSON-RPC error envelope with a null `id`.
#[must_use]
pub fn jsonrpc_error(code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": {
            "code": code,
            "message": message,
        },
        "id": null,
    })
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
