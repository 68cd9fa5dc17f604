//! Per-call correlation context.

use std::fmt;

use crate::ids::RequestId;

/// Opaque, caller-supplied correlation token threaded through every
/// transport operation.
///
/// The transport layer only ever renders it into log spans.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestContext {
    request_id: RequestId,
}

impl RequestContext {
    /// Context with a freshly generated request ID.
    #[must_use]
    pub fn new() -> Self {
        Self {
            request_id: RequestId::generate(),
        }
    }

    /// Context carrying an existing request ID (e.g. from an `x-request-id` header).
    #[must_use]
    pub fn with_request_id(request_id: impl Into<RequestId>) -> Self {
        Self {
            request_id: request_id.into(),
        }
    }

    /// The correlation ID.
    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.request_id.as_str())
    }
}
