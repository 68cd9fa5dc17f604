//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// `"stateful"` or `"stateless"`.
    pub mode: String,
    /// Registered sessions (always 0 in stateless mode).
    pub active_sessions: usize,
    /// Stateless connection pairs not yet released (always 0 in stateful mode).
    pub inflight_requests: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    mode: &str,
    active_sessions: usize,
    inflight_requests: usize,
) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        mode: mode.into(),
        active_sessions,
        inflight_requests,
    }
}
