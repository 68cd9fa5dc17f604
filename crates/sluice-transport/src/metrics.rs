//! Metric names emitted by the managers.
//!
//! Recording goes through the `metrics` facade; without an installed
//! recorder every call is a no-op.

/// Sessions registered (counter).
pub const SESSIONS_CREATED_TOTAL: &str = "transport_sessions_created_total";
/// Sessions closed (counter, labels: reason).
pub const SESSIONS_CLOSED_TOTAL: &str = "transport_sessions_closed_total";
/// Registered sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "transport_sessions_active";
/// Stale-session sweeps run (counter).
pub const GC_SWEEPS_TOTAL: &str = "transport_gc_sweeps_total";
/// Stale sessions left alone because they had requests in flight (counter).
pub const GC_SKIPPED_ACTIVE_TOTAL: &str = "transport_gc_skipped_active_total";
/// Stateless calls served (counter).
pub const STATELESS_REQUESTS_TOTAL: &str = "transport_stateless_requests_total";
/// Stateless connection pairs not yet released (gauge).
pub const STATELESS_INFLIGHT: &str = "transport_stateless_inflight";
/// Response streams that ended in an error (counter).
pub const STREAM_ERRORS_TOTAL: &str = "transport_stream_errors_total";

/// Every metric name, for exporters that pre-register descriptions.
pub const ALL: &[&str] = &[
    SESSIONS_CREATED_TOTAL,
    SESSIONS_CLOSED_TOTAL,
    SESSIONS_ACTIVE,
    GC_SWEEPS_TOTAL,
    GC_SKIPPED_ACTIVE_TOTAL,
    STATELESS_REQUESTS_TOTAL,
    STATELESS_INFLIGHT,
    STREAM_ERRORS_TOTAL,
];
