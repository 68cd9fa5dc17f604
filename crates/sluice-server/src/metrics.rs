//! Prometheus metrics recorder and `/metrics` rendering.

use metrics::{Unit, describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use sluice_transport::metrics as names;
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Fails if another recorder
/// is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_transport_metrics();
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

fn describe_transport_metrics() {
    describe_counter!(names::SESSIONS_CREATED_TOTAL, "Sessions registered");
    describe_counter!(names::SESSIONS_CLOSED_TOTAL, "Sessions closed, by reason");
    describe_gauge!(names::SESSIONS_ACTIVE, Unit::Count, "Registered sessions");
    describe_counter!(names::GC_SWEEPS_TOTAL, "Stale-session sweeps run");
    describe_counter!(
        names::GC_SKIPPED_ACTIVE_TOTAL,
        "Stale sessions skipped because requests were in flight"
    );
    describe_counter!(names::STATELESS_REQUESTS_TOTAL, "Stateless calls served");
    describe_gauge!(
        names::STATELESS_INFLIGHT,
        Unit::Count,
        "Stateless connection pairs not yet released"
    );
    describe_counter!(names::STREAM_ERRORS_TOTAL, "Response streams that failed");
}
