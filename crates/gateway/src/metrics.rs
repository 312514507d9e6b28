//! Prometheus metrics
//!
//! Counters at the dispatch seams. The exporter is installed once per
//! process and rendered by the health listener's `/metrics` route.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::router::DropReason;

/// Install the Prometheus recorder and return the render handle
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// A segment job was published
pub fn record_segment(is_final: bool) {
    let kind = if is_final { "final" } else { "partial" };
    ::metrics::counter!("voxstream_segments_published_total", "kind" => kind).increment(1);
}

/// A result was forwarded to a client
pub fn record_result_forwarded() {
    ::metrics::counter!("voxstream_results_forwarded_total").increment(1);
}

/// A result was dropped by the ordering rules
pub fn record_result_dropped(reason: DropReason) {
    let label = match reason {
        DropReason::StaleEpoch => "stale_epoch",
        DropReason::OutOfOrder => "out_of_order",
        DropReason::Duplicate => "duplicate",
    };
    ::metrics::counter!("voxstream_results_dropped_total", "reason" => label).increment(1);
}

/// A partial emission was refused because the job queue is deep
pub fn record_backpressure() {
    ::metrics::counter!("voxstream_backpressure_rejections_total").increment(1);
}

/// Current live session count
pub fn record_sessions(count: usize) {
    ::metrics::gauge!("voxstream_sessions_active").set(count as f64);
}
