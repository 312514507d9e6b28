//! Prometheus metrics for worker loops

use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return the render handle
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// One transcribe call finished
pub fn record_transcribe(elapsed: Duration, failed: bool) {
    ::metrics::histogram!("voxstream_transcribe_seconds").record(elapsed.as_secs_f64());
    if failed {
        ::metrics::counter!("voxstream_model_failures_total", "model" => "stt").increment(1);
    }
}

/// One translate call finished
pub fn record_translate(elapsed: Duration, failed: bool) {
    ::metrics::histogram!("voxstream_translate_seconds").record(elapsed.as_secs_f64());
    if failed {
        ::metrics::counter!("voxstream_model_failures_total", "model" => "mt").increment(1);
    }
}

/// Translation served from the LRU cache
pub fn record_translation_cache_hit() {
    ::metrics::counter!("voxstream_translation_cache_hits_total").increment(1);
}

/// Entries taken over from a crashed or wedged peer
pub fn record_reclaimed(count: usize) {
    ::metrics::counter!("voxstream_reclaimed_entries_total").increment(count as u64);
}
