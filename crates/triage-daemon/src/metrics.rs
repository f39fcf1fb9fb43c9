//! Process-wide Prometheus metrics, registered in the default registry and
//! rendered by the health listener.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge, TextEncoder,
};

/// Analysis requests admitted or waiting on the concurrency gate.
pub static LLM_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "triage_llm_queue_depth",
        "Analysis requests in flight or queued on the LLM concurrency gate"
    )
    .expect("metric registration")
});

/// Stream entries read, labeled by entry kind.
pub static EVENTS_CONSUMED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "triage_events_consumed_total",
        "Stream entries read from the ingest stream",
        &["kind"]
    )
    .expect("metric registration")
});

/// Entries that reached a terminal outcome, labeled by outcome.
pub static EVENTS_PROCESSED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "triage_events_processed_total",
        "Stream entries that reached a terminal outcome",
        &["outcome"]
    )
    .expect("metric registration")
});

/// Failures by processing stage.
pub static PROCESSING_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "triage_processing_errors_total",
        "Errors during event processing",
        &["stage"]
    )
    .expect("metric registration")
});

/// Stale pending entries force-acked by the reclaim sweep.
pub static PENDING_RECLAIMED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "triage_pending_reclaimed_total",
        "Stale pending stream entries reclaimed"
    )
    .expect("metric registration")
});

/// Render all registered metrics in the Prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    TextEncoder::new().encode_to_string(&prometheus::gather())
}
