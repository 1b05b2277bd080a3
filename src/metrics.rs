use tracing::trace;

// Counters are emitted as trace events so the crate does not depend on the
// `metrics` macros directly; the Prometheus exporter only serves /metrics.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "listing.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn llm_attempt(model: &str, success: bool) {
    trace!(
        target = "listing.metrics",
        model = model,
        success,
        "llm_attempts_total_inc"
    );
}

pub fn record_outcome(enhanced: bool) {
    trace!(
        target = "listing.metrics",
        enhanced,
        "records_total_inc"
    );
}

pub fn batch_elapsed(elapsed_ms: u128) {
    trace!(
        target = "listing.metrics",
        elapsed_ms = elapsed_ms as u64,
        "batch_elapsed"
    );
}
