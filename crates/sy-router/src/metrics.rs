//! Metric names and recording helpers

pub const CACHE_HITS: &str = "switchyard_producer_cache_hits_total";
pub const CACHE_MISSES: &str = "switchyard_producer_cache_misses_total";
pub const CACHE_EVICTIONS: &str = "switchyard_producer_cache_evictions_total";
pub const EXCHANGES_COMPLETED: &str = "switchyard_exchanges_completed_total";
pub const EXCHANGES_FAILED: &str = "switchyard_exchanges_failed_total";
pub const REDELIVERIES: &str = "switchyard_redeliveries_total";
pub const POLL_ERRORS: &str = "switchyard_poll_errors_total";
pub const INFLIGHT: &str = "switchyard_inflight_exchanges";

pub fn cache_hit() {
    metrics::counter!(CACHE_HITS).increment(1);
}

pub fn cache_miss() {
    metrics::counter!(CACHE_MISSES).increment(1);
}

pub fn cache_eviction() {
    metrics::counter!(CACHE_EVICTIONS).increment(1);
}

pub fn exchange_completed(route_id: &str) {
    metrics::counter!(EXCHANGES_COMPLETED, "route" => route_id.to_string()).increment(1);
}

pub fn exchange_failed(route_id: &str, label: &'static str) {
    metrics::counter!(
        EXCHANGES_FAILED,
        "route" => route_id.to_string(),
        "error" => label
    )
    .increment(1);
}

pub fn redelivery(attempt: u32) {
    metrics::counter!(REDELIVERIES).increment(1);
    tracing::trace!(attempt, "Redelivery attempt recorded");
}

pub fn poll_error(endpoint: &str) {
    metrics::counter!(POLL_ERRORS, "endpoint" => endpoint.to_string()).increment(1);
}

pub fn inflight(route_id: &str, count: usize) {
    metrics::gauge!(INFLIGHT, "route" => route_id.to_string()).set(count as f64);
}
