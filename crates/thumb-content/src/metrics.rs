//! Content store request metrics.

use metrics::{counter, histogram};

pub mod names {
    /// Requests by operation and status.
    pub const REQUESTS_TOTAL: &str = "content_requests_total";

    /// Retry attempts by operation.
    pub const RETRIES_TOTAL: &str = "content_retries_total";

    /// Request latency in seconds by operation.
    pub const LATENCY_SECONDS: &str = "content_latency_seconds";
}

pub fn record_request(operation: &str, status: u16, latency_ms: f64) {
    counter!(
        names::REQUESTS_TOTAL,
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        names::LATENCY_SECONDS,
        "operation" => operation.to_string()
    )
    .record(latency_ms / 1000.0);
}

pub fn record_retry(operation: &str) {
    counter!(
        names::RETRIES_TOTAL,
        "operation" => operation.to_string()
    )
    .increment(1);
}
