//! Prometheus metrics for the worker.

use std::net::SocketAddr;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use thumb_models::{FailureClass, ResultStatus};

use crate::error::{WorkerError, WorkerResult};

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_TOTAL: &str = "thumbnailer_jobs_total";
    pub const RENDITIONS_TOTAL: &str = "thumbnailer_renditions_total";
    pub const JOB_DURATION_SECONDS: &str = "thumbnailer_job_duration_seconds";
}

/// Start the Prometheus scrape endpoint on `0.0.0.0:port`.
pub fn install_exporter(port: u16) -> WorkerResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::config_error(format!("metrics exporter: {}", e)))?;
    info!("Metrics exporter listening on {}", addr);
    Ok(())
}

/// Record a finished job attempt. `class` is `None` on success.
pub fn record_job(class: Option<FailureClass>, duration_secs: f64) {
    let labels = [
        ("outcome", if class.is_none() { "completed" } else { "failed" }.to_string()),
        ("class", class.map(|c| c.as_str()).unwrap_or("none").to_string()),
    ];
    counter!(names::JOBS_TOTAL, &labels).increment(1);
    histogram!(names::JOB_DURATION_SECONDS).record(duration_secs);
}

pub fn record_rendition(status: ResultStatus) {
    let status = match status {
        ResultStatus::Processed => "processed",
        ResultStatus::Failed => "failed",
    };
    counter!(names::RENDITIONS_TOTAL, "status" => status).increment(1);
}
