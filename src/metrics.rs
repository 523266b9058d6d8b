//! Export run metrics
//!
//! Counters, gauges and histograms are recorded through the `metrics` facade
//! and are no-ops unless [`init_metrics`] installed the Prometheus exporter.
//!
//! ## Metrics
//!
//! - `exports_completed_total{instance}`
//! - `exports_failed_total{instance, error_kind}`
//! - `exports_skipped_total{instance}`
//! - `export_retries_total{instance, error_kind}`
//! - `exports_in_flight{instance}`
//! - `export_duration_seconds{instance}`
//! - `archive_bytes_total{instance}`

use crate::export::ErrorKind;
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Global metrics registry initialization flag
static METRICS_INITIALIZED: Lazy<Arc<RwLock<bool>>> = Lazy::new(|| Arc::new(RwLock::new(false)));

/// Metrics errors
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Exporter could not be installed
    #[error("failed to install Prometheus exporter on {addr}: {message}")]
    InstallFailed {
        /// Requested listen address
        addr: SocketAddr,
        /// Underlying error
        message: String,
    },
}

/// Install the Prometheus exporter listening on `addr`.
///
/// Idempotent: later calls are no-ops.
pub async fn init_metrics(addr: SocketAddr) -> Result<(), MetricsError> {
    let mut initialized = METRICS_INITIALIZED.write().await;
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::InstallFailed {
            addr,
            message: e.to_string(),
        })?;

    describe_counter!(
        "exports_completed_total",
        Unit::Count,
        "Project archives downloaded, verified and recorded"
    );
    describe_counter!(
        "exports_failed_total",
        Unit::Count,
        "Export jobs that ended in Failed"
    );
    describe_counter!(
        "exports_skipped_total",
        Unit::Count,
        "Projects skipped because an earlier run completed them"
    );
    describe_counter!(
        "export_retries_total",
        Unit::Count,
        "Export attempts restarted after a retryable failure"
    );
    describe_gauge!(
        "exports_in_flight",
        Unit::Count,
        "Export jobs currently holding a concurrency slot"
    );
    describe_histogram!(
        "export_duration_seconds",
        Unit::Seconds,
        "Wall time of completed export jobs"
    );
    describe_counter!(
        "archive_bytes_total",
        Unit::Bytes,
        "Archive bytes written to disk"
    );

    *initialized = true;
    info!("Metrics exporter listening on {}", addr);
    Ok(())
}

/// Check if the exporter is installed
pub async fn is_initialized() -> bool {
    *METRICS_INITIALIZED.read().await
}

/// Per-job metrics
pub struct ExportMetrics {
    instance: String,
    start_time: Instant,
}

impl ExportMetrics {
    /// Start timing a job
    pub fn start(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            start_time: Instant::now(),
        }
    }

    /// Job completed with `bytes` written
    pub fn record_success(&self, bytes: u64) {
        let duration = self.start_time.elapsed();
        counter!("exports_completed_total", "instance" => self.instance.clone()).increment(1);
        histogram!("export_duration_seconds", "instance" => self.instance.clone())
            .record(duration.as_secs_f64());
        debug!(instance = %self.instance, bytes, duration_ms = duration.as_millis() as u64, "Export metrics recorded");
    }

    /// Job failed
    pub fn record_failure(&self, kind: ErrorKind) {
        counter!(
            "exports_failed_total",
            "instance" => self.instance.clone(),
            "error_kind" => kind.to_string(),
        )
        .increment(1);
    }

    /// Attempt restarted after `kind`, waiting `backoff`
    pub fn record_retry(&self, kind: ErrorKind, backoff: Duration) {
        counter!(
            "export_retries_total",
            "instance" => self.instance.clone(),
            "error_kind" => kind.to_string(),
        )
        .increment(1);
        debug!(
            instance = %self.instance,
            error_kind = %kind,
            backoff_ms = backoff.as_millis() as u64,
            "Retry recorded"
        );
    }

    /// Archive chunk written
    pub fn record_bytes(&self, bytes: u64) {
        counter!("archive_bytes_total", "instance" => self.instance.clone()).increment(bytes);
    }
}

/// Project skipped through the ledger
pub fn record_skipped(instance: &str) {
    counter!("exports_skipped_total", "instance" => instance.to_string()).increment(1);
}

/// Current number of jobs holding a concurrency slot
pub fn set_in_flight(instance: &str, count: usize) {
    gauge!("exports_in_flight", "instance" => instance.to_string()).set(count as f64);
}
