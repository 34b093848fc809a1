use crate::error::{ExportError, ExportResult};
use metrics::{Counter, Gauge, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

pub struct ExportMetrics {
    timeouts: Counter,
    in_flight: Gauge,
    admission_wait: Histogram,
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl ExportMetrics {
    pub fn new() -> Self {
        Self {
            timeouts: metrics::register_counter!("page_export_timeouts_total"),
            in_flight: metrics::register_gauge!("page_export_in_flight"),
            admission_wait: metrics::register_histogram!("page_export_admission_wait_seconds"),
            started: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn record_started(&self, kind: &'static str) {
        self.started.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("page_export_started_total", "kind" => kind);
    }

    pub fn record_success(&self, kind: &'static str, duration: Duration, bytes: usize) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("page_export_succeeded_total", "kind" => kind);
        metrics::histogram!("page_export_duration_seconds", duration.as_secs_f64(), "kind" => kind);
        metrics::histogram!("page_export_artifact_bytes", bytes as f64, "kind" => kind);
    }

    pub fn record_failure(&self, kind: &'static str, duration: Duration, error: &ExportError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!(
            "page_export_failed_total",
            "kind" => kind,
            "reason" => error.kind_label()
        );
        metrics::histogram!("page_export_duration_seconds", duration.as_secs_f64(), "kind" => kind);
        if matches!(error, ExportError::RequestTimeout(_)) {
            self.timeouts.increment(1);
        }
    }

    pub fn record_admission_wait(&self, waited: Duration) {
        self.admission_wait.record(waited.as_secs_f64());
    }

    pub fn set_in_flight(&self, count: usize) {
        self.in_flight.set(count as f64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for ExportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl MetricsSnapshot {
    pub fn success_rate(&self) -> f64 {
        let finished = self.succeeded + self.failed;
        if finished == 0 {
            return 0.0;
        }
        self.succeeded as f64 / finished as f64 * 100.0
    }
}

pub fn record_navigation(attempts: usize) {
    metrics::counter!("page_export_navigation_attempts_total", attempts as u64);
}

pub fn session_opened() {
    metrics::increment_gauge!("page_export_open_sessions", 1.0);
}

pub fn session_closed() {
    metrics::decrement_gauge!("page_export_open_sessions", 1.0);
}

/// Install the global Prometheus recorder. Call once per process.
pub fn install_prometheus() -> ExportResult<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ExportError::ConfigurationError(format!("metrics recorder: {e}")))?;
    info!("Prometheus metrics recorder installed");
    Ok(handle)
}
