//! # Flight Metrics - Observability
//!
//! Prometheus metrics for the flight tracking engine:
//! - Ingestion and session lifecycle
//! - Geofence violations and RTH decisions
//! - Background job health
//! - WebSocket connections and API requests

use flight_core::SessionStatus;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use tracing::{info, warn};

/// Metrics collector for the flight tracker
pub struct MetricsCollector {
    registry: Registry,

    // Ingestion metrics
    points_ingested: IntCounter,
    batch_size: Histogram,

    // Session metrics
    sessions_created: IntCounter,
    sessions_ended: IntCounterVec,
    sessions_reaped: IntCounter,

    // Geofence & RTH metrics
    violations_opened: IntCounterVec,
    violations_closed: IntCounter,
    rth_estimates: IntCounterVec,
    rth_triggered: IntCounter,

    // Background job metrics
    jobs_failed: IntCounterVec,
    jobs_dropped: IntCounter,
    job_duration: HistogramVec,

    // WebSocket metrics
    ws_connections: IntGauge,
    ws_messages_sent: IntCounter,
    ws_messages_dropped: IntCounter,

    // API metrics
    api_requests_total: IntCounterVec,
    api_request_duration: HistogramVec,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        // Ingestion metrics
        let points_ingested = IntCounter::new(
            "flight_tracker_points_ingested_total",
            "Telemetry points durably recorded",
        )?;
        registry.register(Box::new(points_ingested.clone()))?;

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("flight_tracker_batch_size", "Points per batch upload")
                .buckets(vec![1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]),
        )?;
        registry.register(Box::new(batch_size.clone()))?;

        // Session metrics
        let sessions_created = IntCounter::new(
            "flight_tracker_sessions_created_total",
            "Flight sessions created",
        )?;
        registry.register(Box::new(sessions_created.clone()))?;

        let sessions_ended = IntCounterVec::new(
            Opts::new("flight_tracker_sessions_ended_total", "Flight sessions ended"),
            &["status"],
        )?;
        registry.register(Box::new(sessions_ended.clone()))?;

        let sessions_reaped = IntCounter::new(
            "flight_tracker_sessions_reaped_total",
            "Idle sessions force-completed by the reaper",
        )?;
        registry.register(Box::new(sessions_reaped.clone()))?;

        // Geofence & RTH metrics
        let violations_opened = IntCounterVec::new(
            Opts::new(
                "flight_tracker_zone_violations_opened_total",
                "Danger zone violations opened",
            ),
            &["severity"],
        )?;
        registry.register(Box::new(violations_opened.clone()))?;

        let violations_closed = IntCounter::new(
            "flight_tracker_zone_violations_closed_total",
            "Danger zone violations closed",
        )?;
        registry.register(Box::new(violations_closed.clone()))?;

        let rth_estimates = IntCounterVec::new(
            Opts::new("flight_tracker_rth_estimates_total", "RTH estimates by urgency"),
            &["urgency"],
        )?;
        registry.register(Box::new(rth_estimates.clone()))?;

        let rth_triggered = IntCounter::new(
            "flight_tracker_rth_triggered_total",
            "RTH commands issued",
        )?;
        registry.register(Box::new(rth_triggered.clone()))?;

        // Background job metrics
        let jobs_failed = IntCounterVec::new(
            Opts::new("flight_tracker_jobs_failed_total", "Background jobs that failed"),
            &["job"],
        )?;
        registry.register(Box::new(jobs_failed.clone()))?;

        let jobs_dropped = IntCounter::new(
            "flight_tracker_jobs_dropped_total",
            "Background jobs dropped because the engine was shut down",
        )?;
        registry.register(Box::new(jobs_dropped.clone()))?;

        let job_duration = HistogramVec::new(
            HistogramOpts::new(
                "flight_tracker_job_duration_seconds",
                "Background job duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
            &["job"],
        )?;
        registry.register(Box::new(job_duration.clone()))?;

        // WebSocket metrics
        let ws_connections = IntGauge::new(
            "flight_tracker_ws_connections",
            "Active WebSocket connections",
        )?;
        registry.register(Box::new(ws_connections.clone()))?;

        let ws_messages_sent = IntCounter::new(
            "flight_tracker_ws_messages_sent_total",
            "WebSocket messages queued for delivery",
        )?;
        registry.register(Box::new(ws_messages_sent.clone()))?;

        let ws_messages_dropped = IntCounter::new(
            "flight_tracker_ws_messages_dropped_total",
            "WebSocket messages dropped for slow consumers",
        )?;
        registry.register(Box::new(ws_messages_dropped.clone()))?;

        // API metrics
        let api_requests_total = IntCounterVec::new(
            Opts::new("flight_tracker_api_requests_total", "API requests"),
            &["method", "path", "status"],
        )?;
        registry.register(Box::new(api_requests_total.clone()))?;

        let api_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "flight_tracker_api_request_duration_seconds",
                "API request duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["method", "path"],
        )?;
        registry.register(Box::new(api_request_duration.clone()))?;

        info!("Metrics collector initialized");

        Ok(Self {
            registry,
            points_ingested,
            batch_size,
            sessions_created,
            sessions_ended,
            sessions_reaped,
            violations_opened,
            violations_closed,
            rth_estimates,
            rth_triggered,
            jobs_failed,
            jobs_dropped,
            job_duration,
            ws_connections,
            ws_messages_sent,
            ws_messages_dropped,
            api_requests_total,
            api_request_duration,
        })
    }

    /// Get Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    // ========================================================================
    // INGESTION METRICS
    // ========================================================================

    pub fn record_points_ingested(&self, count: usize) {
        self.points_ingested.inc_by(count as u64);
    }

    pub fn record_batch(&self, size: usize) {
        self.batch_size.observe(size as f64);
    }

    // ========================================================================
    // SESSION METRICS
    // ========================================================================

    pub fn record_session_created(&self) {
        self.sessions_created.inc();
    }

    /// Record a session reaching a terminal status
    pub fn record_session_ended(&self, status: SessionStatus) {
        self.sessions_ended.with_label_values(&[status.as_str()]).inc();
    }

    pub fn record_sessions_reaped(&self, count: usize) {
        self.sessions_reaped.inc_by(count as u64);
    }

    // ========================================================================
    // GEOFENCE & RTH METRICS
    // ========================================================================

    pub fn record_violation_opened(&self, severity: &str) {
        self.violations_opened.with_label_values(&[severity]).inc();
    }

    pub fn record_violation_closed(&self) {
        self.violations_closed.inc();
    }

    pub fn record_rth_estimate(&self, urgency: &str) {
        self.rth_estimates.with_label_values(&[urgency]).inc();
    }

    pub fn record_rth_triggered(&self) {
        self.rth_triggered.inc();
    }

    // ========================================================================
    // BACKGROUND JOB METRICS
    // ========================================================================

    /// Record a finished background job
    pub fn record_job(&self, job: &str, duration_secs: f64, succeeded: bool) {
        self.job_duration.with_label_values(&[job]).observe(duration_secs);
        if !succeeded {
            self.jobs_failed.with_label_values(&[job]).inc();
        }
    }

    pub fn record_job_dropped(&self) {
        self.jobs_dropped.inc();
    }

    // ========================================================================
    // WEBSOCKET METRICS
    // ========================================================================

    /// Set WebSocket connection count
    pub fn set_ws_connections(&self, count: i64) {
        self.ws_connections.set(count);
    }

    /// Record WebSocket fan-out: `sent` queued, `dropped` discarded
    pub fn record_ws_delivery(&self, sent: usize, dropped: usize) {
        self.ws_messages_sent.inc_by(sent as u64);
        self.ws_messages_dropped.inc_by(dropped as u64);
    }

    // ========================================================================
    // API METRICS
    // ========================================================================

    /// Record API request
    pub fn record_api_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        self.api_requests_total
            .with_label_values(&[method, path, &status.to_string()])
            .inc();
        self.api_request_duration
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = MetricsCollector::new();
        assert!(metrics.is_ok());
    }

    #[test]
    fn test_metrics_export() {
        let metrics = MetricsCollector::new().unwrap();

        metrics.record_points_ingested(3);
        metrics.set_ws_connections(5);
        metrics.record_session_ended(SessionStatus::Completed);

        let export = metrics.export();
        assert!(export.contains("flight_tracker_points_ingested_total 3"));
        assert!(export.contains("flight_tracker_ws_connections 5"));
        assert!(export.contains("status=\"completed\""));
    }

    #[test]
    fn test_job_failures_labelled() {
        let metrics = MetricsCollector::new().unwrap();

        metrics.record_job("geofence", 0.01, false);
        metrics.record_job("recompute", 0.02, true);

        let export = metrics.export();
        assert!(export.contains("flight_tracker_jobs_failed_total{job=\"geofence\"} 1"));
        assert!(!export.contains("flight_tracker_jobs_failed_total{job=\"recompute\"}"));
    }
}
