//! Metrics collection for wp-batch.
//!
//! Tracks REST traffic, fallback usage and job outcomes so a run can be
//! summarized and so tests can observe how many requests were in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Global metrics instance.
static METRICS: std::sync::OnceLock<Arc<Metrics>> = std::sync::OnceLock::new();

/// Get the global metrics instance.
pub fn get_metrics() -> &'static Arc<Metrics> {
    METRICS.get_or_init(|| Arc::new(Metrics::new()))
}

/// Run metrics collector.
#[derive(Debug)]
pub struct Metrics {
    // === Request Metrics ===
    /// Total REST requests issued (including retries)
    pub http_requests_total: AtomicU64,
    /// REST requests currently in flight
    pub http_requests_active: AtomicU64,
    /// Highest value `http_requests_active` has reached
    pub http_requests_active_peak: AtomicU64,
    /// Responses by status code category (2xx, 4xx, 5xx)
    pub http_requests_2xx: AtomicU64,
    pub http_requests_4xx: AtomicU64,
    pub http_requests_5xx: AtomicU64,
    /// Total request latency in microseconds
    pub http_request_latency_us_total: AtomicU64,
    /// Request count for average calculation
    pub http_request_latency_count: AtomicU64,

    // === Retry Metrics ===
    /// Requests re-issued after a retryable failure
    pub retries_total: AtomicU64,
    /// 429 responses received
    pub rate_limited_total: AtomicU64,
    /// 401/403 responses received
    pub auth_expired_total: AtomicU64,
    /// Timeouts and connection failures
    pub network_errors_total: AtomicU64,

    // === Transport Metrics ===
    /// Credential resyncs performed
    pub credential_syncs: AtomicU64,
    /// Jobs that reached the fallback transport
    pub fallback_attempts: AtomicU64,
    /// Fallback attempts that published the job
    pub fallback_successes: AtomicU64,
    /// Browser driver initializations
    pub driver_inits: AtomicU64,

    // === Job Metrics ===
    /// Jobs that reached a terminal success
    pub jobs_succeeded: AtomicU64,
    /// Jobs that ended permanently failed
    pub jobs_failed: AtomicU64,
    /// Jobs given a retry-queue attempt
    pub jobs_retried: AtomicU64,
}

impl Metrics {
    /// Create a new metrics instance with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            http_requests_total: AtomicU64::new(0),
            http_requests_active: AtomicU64::new(0),
            http_requests_active_peak: AtomicU64::new(0),
            http_requests_2xx: AtomicU64::new(0),
            http_requests_4xx: AtomicU64::new(0),
            http_requests_5xx: AtomicU64::new(0),
            http_request_latency_us_total: AtomicU64::new(0),
            http_request_latency_count: AtomicU64::new(0),

            retries_total: AtomicU64::new(0),
            rate_limited_total: AtomicU64::new(0),
            auth_expired_total: AtomicU64::new(0),
            network_errors_total: AtomicU64::new(0),

            credential_syncs: AtomicU64::new(0),
            fallback_attempts: AtomicU64::new(0),
            fallback_successes: AtomicU64::new(0),
            driver_inits: AtomicU64::new(0),

            jobs_succeeded: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
        }
    }

    /// Record a REST response.
    pub fn record_http_request(&self, status_code: u16, latency: Duration) {
        self.http_requests_total.fetch_add(1, Ordering::Relaxed);

        match status_code {
            200..=299 => self.http_requests_2xx.fetch_add(1, Ordering::Relaxed),
            400..=499 => self.http_requests_4xx.fetch_add(1, Ordering::Relaxed),
            500..=599 => self.http_requests_5xx.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };

        self.http_request_latency_us_total
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.http_request_latency_count
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Start tracking an in-flight request.
    pub fn start_request(&self) {
        let active = self.http_requests_active.fetch_add(1, Ordering::SeqCst) + 1;
        self.http_requests_active_peak
            .fetch_max(active, Ordering::SeqCst);
    }

    /// End tracking an in-flight request.
    pub fn end_request(&self) {
        self.http_requests_active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Record a retry of any kind.
    pub fn record_retry(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a 429 response.
    pub fn record_rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a 401/403 response.
    pub fn record_auth_expired(&self) {
        self.auth_expired_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a timeout or connection failure.
    pub fn record_network_error(&self) {
        self.network_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a credential resync.
    pub fn record_credential_sync(&self) {
        self.credential_syncs.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fallback attempt and its result.
    pub fn record_fallback(&self, success: bool) {
        self.fallback_attempts.fetch_add(1, Ordering::Relaxed);
        if success {
            self.fallback_successes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a browser driver initialization.
    pub fn record_driver_init(&self) {
        self.driver_inits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job's terminal outcome.
    pub fn record_job(&self, success: bool) {
        if success {
            self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a retry-queue attempt.
    pub fn record_job_retry(&self) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            http_requests_total: self.http_requests_total.load(Ordering::Relaxed),
            http_requests_active: self.http_requests_active.load(Ordering::SeqCst),
            http_requests_active_peak: self.http_requests_active_peak.load(Ordering::SeqCst),
            http_requests_2xx: self.http_requests_2xx.load(Ordering::Relaxed),
            http_requests_4xx: self.http_requests_4xx.load(Ordering::Relaxed),
            http_requests_5xx: self.http_requests_5xx.load(Ordering::Relaxed),
            http_request_latency_avg_us: self.average_latency_us(),

            retries_total: self.retries_total.load(Ordering::Relaxed),
            rate_limited_total: self.rate_limited_total.load(Ordering::Relaxed),
            auth_expired_total: self.auth_expired_total.load(Ordering::Relaxed),
            network_errors_total: self.network_errors_total.load(Ordering::Relaxed),

            credential_syncs: self.credential_syncs.load(Ordering::Relaxed),
            fallback_attempts: self.fallback_attempts.load(Ordering::Relaxed),
            fallback_successes: self.fallback_successes.load(Ordering::Relaxed),
            driver_inits: self.driver_inits.load(Ordering::Relaxed),

            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
        }
    }

    /// Calculate average request latency.
    fn average_latency_us(&self) -> u64 {
        let total = self.http_request_latency_us_total.load(Ordering::Relaxed);
        let count = self.http_request_latency_count.load(Ordering::Relaxed);
        if count > 0 {
            total / count
        } else {
            0
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    // HTTP
    pub http_requests_total: u64,
    pub http_requests_active: u64,
    pub http_requests_active_peak: u64,
    pub http_requests_2xx: u64,
    pub http_requests_4xx: u64,
    pub http_requests_5xx: u64,
    pub http_request_latency_avg_us: u64,

    // Retries
    pub retries_total: u64,
    pub rate_limited_total: u64,
    pub auth_expired_total: u64,
    pub network_errors_total: u64,

    // Transports
    pub credential_syncs: u64,
    pub fallback_attempts: u64,
    pub fallback_successes: u64,
    pub driver_inits: u64,

    // Jobs
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.http_requests_total.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.jobs_succeeded.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_http_request() {
        let metrics = Metrics::new();

        metrics.record_http_request(201, Duration::from_millis(50));
        metrics.record_http_request(429, Duration::from_millis(10));
        metrics.record_http_request(503, Duration::from_millis(100));

        assert_eq!(metrics.http_requests_total.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.http_requests_2xx.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.http_requests_4xx.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.http_requests_5xx.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_active_request_peak() {
        let metrics = Metrics::new();

        metrics.start_request();
        metrics.start_request();
        metrics.end_request();
        metrics.start_request();
        metrics.end_request();
        metrics.end_request();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.http_requests_active, 0);
        assert_eq!(snapshot.http_requests_active_peak, 2);
    }

    #[test]
    fn test_fallback_and_jobs() {
        let metrics = Metrics::new();

        metrics.record_fallback(true);
        metrics.record_fallback(false);
        metrics.record_job(true);
        metrics.record_job(false);
        metrics.record_job(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.fallback_attempts, 2);
        assert_eq!(snapshot.fallback_successes, 1);
        assert_eq!(snapshot.jobs_succeeded, 1);
        assert_eq!(snapshot.jobs_failed, 2);
    }

    #[test]
    fn test_average_latency() {
        let metrics = Metrics::new();
        assert_eq!(metrics.average_latency_us(), 0);
        metrics.record_http_request(200, Duration::from_micros(100));
        metrics.record_http_request(200, Duration::from_micros(200));
        assert_eq!(metrics.average_latency_us(), 150);
    }
}
