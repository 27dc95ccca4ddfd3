//! Atomic counters for admission decisions and config loads
//!
//! Exported in Prometheus text format on `/metrics`. Recording never
//! allocates.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// What the dispatcher did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Allowed,
    Denied,
    /// Admission disabled for the scope
    Bypassed,
    /// No decision could be made; answered by the error handler
    Error,
}

pub struct Metrics {
    start_time: Instant,

    pub total_requests: AtomicU64,
    pub requests_allowed: AtomicU64,
    pub requests_denied: AtomicU64,
    pub requests_bypassed: AtomicU64,
    pub requests_errors: AtomicU64,

    pub config_loads: AtomicU64,
    pub config_load_failures: AtomicU64,
    /// Callers that waited on another caller's load instead of starting one
    pub config_loads_shared: AtomicU64,

    /// Decision latency buckets
    pub latency_under_1ms: AtomicU64,
    pub latency_under_10ms: AtomicU64,
    pub latency_under_100ms: AtomicU64,
    pub latency_under_1s: AtomicU64,
    pub latency_over_1s: AtomicU64,

    pub latency_sum_micros: AtomicU64,
    pub latency_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_requests: AtomicU64::new(0),
            requests_allowed: AtomicU64::new(0),
            requests_denied: AtomicU64::new(0),
            requests_bypassed: AtomicU64::new(0),
            requests_errors: AtomicU64::new(0),
            config_loads: AtomicU64::new(0),
            config_load_failures: AtomicU64::new(0),
            config_loads_shared: AtomicU64::new(0),
            latency_under_1ms: AtomicU64::new(0),
            latency_under_10ms: AtomicU64::new(0),
            latency_under_100ms: AtomicU64::new(0),
            latency_under_1s: AtomicU64::new(0),
            latency_over_1s: AtomicU64::new(0),
            latency_sum_micros: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
        }
    }

    /// Record one request passing through admission
    pub fn record_request(&self, outcome: Outcome, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let counter = match outcome {
            Outcome::Allowed => &self.requests_allowed,
            Outcome::Denied => &self.requests_denied,
            Outcome::Bypassed => &self.requests_bypassed,
            Outcome::Error => &self.requests_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let latency_us = latency.as_micros().min(u64::MAX as u128) as u64;
        let bucket = match latency_us {
            0..=999 => &self.latency_under_1ms,
            1000..=9999 => &self.latency_under_10ms,
            10000..=99999 => &self.latency_under_100ms,
            100000..=999999 => &self.latency_under_1s,
            _ => &self.latency_over_1s,
        };
        bucket.fetch_add(1, Ordering::Relaxed);

        self.latency_sum_micros
            .fetch_add(latency_us, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load(&self) {
        self.config_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_failure(&self) {
        self.config_load_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shared_load(&self) {
        self.config_loads_shared.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::with_capacity(2048);

        gauge(
            &mut output,
            "scopecrab_uptime_seconds",
            "Time since server start in seconds",
            self.uptime_seconds(),
        );
        counter(
            &mut output,
            "scopecrab_requests_total",
            "Requests that went through admission",
            &self.total_requests,
        );

        let _ = writeln!(
            output,
            "# HELP scopecrab_requests_by_outcome Requests by admission outcome"
        );
        let _ = writeln!(output, "# TYPE scopecrab_requests_by_outcome counter");
        for (label, value) in [
            ("allowed", &self.requests_allowed),
            ("denied", &self.requests_denied),
            ("bypassed", &self.requests_bypassed),
            ("error", &self.requests_errors),
        ] {
            let _ = writeln!(
                output,
                "scopecrab_requests_by_outcome{{outcome=\"{label}\"}} {}",
                value.load(Ordering::Relaxed)
            );
        }
        output.push('\n');

        counter(
            &mut output,
            "scopecrab_config_loads_total",
            "Configuration loads started",
            &self.config_loads,
        );
        counter(
            &mut output,
            "scopecrab_config_load_failures_total",
            "Configuration loads that failed",
            &self.config_load_failures,
        );
        counter(
            &mut output,
            "scopecrab_config_loads_shared_total",
            "Callers served by another caller's in-flight load",
            &self.config_loads_shared,
        );

        let _ = writeln!(
            output,
            "# HELP scopecrab_request_duration Admission latency distribution"
        );
        let _ = writeln!(output, "# TYPE scopecrab_request_duration histogram");
        let mut cumulative = 0;
        for (le, bucket) in [
            ("0.001", &self.latency_under_1ms),
            ("0.01", &self.latency_under_10ms),
            ("0.1", &self.latency_under_100ms),
            ("1", &self.latency_under_1s),
        ] {
            cumulative += bucket.load(Ordering::Relaxed);
            let _ = writeln!(
                output,
                "scopecrab_request_duration_bucket{{le=\"{le}\"}} {cumulative}"
            );
        }
        let count = self.latency_count.load(Ordering::Relaxed);
        let _ = writeln!(
            output,
            "scopecrab_request_duration_bucket{{le=\"+Inf\"}} {count}"
        );
        let latency_sum_seconds =
            self.latency_sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        let _ = writeln!(
            output,
            "scopecrab_request_duration_sum {latency_sum_seconds:.6}"
        );
        let _ = writeln!(output, "scopecrab_request_duration_count {count}");

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(output: &mut String, name: &str, help: &str, value: &AtomicU64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    let _ = writeln!(output, "{name} {}\n", value.load(Ordering::Relaxed));
}

fn gauge(output: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} gauge");
    let _ = writeln!(output, "{name} {value}\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert_eq!(metrics.total_requests.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.requests_allowed.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.config_loads.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_request() {
        let metrics = Metrics::new();

        metrics.record_request(Outcome::Allowed, Duration::from_micros(500));
        assert_eq!(metrics.total_requests.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.requests_allowed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.latency_under_1ms.load(Ordering::Relaxed), 1);

        metrics.record_request(Outcome::Denied, Duration::from_millis(50));
        metrics.record_request(Outcome::Bypassed, Duration::ZERO);
        metrics.record_request(Outcome::Error, Duration::from_secs(2));

        assert_eq!(metrics.total_requests.load(Ordering::Relaxed), 4);
        assert_eq!(metrics.requests_denied.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.requests_bypassed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.requests_errors.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.latency_under_100ms.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.latency_over_1s.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = Metrics::new();
        metrics.record_request(Outcome::Allowed, Duration::from_micros(500));
        metrics.record_request(Outcome::Denied, Duration::from_micros(1500));
        metrics.record_load();
        metrics.record_load_failure();
        metrics.record_shared_load();
        metrics.record_shared_load();

        let output = metrics.export_prometheus();

        assert!(output.contains("scopecrab_uptime_seconds"));
        assert!(output.contains("scopecrab_requests_total 2"));
        assert!(output.contains("scopecrab_requests_by_outcome{outcome=\"allowed\"} 1"));
        assert!(output.contains("scopecrab_requests_by_outcome{outcome=\"denied\"} 1"));
        assert!(output.contains("scopecrab_config_loads_total 1"));
        assert!(output.contains("scopecrab_config_load_failures_total 1"));
        assert!(output.contains("scopecrab_config_loads_shared_total 2"));
        assert!(output.contains("scopecrab_request_duration_bucket{le=\"0.001\"} 1"));
        assert!(output.contains("scopecrab_request_duration_bucket{le=\"0.01\"} 2"));
        assert!(output.contains("scopecrab_request_duration_bucket{le=\"+Inf\"} 2"));
    }
}
