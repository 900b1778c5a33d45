//! Thread-safe metrics collection system
//!
//! Atomic counters for request totals and a mutex-protected map of per-stage
//! statistics. Every event is also forwarded to the `metrics` facade so the
//! Prometheus exporter sees the same numbers.

use crate::error::StageErrorKind;
use crate::observability::prometheus;
use crate::pipeline::OverallStatus;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Latency samples kept per series
const MAX_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

pub struct MetricsCollector {
    requests_received: AtomicU64,
    requests_in_flight: AtomicU64,
    requests_complete: AtomicU64,
    requests_partial: AtomicU64,
    requests_failed: AtomicU64,
    requests_rejected: AtomicU64,
    requests_cancelled: AtomicU64,

    request_times: Mutex<Vec<u64>>, // in milliseconds
    stage_stats: Mutex<HashMap<String, StageStats>>,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            requests_received: AtomicU64::new(0),
            requests_in_flight: AtomicU64::new(0),
            requests_complete: AtomicU64::new(0),
            requests_partial: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
            requests_cancelled: AtomicU64::new(0),
            request_times: Mutex::new(Vec::new()),
            stage_stats: Mutex::new(HashMap::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Request metrics
    pub fn request_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
        self.requests_in_flight.fetch_add(1, Ordering::Relaxed);
        prometheus::record_request_received();
    }

    /// Rejected before any stage ran
    pub fn request_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
        self.requests_in_flight.fetch_sub(1, Ordering::Relaxed);
        prometheus::record_request_rejected();
    }

    /// Dropped before finishing, typically a client disconnect
    pub fn request_cancelled(&self) {
        self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
        self.requests_in_flight.fetch_sub(1, Ordering::Relaxed);
        prometheus::record_request_cancelled();
    }

    pub fn request_completed(&self, status: OverallStatus, duration: Duration) {
        match status {
            OverallStatus::Complete => &self.requests_complete,
            OverallStatus::PartialSuccess => &self.requests_partial,
            OverallStatus::Failed => &self.requests_failed,
        }
        .fetch_add(1, Ordering::Relaxed);
        self.requests_in_flight.fetch_sub(1, Ordering::Relaxed);

        if let Ok(mut times) = self.request_times.lock() {
            push_bounded(&mut times, duration.as_millis() as u64);
        }

        prometheus::record_request_completed(status, duration);
    }

    // Stage metrics
    pub fn stage_succeeded(&self, stage: &str, duration: Duration) {
        self.with_stage(stage, |stats| {
            stats.calls += 1;
            stats.succeeded += 1;
            stats.last_call = current_timestamp();
            push_bounded(&mut stats.latencies, duration.as_millis() as u64);
        });
        prometheus::record_stage_call(stage, "succeeded", None, Some(duration));
    }

    pub fn stage_failed(&self, stage: &str, kind: StageErrorKind, duration: Duration) {
        self.with_stage(stage, |stats| {
            stats.calls += 1;
            stats.failed += 1;
            stats.last_call = current_timestamp();
            *stats.failures_by_kind.entry(kind.to_string()).or_insert(0) += 1;
            push_bounded(&mut stats.latencies, duration.as_millis() as u64);
        });
        prometheus::record_stage_call(stage, "failed", Some(kind), Some(duration));
    }

    /// Skipped stages never reach the network, so no latency is recorded
    pub fn stage_skipped(&self, stage: &str) {
        self.with_stage(stage, |stats| stats.skipped += 1);
        prometheus::record_stage_call(stage, "skipped", None, None);
    }

    pub fn stage_retried(&self, stage: &str) {
        self.with_stage(stage, |stats| stats.retries += 1);
        prometheus::record_stage_retry(stage);
    }

    fn with_stage(&self, stage: &str, update: impl FnOnce(&mut StageStats)) {
        if let Ok(mut stats) = self.stage_stats.lock() {
            let entry = stats
                .entry(stage.to_string())
                .or_insert_with(|| StageStats::new(stage));
            update(entry);
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        current_timestamp().saturating_sub(self.uptime_start.load(Ordering::Relaxed))
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        self.requests_received.store(0, Ordering::Relaxed);
        self.requests_in_flight.store(0, Ordering::Relaxed);
        self.requests_complete.store(0, Ordering::Relaxed);
        self.requests_partial.store(0, Ordering::Relaxed);
        self.requests_failed.store(0, Ordering::Relaxed);
        self.requests_rejected.store(0, Ordering::Relaxed);
        self.requests_cancelled.store(0, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut times) = self.request_times.lock() {
            times.clear();
        }
        if let Ok(mut stats) = self.stage_stats.lock() {
            stats.clear();
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let (avg, p50, p95, p99) = self
            .request_times
            .lock()
            .map(|times| latency_summary(&times))
            .unwrap_or((0.0, 0.0, 0.0, 0.0));

        let stages = self
            .stage_stats
            .lock()
            .map(|stats| {
                stats
                    .iter()
                    .map(|(name, stats)| (name.clone(), stats.snapshot()))
                    .collect()
            })
            .unwrap_or_default();

        MetricsSnapshot {
            requests: RequestMetrics {
                received: self.requests_received.load(Ordering::Relaxed),
                in_flight: self.requests_in_flight.load(Ordering::Relaxed),
                complete: self.requests_complete.load(Ordering::Relaxed),
                partial_success: self.requests_partial.load(Ordering::Relaxed),
                failed: self.requests_failed.load(Ordering::Relaxed),
                rejected: self.requests_rejected.load(Ordering::Relaxed),
                cancelled: self.requests_cancelled.load(Ordering::Relaxed),
                avg_duration_ms: avg,
                duration_p50_ms: p50,
                duration_p95_ms: p95,
                duration_p99_ms: p99,
            },
            stages,
            uptime_seconds: self.uptime_seconds(),
            timestamp: current_timestamp(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct StageStats {
    name: String,
    calls: u64,
    succeeded: u64,
    failed: u64,
    skipped: u64,
    retries: u64,
    failures_by_kind: HashMap<String, u64>,
    latencies: Vec<u64>, // milliseconds
    last_call: u64,
}

impl StageStats {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            retries: 0,
            failures_by_kind: HashMap::new(),
            latencies: Vec::new(),
            last_call: 0,
        }
    }

    fn snapshot(&self) -> StageMetricsSnapshot {
        let (avg, p50, p95, p99) = latency_summary(&self.latencies);
        let success_rate = if self.calls == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.calls as f64
        };

        StageMetricsSnapshot {
            name: self.name.clone(),
            calls: self.calls,
            succeeded: self.succeeded,
            failed: self.failed,
            skipped: self.skipped,
            retries: self.retries,
            failures_by_kind: self.failures_by_kind.clone(),
            avg_latency_ms: avg,
            latency_p50_ms: p50,
            latency_p95_ms: p95,
            latency_p99_ms: p99,
            success_rate,
            last_call: self.last_call,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub requests: RequestMetrics,
    pub stages: HashMap<String, StageMetricsSnapshot>,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct RequestMetrics {
    pub received: u64,
    pub in_flight: u64,
    pub complete: u64,
    pub partial_success: u64,
    pub failed: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub avg_duration_ms: f64,
    pub duration_p50_ms: f64,
    pub duration_p95_ms: f64,
    pub duration_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct StageMetricsSnapshot {
    pub name: String,
    pub calls: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub retries: u64,
    pub failures_by_kind: HashMap<String, u64>,
    pub avg_latency_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub success_rate: f64,
    pub last_call: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn push_bounded(samples: &mut Vec<u64>, value: u64) {
    samples.push(value);
    if samples.len() > MAX_SAMPLES {
        samples.remove(0);
    }
}

fn latency_summary(samples: &[u64]) -> (f64, f64, f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();

    let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
    (
        avg,
        percentile(&sorted, 50.0),
        percentile(&sorted, 95.0),
        percentile(&sorted, 99.0),
    )
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_request_metrics() {
        let collector = MetricsCollector::new();

        collector.request_received();
        collector.request_completed(OverallStatus::Complete, Duration::from_millis(1500));
        collector.request_received();
        collector.request_completed(OverallStatus::PartialSuccess, Duration::from_millis(500));
        collector.request_received();
        collector.request_rejected();
        collector.request_received();
        collector.request_cancelled();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.requests.received, 4);
        assert_eq!(metrics.requests.cancelled, 1);
        assert_eq!(metrics.requests.complete, 1);
        assert_eq!(metrics.requests.partial_success, 1);
        assert_eq!(metrics.requests.rejected, 1);
        assert_eq!(metrics.requests.in_flight, 0);
        assert!(metrics.requests.avg_duration_ms > 900.0);
    }

    #[test]
    fn test_stage_outcome_distribution() {
        let collector = MetricsCollector::new();

        collector.stage_succeeded("style", Duration::from_millis(200));
        collector.stage_failed("style", StageErrorKind::TimeoutError, Duration::from_millis(400));
        collector.stage_skipped("style");
        collector.stage_retried("style");

        let metrics = collector.get_metrics();
        let style = metrics.stages.get("style").unwrap();

        assert_eq!(style.calls, 2);
        assert_eq!(style.succeeded, 1);
        assert_eq!(style.failed, 1);
        assert_eq!(style.skipped, 1);
        assert_eq!(style.retries, 1);
        assert_eq!(style.failures_by_kind.get("timeout_error"), Some(&1));
        assert_eq!(style.success_rate, 0.5);
        assert!((style.avg_latency_ms - 300.0).abs() < 0.1);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.request_received();
                        collector.stage_succeeded("detection", Duration::from_millis(1));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.get_metrics();
        assert_eq!(metrics.requests.received, 1000);
        assert_eq!(metrics.stages.get("detection").unwrap().calls, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        assert!((percentile(&data, 50.0) - 5.5).abs() < 0.1);
        assert!((percentile(&data, 95.0) - 9.5).abs() < 0.1);
        assert!((percentile(&data, 0.0) - 1.0).abs() < 0.1);
        assert!((percentile(&data, 100.0) - 10.0).abs() < 0.1);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_samples_are_bounded() {
        let mut samples = Vec::new();
        for i in 0..1500 {
            push_bounded(&mut samples, i);
        }
        assert_eq!(samples.len(), MAX_SAMPLES);
        assert_eq!(samples[0], 500);
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();

        collector.request_received();
        collector.stage_succeeded("feature", Duration::from_millis(10));
        assert_eq!(collector.get_metrics().requests.received, 1);

        collector.reset();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.requests.received, 0);
        assert!(metrics.stages.is_empty());
    }
}
