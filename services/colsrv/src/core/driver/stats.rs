//! Driver statistics
//!
//! Atomic counters shared between a driver and its owning worker. Counters
//! are monotonic until an explicit [`DriverStatistics::reset`]; there is no
//! implicit reset on reconnect or restart.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metric key for the incrementally maintained average response time.
pub const METRIC_AVG_RESPONSE_TIME_MS: &str = "avg_response_time_ms";

/// Statistics owned by one protocol driver instance.
///
/// All counters use relaxed atomics: readers only ever need a consistent
/// point-in-time snapshot, not cross-counter ordering.
#[derive(Debug, Default)]
pub struct DriverStatistics {
    total_reads: AtomicU64,
    successful_reads: AtomicU64,
    failed_reads: AtomicU64,
    total_writes: AtomicU64,
    successful_writes: AtomicU64,
    failed_writes: AtomicU64,
    points_read: AtomicU64,
    connection_errors: AtomicU64,
    /// Named numeric metrics (f64 stored as bits in the snapshot path)
    metrics: DashMap<String, f64>,
}

/// Serializable point-in-time view of [`DriverStatistics`].
#[derive(Debug, Clone, Serialize)]
pub struct DriverStatsSnapshot {
    pub total_reads: u64,
    pub successful_reads: u64,
    pub failed_reads: u64,
    pub total_writes: u64,
    pub successful_writes: u64,
    pub failed_writes: u64,
    pub points_read: u64,
    pub connection_errors: u64,
    pub metrics: HashMap<String, f64>,
}

impl DriverStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one read attempt. `points` is the number of values obtained on
    /// success (0 on failure).
    pub fn record_read(&self, success: bool, points: usize, elapsed: Duration) {
        self.total_reads.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_reads.fetch_add(1, Ordering::Relaxed);
            self.points_read.fetch_add(points as u64, Ordering::Relaxed);
        } else {
            self.failed_reads.fetch_add(1, Ordering::Relaxed);
        }
        self.update_avg_response_time(elapsed);
    }

    /// Record one write attempt.
    pub fn record_write(&self, success: bool, elapsed: Duration) {
        self.total_writes.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_writes.fetch_add(1, Ordering::Relaxed);
        }
        self.update_avg_response_time(elapsed);
    }

    /// Record the outcome of a connection attempt.
    pub fn record_connection_result(&self, success: bool) {
        if !success {
            self.connection_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn connection_errors(&self) -> u64 {
        self.connection_errors.load(Ordering::Relaxed)
    }

    pub fn total_reads(&self) -> u64 {
        self.total_reads.load(Ordering::Relaxed)
    }

    pub fn total_writes(&self) -> u64 {
        self.total_writes.load(Ordering::Relaxed)
    }

    /// Set or replace a named numeric metric.
    pub fn set_metric(&self, name: impl Into<String>, value: f64) {
        self.metrics.insert(name.into(), value);
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).map(|v| *v)
    }

    fn update_avg_response_time(&self, elapsed: Duration) {
        let total = self.total_reads.load(Ordering::Relaxed) + self.total_writes.load(Ordering::Relaxed);
        let sample = elapsed.as_secs_f64() * 1000.0;
        let mut entry = self.metrics.entry(METRIC_AVG_RESPONSE_TIME_MS.to_string()).or_insert(0.0);
        let prev = *entry;
        *entry = if total <= 1 {
            sample
        } else {
            (prev * (total - 1) as f64 + sample) / total as f64
        };
    }

    /// Reset all counters and metrics. Never called implicitly.
    pub fn reset(&self) {
        self.total_reads.store(0, Ordering::Relaxed);
        self.successful_reads.store(0, Ordering::Relaxed);
        self.failed_reads.store(0, Ordering::Relaxed);
        self.total_writes.store(0, Ordering::Relaxed);
        self.successful_writes.store(0, Ordering::Relaxed);
        self.failed_writes.store(0, Ordering::Relaxed);
        self.points_read.store(0, Ordering::Relaxed);
        self.connection_errors.store(0, Ordering::Relaxed);
        self.metrics.clear();
    }

    /// Take a serializable snapshot of all counters.
    pub fn snapshot(&self) -> DriverStatsSnapshot {
        DriverStatsSnapshot {
            total_reads: self.total_reads.load(Ordering::Relaxed),
            successful_reads: self.successful_reads.load(Ordering::Relaxed),
            failed_reads: self.failed_reads.load(Ordering::Relaxed),
            total_writes: self.total_writes.load(Ordering::Relaxed),
            successful_writes: self.successful_writes.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            points_read: self.points_read.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            metrics: self.metrics.iter().map(|e| (e.key().clone(), *e.value())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_counters() {
        let stats = DriverStatistics::new();
        stats.record_read(true, 4, Duration::from_millis(10));
        stats.record_read(false, 0, Duration::from_millis(20));

        let snap = stats.snapshot();
        assert_eq!(snap.total_reads, 2);
        assert_eq!(snap.successful_reads, 1);
        assert_eq!(snap.failed_reads, 1);
        assert_eq!(snap.points_read, 4);
    }

    #[test]
    fn test_write_counters() {
        let stats = DriverStatistics::new();
        stats.record_write(true, Duration::from_millis(5));
        stats.record_write(false, Duration::from_millis(5));

        let snap = stats.snapshot();
        assert_eq!(snap.total_writes, 2);
        assert_eq!(snap.successful_writes, 1);
        assert_eq!(snap.failed_writes, 1);
    }

    #[test]
    fn test_reset_then_single_read() {
        let stats = DriverStatistics::new();
        stats.record_read(true, 1, Duration::from_millis(1));
        stats.record_read(false, 0, Duration::from_millis(1));
        stats.reset();

        stats.record_read(true, 1, Duration::from_millis(1));
        let snap = stats.snapshot();
        assert_eq!(snap.total_reads, 1);
        assert_eq!(snap.successful_reads, 1);
        assert_eq!(snap.failed_reads, 0);
    }

    #[test]
    fn test_connection_errors_monotonic() {
        let stats = DriverStatistics::new();
        stats.record_connection_result(false);
        stats.record_connection_result(true);
        stats.record_connection_result(false);
        assert_eq!(stats.connection_errors(), 2);
    }

    #[test]
    fn test_avg_response_time_metric() {
        let stats = DriverStatistics::new();
        stats.record_read(true, 1, Duration::from_millis(10));
        stats.record_read(true, 1, Duration::from_millis(30));
        let avg = stats.metric(METRIC_AVG_RESPONSE_TIME_MS).unwrap();
        assert!(avg > 15.0 && avg < 25.0, "avg was {}", avg);
    }
}
