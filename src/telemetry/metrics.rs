// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process metrics for gather runs.
//!
//! Tracks per-metric gather outcomes, timings of the main pipeline stages and
//! archive counters. Nothing is exported; the CLI prints a report on demand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

/// Global metrics instance.
pub static GLOBAL_METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Central metrics collection.
#[derive(Debug)]
pub struct Metrics {
    /// Gather outcomes by metric key.
    gathers: RwLock<HashMap<String, GatherMetrics>>,

    /// Pipeline stage timings (`package.build`, `package.ship`, `collector.gather`).
    operations: RwLock<HashMap<String, OperationMetrics>>,

    archives: ArchiveCounters,

    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            gathers: RwLock::new(HashMap::new()),
            operations: RwLock::new(HashMap::new()),
            archives: ArchiveCounters::new(),
            start_time: Instant::now(),
        }
    }

    /// Record one invocation of a metric handler.
    pub fn record_gather(&self, key: &str, duration: Duration, success: bool) {
        let mut gathers = self.gathers.write().unwrap_or_else(PoisonError::into_inner);
        let metrics = gathers
            .entry(key.to_string())
            .or_insert_with(GatherMetrics::new);
        metrics.record(duration, success);
    }

    /// Record a pipeline operation.
    pub fn record_operation(&self, name: &str, duration: Duration) {
        let mut ops = self.operations.write().unwrap_or_else(PoisonError::into_inner);
        let metrics = ops
            .entry(name.to_string())
            .or_insert_with(OperationMetrics::new);
        metrics.record(duration);
    }

    /// Record a built archive holding `payload_bytes` of collection data.
    pub fn record_archive_built(&self, payload_bytes: u64) {
        self.archives.built.fetch_add(1, Ordering::Relaxed);
        self.archives
            .payload_bytes
            .fetch_add(payload_bytes, Ordering::Relaxed);
    }

    /// Record a successfully shipped archive.
    pub fn record_archive_shipped(&self) {
        self.archives.shipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Get gather metrics for a metric key.
    pub fn gather_metrics(&self, key: &str) -> Option<GatherMetrics> {
        self.gathers.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    /// Archives built and shipped, and payload bytes packaged.
    pub fn archive_counts(&self) -> (u64, u64, u64) {
        (
            self.archives.built.load(Ordering::Relaxed),
            self.archives.shipped.load(Ordering::Relaxed),
            self.archives.payload_bytes.load(Ordering::Relaxed),
        )
    }

    /// Get uptime since metrics were initialized.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Take a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let gathers = self.gathers.read().unwrap_or_else(PoisonError::into_inner);
        let operations = self.operations.read().unwrap_or_else(PoisonError::into_inner);
        let (archives_built, archives_shipped, payload_bytes) = self.archive_counts();

        MetricsSnapshot {
            gathers: gathers.clone(),
            operations: operations.clone(),
            archives_built,
            archives_shipped,
            payload_bytes,
            uptime: self.uptime(),
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        self.gathers.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.operations.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.archives.reset();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcomes of one metric key's handler.
#[derive(Debug, Clone)]
pub struct GatherMetrics {
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
}

impl GatherMetrics {
    /// Create new empty gather metrics.
    pub fn new() -> Self {
        Self {
            invocations: 0,
            successes: 0,
            failures: 0,
            total_duration: Duration::ZERO,
            min_duration: Duration::MAX,
            max_duration: Duration::ZERO,
        }
    }

    /// Record a handler invocation.
    pub fn record(&mut self, duration: Duration, success: bool) {
        self.invocations += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_duration += duration;
        self.min_duration = self.min_duration.min(duration);
        self.max_duration = self.max_duration.max(duration);
    }

    /// Average handler time.
    pub fn avg_duration(&self) -> Duration {
        if self.invocations == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.invocations as u32
        }
    }

    /// Success rate (0.0 to 1.0).
    pub fn success_rate(&self) -> f64 {
        if self.invocations == 0 {
            1.0
        } else {
            self.successes as f64 / self.invocations as f64
        }
    }
}

impl Default for GatherMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Generic operation metrics with histogram.
#[derive(Debug, Clone)]
pub struct OperationMetrics {
    pub count: u64,
    pub total_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
    /// Latency distribution.
    pub histogram: Histogram,
}

impl OperationMetrics {
    /// Create new operation metrics.
    pub fn new() -> Self {
        Self {
            count: 0,
            total_duration: Duration::ZERO,
            min_duration: Duration::MAX,
            max_duration: Duration::ZERO,
            histogram: Histogram::default(),
        }
    }

    /// Record an operation.
    pub fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total_duration += duration;
        self.min_duration = self.min_duration.min(duration);
        self.max_duration = self.max_duration.max(duration);
        self.histogram.record(duration);
    }

    /// Calculate average duration.
    pub fn avg_duration(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.count as u32
        }
    }
}

impl Default for OperationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-bucket latency histogram.
#[derive(Debug, Clone)]
pub struct Histogram {
    /// Bucket boundaries in milliseconds.
    buckets: Vec<u64>,
    counts: Vec<u64>,
}

impl Histogram {
    /// Create a histogram with custom bucket boundaries (in milliseconds).
    pub fn with_buckets(buckets: Vec<u64>) -> Self {
        let counts = vec![0; buckets.len() + 1];
        Self { buckets, counts }
    }

    /// Record a duration value.
    pub fn record(&mut self, duration: Duration) {
        let millis = duration.as_millis() as u64;
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| millis <= b)
            .unwrap_or(self.buckets.len());
        self.counts[bucket_idx] += 1;
    }

    /// Get counts for each bucket.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Get bucket boundaries.
    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    /// Approximate percentile, reported as the upper bound of its bucket.
    pub fn percentile(&self, p: f64) -> Duration {
        let total: u64 = self.counts.iter().sum();
        if total == 0 {
            return Duration::ZERO;
        }

        let target = (total as f64 * p / 100.0).ceil() as u64;
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                let millis = if i < self.buckets.len() {
                    self.buckets[i]
                } else {
                    self.buckets.last().copied().unwrap_or(0) * 10
                };
                return Duration::from_millis(millis);
            }
        }

        Duration::ZERO
    }

    /// Median latency.
    pub fn p50(&self) -> Duration {
        self.percentile(50.0)
    }

    /// p99 latency.
    pub fn p99(&self) -> Duration {
        self.percentile(99.0)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        // Gathers and uploads are slow: 10ms up to 5 minutes
        Self::with_buckets(vec![10, 100, 1_000, 10_000, 60_000, 300_000])
    }
}

#[derive(Debug)]
struct ArchiveCounters {
    built: AtomicU64,
    shipped: AtomicU64,
    payload_bytes: AtomicU64,
}

impl ArchiveCounters {
    fn new() -> Self {
        Self {
            built: AtomicU64::new(0),
            shipped: AtomicU64::new(0),
            payload_bytes: AtomicU64::new(0),
        }
    }

    fn reset(&self) {
        self.built.store(0, Ordering::Relaxed);
        self.shipped.store(0, Ordering::Relaxed);
        self.payload_bytes.store(0, Ordering::Relaxed);
    }
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub gathers: HashMap<String, GatherMetrics>,
    pub operations: HashMap<String, OperationMetrics>,
    pub archives_built: u64,
    pub archives_shipped: u64,
    pub payload_bytes: u64,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    /// Format as a human-readable report.
    pub fn format_report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Gather Report ===\n\n");
        report.push_str(&format!("Uptime: {:.2?}\n", self.uptime));
        report.push_str(&format!(
            "Archives: {} built, {} shipped, {} payload bytes\n\n",
            self.archives_built, self.archives_shipped, self.payload_bytes
        ));

        if !self.gathers.is_empty() {
            let mut keys: Vec<_> = self.gathers.keys().collect();
            keys.sort();
            report.push_str("Metrics:\n");
            for key in keys {
                let metrics = &self.gathers[key];
                report.push_str(&format!(
                    "  {}: {} gathers, {:.1}% success, avg {:.2?}\n",
                    key,
                    metrics.invocations,
                    metrics.success_rate() * 100.0,
                    metrics.avg_duration()
                ));
            }
            report.push('\n');
        }

        if !self.operations.is_empty() {
            report.push_str("Operations:\n");
            for (name, metrics) in &self.operations {
                report.push_str(&format!(
                    "  {}: {} ops, avg {:.2?}, p99 {:.2?}\n",
                    name,
                    metrics.count,
                    metrics.avg_duration(),
                    metrics.histogram.p99()
                ));
            }
        }

        report
    }
}

/// Record a handler invocation to global metrics.
pub fn record_gather(key: &str, duration: Duration, success: bool) {
    GLOBAL_METRICS.record_gather(key, duration, success);
}

/// Record an operation to global metrics.
pub fn record_operation(name: &str, duration: Duration) {
    GLOBAL_METRICS.record_operation(name, duration);
}
