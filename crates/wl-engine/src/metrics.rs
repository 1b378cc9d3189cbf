//! Call Metrics Registry
//!
//! Per-label call counters with:
//! - Success/failure tallies
//! - A bounded ring buffer of latency samples (oldest evicted first)
//! - Nearest-rank percentiles, mean and throughput computed on demand
//! - Fixed-width table rendering for console reporting

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

/// Default number of latency samples retained per label
pub const DEFAULT_RING_CAPACITY: usize = 500_000;

/// A single completed call
#[derive(Debug, Clone, Copy)]
struct MetricSample {
    begin: Instant,
    end: Instant,
}

impl MetricSample {
    fn duration_ms(&self) -> f64 {
        self.end.saturating_duration_since(self.begin).as_secs_f64() * 1000.0
    }
}

/// Configuration for the registry
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Samples retained per label before the oldest are evicted
    pub ring_capacity: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

/// Call counter for one label
pub struct Counter {
    label: String,
    created: Instant,
    capacity: usize,
    /// Tasks currently recording into this counter
    references: AtomicUsize,
    success: AtomicU64,
    failure: AtomicU64,
    samples: RwLock<VecDeque<MetricSample>>,
}

impl Counter {
    fn new(label: &str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            label: label.to_string(),
            created: Instant::now(),
            capacity,
            references: AtomicUsize::new(0),
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            samples: RwLock::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    /// Timestamp marking the start of a call
    pub fn enter(&self) -> Instant {
        Instant::now()
    }

    /// Record a call that began at `begin` and ended now
    pub fn exit(&self, begin: Instant, success: bool) {
        self.push(MetricSample { begin, end: Instant::now() }, success);
    }

    /// Record a call of known latency that ended now
    pub fn record(&self, latency: Duration, success: bool) {
        let end = Instant::now();
        let begin = end.checked_sub(latency).unwrap_or(end);
        self.push(MetricSample { begin, end }, success);
    }

    fn push(&self, sample: MetricSample, success: bool) {
        {
            let mut samples = self.samples.write();
            while samples.len() >= self.capacity {
                samples.pop_front();
            }
            samples.push_back(sample);
        }

        if success {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn success_count(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failure.load(Ordering::Relaxed)
    }

    /// Samples currently held in the ring buffer
    pub fn retained(&self) -> usize {
        self.samples.read().len()
    }

    /// Time since the counter was created
    pub fn execution_time(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn references(&self) -> usize {
        self.references.load(Ordering::SeqCst)
    }

    /// Latency at percentile `p` (0.0..=1.0) over the retained samples
    pub fn percentile(&self, p: f64) -> f64 {
        percentile(&self.sorted_latencies(), p)
    }

    fn sorted_latencies(&self) -> Vec<f64> {
        let mut latencies: Vec<f64> = self.samples.read().iter().map(MetricSample::duration_ms).collect();
        latencies.sort_by(f64::total_cmp);
        latencies
    }

    /// Compute all statistics from one consistent copy of the samples
    pub fn snapshot(&self) -> CounterSnapshot {
        let (latencies, oldest_end) = {
            let samples = self.samples.read();
            let latencies: Vec<f64> = samples.iter().map(MetricSample::duration_ms).collect();
            (latencies, samples.front().map(|s| s.end))
        };

        let retained = latencies.len();
        let mean_ms = if retained > 0 {
            latencies.iter().sum::<f64>() / retained as f64
        } else {
            0.0
        };

        let mut sorted = latencies;
        sorted.sort_by(f64::total_cmp);

        let window_secs = oldest_end
            .map(|end| end.elapsed().as_secs_f64())
            .unwrap_or(0.0)
            .max(1.0);
        let ops_per_sec = retained as f64 / window_secs;

        CounterSnapshot {
            label: self.label.clone(),
            elapsed_secs: self.execution_time().as_secs_f64(),
            ops_per_sec,
            ops_per_min: ops_per_sec * 60.0,
            p50_ms: percentile(&sorted, 0.5),
            p90_ms: percentile(&sorted, 0.9),
            p99_ms: percentile(&sorted, 0.99),
            mean_ms,
            success: self.success_count(),
            failure: self.failure_count(),
            retained,
        }
    }

    fn acquire(&self) {
        self.references.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one reference, returning how many remain
    fn release(&self) -> usize {
        let previous = self
            .references
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("label", &self.label)
            .field("success", &self.success_count())
            .field("failure", &self.failure_count())
            .field("retained", &self.retained())
            .finish()
    }
}

/// Nearest-rank percentile over ascending `sorted` latencies.
///
/// Returns the sample at index `ceil(p * n) - 1`, or 0 when empty.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let p = p.clamp(0.0, 1.0);
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Statistics for one label
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub label: String,
    pub elapsed_secs: f64,
    pub ops_per_sec: f64,
    pub ops_per_min: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
    pub mean_ms: f64,
    pub success: u64,
    pub failure: u64,
    pub retained: usize,
}

impl CounterSnapshot {
    fn format_row(&self) -> String {
        format!(
            "{:<40} {:>7.0} {:>8.1} {:>10.1} {:>10.2} {:>10.2} {:>10.2} {:>10.2} {:>11} {:>11}",
            self.label,
            self.elapsed_secs,
            self.ops_per_sec,
            self.ops_per_min,
            self.p50_ms,
            self.p90_ms,
            self.p99_ms,
            self.mean_ms,
            group_thousands(self.success),
            group_thousands(self.failure),
        )
    }
}

/// Aggregate over all labels: sums for throughput and counts, averages for
/// elapsed time and latencies
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub labels: usize,
    pub avg_elapsed_secs: f64,
    pub ops_per_sec: f64,
    pub ops_per_min: f64,
    pub avg_p50_ms: f64,
    pub avg_p90_ms: f64,
    pub avg_p99_ms: f64,
    pub avg_mean_ms: f64,
    pub success: u64,
    pub failure: u64,
}

impl MetricsSummary {
    pub fn from_snapshots(snapshots: &[CounterSnapshot]) -> Self {
        if snapshots.is_empty() {
            return Self::default();
        }
        let n = snapshots.len() as f64;
        let avg = |f: fn(&CounterSnapshot) -> f64| snapshots.iter().map(f).sum::<f64>() / n;

        Self {
            labels: snapshots.len(),
            avg_elapsed_secs: avg(|s| s.elapsed_secs),
            ops_per_sec: snapshots.iter().map(|s| s.ops_per_sec).sum(),
            ops_per_min: snapshots.iter().map(|s| s.ops_per_min).sum(),
            avg_p50_ms: avg(|s| s.p50_ms),
            avg_p90_ms: avg(|s| s.p90_ms),
            avg_p99_ms: avg(|s| s.p99_ms),
            avg_mean_ms: avg(|s| s.mean_ms),
            success: snapshots.iter().map(|s| s.success).sum(),
            failure: snapshots.iter().map(|s| s.failure).sum(),
        }
    }
}

/// Concurrent label -> counter registry
///
/// Owned by whoever builds the engine and shared by reference; there is no
/// process-wide instance.
pub struct MetricsRegistry {
    config: MetricsConfig,
    counters: DashMap<String, Arc<Counter>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_config(MetricsConfig::default())
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        Self {
            config,
            counters: DashMap::new(),
        }
    }

    /// Get or create the counter for `label` and take a reference on it
    pub fn add(&self, label: &str) -> Arc<Counter> {
        let capacity = self.config.ring_capacity;
        let entry = self
            .counters
            .entry(label.to_string())
            .or_insert_with(|| Arc::new(Counter::new(label, capacity)));
        // Still holding the shard lock, so a concurrent remove cannot detach it
        entry.acquire();
        Arc::clone(entry.value())
    }

    /// Drop a reference on `label`, detaching the counter once unreferenced
    pub fn remove(&self, label: &str) {
        let counter = match self.counters.get(label) {
            Some(entry) => Arc::clone(entry.value()),
            None => return,
        };
        self.release_counter(&counter);
    }

    /// Take a reference that is dropped automatically
    pub fn lease(self: &Arc<Self>, label: &str) -> CounterLease {
        CounterLease {
            counter: self.add(label),
            registry: Arc::clone(self),
        }
    }

    fn release_counter(&self, counter: &Arc<Counter>) {
        if counter.release() > 0 {
            return;
        }
        // Only detach if the map still holds this exact counter and nobody
        // re-acquired it in the meantime
        self.counters.remove_if(counter.label(), |_, current| {
            Arc::ptr_eq(current, counter) && current.references() == 0
        });
    }

    pub fn get(&self, label: &str) -> Option<Arc<Counter>> {
        self.counters.get(label).map(|entry| Arc::clone(entry.value()))
    }

    /// Empty the registry
    pub fn clear(&self) {
        self.counters.clear();
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.counters.iter().map(|e| e.key().clone()).collect();
        labels.sort();
        labels
    }

    /// Per-label statistics in label order
    pub fn snapshots(&self) -> Vec<CounterSnapshot> {
        let counters: Vec<Arc<Counter>> = self.counters.iter().map(|e| Arc::clone(e.value())).collect();
        let mut snapshots: Vec<CounterSnapshot> = counters.iter().map(|c| c.snapshot()).collect();
        snapshots.sort_by(|a, b| a.label.cmp(&b.label));
        snapshots
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary::from_snapshots(&self.snapshots())
    }

    pub fn pretty_print_header(&self) -> String {
        let titles = format_columns(
            "metric", "time(s)", "op/s", "op/m", "p50(ms)", "p90(ms)", "p99(ms)", "mean(ms)", "ok", "fail",
        );
        let rule = format_columns(
            &"-".repeat(40),
            &"-".repeat(7),
            &"-".repeat(8),
            &"-".repeat(10),
            &"-".repeat(10),
            &"-".repeat(10),
            &"-".repeat(10),
            &"-".repeat(10),
            &"-".repeat(11),
            &"-".repeat(11),
        );
        format!("{}\n{}", titles, rule)
    }

    /// Emit one formatted row per label, in label order
    pub fn pretty_print_body(&self, mut sink: impl FnMut(String)) {
        for snapshot in self.snapshots() {
            sink(snapshot.format_row());
        }
    }

    pub fn pretty_print_footer(&self) -> String {
        let summary = self.summary();
        format!(
            "{:<40} {:>7.0} {:>8.1} {:>10.1} {:>10.2} {:>10.2} {:>10.2} {:>10.2} {:>11} {:>11}",
            "sum/avg",
            summary.avg_elapsed_secs,
            summary.ops_per_sec,
            summary.ops_per_min,
            summary.avg_p50_ms,
            summary.avg_p90_ms,
            summary.avg_p99_ms,
            summary.avg_mean_ms,
            group_thousands(summary.success),
            group_thousands(summary.failure),
        )
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A counter reference released on drop
pub struct CounterLease {
    counter: Arc<Counter>,
    registry: Arc<MetricsRegistry>,
}

impl std::ops::Deref for CounterLease {
    type Target = Counter;

    fn deref(&self) -> &Counter {
        &self.counter
    }
}

impl Drop for CounterLease {
    fn drop(&mut self) {
        self.registry.release_counter(&self.counter);
    }
}

#[allow(clippy::too_many_arguments)]
fn format_columns(
    metric: &str,
    time: &str,
    ops: &str,
    opm: &str,
    p50: &str,
    p90: &str,
    p99: &str,
    mean: &str,
    ok: &str,
    fail: &str,
) -> String {
    format!(
        "{:<40} {:>7} {:>8} {:>10} {:>10} {:>10} {:>10} {:>10} {:>11} {:>11}",
        metric, time, ops, opm, p50, p90, p99, mean, ok, fail
    )
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
