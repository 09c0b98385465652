//! Server metrics
//!
//! Lock-free counters, gauges and a latency histogram, gathered in one
//! global registry and rendered in the Prometheus text format.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for metadata store transactions (in milliseconds)
const TXN_BUCKETS: [f64; 10] = [1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0, 3000.0];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&TXN_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // Stored as microseconds for precision
        self.sum.fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative buckets, last one is +Inf
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);
        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }
        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));
        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters keyed by a single label value
#[derive(Debug, Default)]
pub struct LabeledCounter {
    values: Mutex<BTreeMap<String, Arc<Counter>>>,
}

impl LabeledCounter {
    pub fn with_label(&self, label: &str) -> Arc<Counter> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values
            .entry(label.to_string())
            .or_insert_with(|| Arc::new(Counter::new()))
            .clone()
    }

    pub fn get(&self, label: &str) -> u64 {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(label).map_or(0, |c| c.get())
    }

    fn snapshot(&self) -> Vec<(String, u64)> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.iter().map(|(k, v)| (k.clone(), v.get())).collect()
    }
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    /// Cluster ID carried as a label since it does not fit an f64
    pub cluster_id: Gauge,

    /// Metadata store state
    pub store_term: Gauge,
    pub store_applied_index: Gauge,
    pub store_committed_index: Gauge,

    /// 1 while this node holds leadership
    pub is_leader: Gauge,
    pub leader_changes: Counter,

    pub id_batches: Counter,
    pub ids_allocated: Counter,

    /// Bootstrap attempts by outcome (`ok`, `already_bootstrapped`, `invalid`, `error`)
    pub bootstrap: LabeledCounter,

    pub guarded_write_failures: Counter,
    pub config_persist_failures: Counter,
    pub slow_txns: Counter,
    pub txn_duration: Histogram,

    pub time_jump_back: Counter,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            cluster_id: Gauge::new(),
            store_term: Gauge::new(),
            store_applied_index: Gauge::new(),
            store_committed_index: Gauge::new(),
            is_leader: Gauge::new(),
            leader_changes: Counter::new(),
            id_batches: Counter::new(),
            ids_allocated: Counter::new(),
            bootstrap: LabeledCounter::default(),
            guarded_write_failures: Counter::new(),
            config_persist_failures: Counter::new(),
            slow_txns: Counter::new(),
            txn_duration: Histogram::new(),
            time_jump_back: Counter::new(),
            start_time: Instant::now(),
        }
    }

    pub fn record_txn(&self, elapsed: Duration) {
        self.txn_duration.observe(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let mut single = |name: &str, kind: &str, help: &str, value: u64| {
            let _ = writeln!(out, "# HELP minipd_{} {}", name, help);
            let _ = writeln!(out, "# TYPE minipd_{} {}", name, kind);
            let _ = writeln!(out, "minipd_{} {}", name, value);
        };

        single("store_term", "gauge", "Metadata store raft term", self.store_term.get());
        single(
            "store_applied_index",
            "gauge",
            "Metadata store applied index",
            self.store_applied_index.get(),
        );
        single(
            "store_committed_index",
            "gauge",
            "Metadata store committed index",
            self.store_committed_index.get(),
        );
        single("is_leader", "gauge", "Whether this node is the leader", self.is_leader.get());
        single(
            "leader_changes_total",
            "counter",
            "Leadership acquisitions and losses",
            self.leader_changes.get(),
        );
        single("id_batches_total", "counter", "ID batches reserved", self.id_batches.get());
        single("ids_allocated_total", "counter", "IDs handed out", self.ids_allocated.get());
        single(
            "guarded_write_failures_total",
            "counter",
            "Guarded writes rejected by the leadership check",
            self.guarded_write_failures.get(),
        );
        single(
            "config_persist_failures_total",
            "counter",
            "Config updates applied in memory but not persisted",
            self.config_persist_failures.get(),
        );
        single("slow_txns_total", "counter", "Transactions slower than 1s", self.slow_txns.get());
        single(
            "time_jump_back_total",
            "counter",
            "Times the system clock went backwards",
            self.time_jump_back.get(),
        );
        single("uptime_seconds", "gauge", "Server uptime in seconds", self.uptime_seconds());

        let _ = writeln!(out, "# HELP minipd_cluster_id Cluster ID as label");
        let _ = writeln!(out, "# TYPE minipd_cluster_id gauge");
        let _ = writeln!(out, "minipd_cluster_id{{cluster=\"{}\"}} 1", self.cluster_id.get());

        let _ = writeln!(out, "# HELP minipd_bootstrap_total Bootstrap attempts by outcome");
        let _ = writeln!(out, "# TYPE minipd_bootstrap_total counter");
        for (outcome, count) in self.bootstrap.snapshot() {
            let _ = writeln!(out, "minipd_bootstrap_total{{outcome=\"{}\"}} {}", outcome, count);
        }

        let _ = writeln!(out, "# HELP minipd_txn_duration_ms Metadata store transaction latency");
        let _ = writeln!(out, "# TYPE minipd_txn_duration_ms histogram");
        for (le, count) in self.txn_duration.get_buckets() {
            if le.is_infinite() {
                let _ = writeln!(out, "minipd_txn_duration_ms_bucket{{le=\"+Inf\"}} {}", count);
            } else {
                let _ = writeln!(out, "minipd_txn_duration_ms_bucket{{le=\"{}\"}} {}", le, count);
            }
        }
        let _ = writeln!(out, "minipd_txn_duration_ms_sum {}", self.txn_duration.sum());
        let _ = writeln!(out, "minipd_txn_duration_ms_count {}", self.txn_duration.count());

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new();
        hist.observe(0.5);
        hist.observe(20.0);
        hist.observe(10_000.0);
        assert_eq!(hist.count(), 3);

        let buckets = hist.get_buckets();
        assert_eq!(buckets.first().unwrap().1, 1);
        assert_eq!(buckets.last().unwrap().1, 3);
    }

    #[test]
    fn test_labeled_counter() {
        let c = LabeledCounter::default();
        c.with_label("ok").inc();
        c.with_label("ok").inc();
        c.with_label("already_bootstrapped").inc();
        assert_eq!(c.get("ok"), 2);
        assert_eq!(c.get("already_bootstrapped"), 1);
        assert_eq!(c.get("invalid"), 0);
    }

    #[test]
    fn test_prometheus_output() {
        let registry = MetricsRegistry::new();
        registry.cluster_id.set(42);
        registry.bootstrap.with_label("ok").inc();
        registry.record_txn(Duration::from_millis(3));

        let out = registry.to_prometheus();
        assert!(out.contains("minipd_cluster_id{cluster=\"42\"} 1"));
        assert!(out.contains("minipd_bootstrap_total{outcome=\"ok\"} 1"));
        assert!(out.contains("minipd_txn_duration_ms_count 1"));
    }
}
