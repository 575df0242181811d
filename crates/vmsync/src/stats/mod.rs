//! Stats Module - Synchronization Counters
//!
//! Counters for each monitor path (fast, recursive, spin, block), for
//! inflation and reservation cancellation, and for exclusive-access
//! rendezvous. Convergence latencies go into histograms.
//!
//! All counters are relaxed atomics. They are diagnostics, not part of the
//! protocol.

pub mod histogram;

pub use histogram::Histogram;

use indexmap::IndexMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

pub struct SyncStats {
    enabled: AtomicBool,
    fast_enters: AtomicU64,
    recursive_enters: AtomicU64,
    spin_acquires: AtomicU64,
    blocking_enters: AtomicU64,
    inflations: AtomicU64,
    reservation_cancellations: AtomicU64,
    records_allocated: AtomicU64,
    exclusive_grants: AtomicU64,
    handoffs: AtomicU64,
    safepoints: AtomicU64,
    slow_exclusive: AtomicU64,
    /// Time from exclusive request to grant, microseconds
    exclusive_latency: Histogram,
    /// Time spent blocked in monitor enter, microseconds
    block_latency: Histogram,
}

/// Which monitor-enter path produced an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterPath {
    Fast,
    Recursive,
    Spin,
    Blocking,
}

impl SyncStats {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            fast_enters: AtomicU64::new(0),
            recursive_enters: AtomicU64::new(0),
            spin_acquires: AtomicU64::new(0),
            blocking_enters: AtomicU64::new(0),
            inflations: AtomicU64::new(0),
            reservation_cancellations: AtomicU64::new(0),
            records_allocated: AtomicU64::new(0),
            exclusive_grants: AtomicU64::new(0),
            handoffs: AtomicU64::new(0),
            safepoints: AtomicU64::new(0),
            slow_exclusive: AtomicU64::new(0),
            exclusive_latency: Histogram::new(),
            block_latency: Histogram::new(),
        }
    }

    fn bump(&self, counter: &AtomicU64) {
        if self.enabled.load(Ordering::Relaxed) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_enter(&self, path: EnterPath) {
        match path {
            EnterPath::Fast => self.bump(&self.fast_enters),
            EnterPath::Recursive => self.bump(&self.recursive_enters),
            EnterPath::Spin => self.bump(&self.spin_acquires),
            EnterPath::Blocking => self.bump(&self.blocking_enters),
        }
    }

    pub fn record_blocked(&self, duration: Duration) {
        if self.enabled.load(Ordering::Relaxed) {
            self.block_latency.record(duration.as_micros() as u64);
        }
    }

    pub fn record_inflation(&self) {
        self.bump(&self.inflations);
    }

    pub fn record_reservation_cancelled(&self) {
        self.bump(&self.reservation_cancellations);
    }

    /// Always counted: the monitor table relies on it for diagnostics even
    /// with stats disabled.
    pub fn record_record_allocated(&self) {
        self.records_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exclusive_granted(&self, latency: Duration) {
        self.bump(&self.exclusive_grants);
        if self.enabled.load(Ordering::Relaxed) {
            self.exclusive_latency.record(latency.as_micros() as u64);
        }
    }

    pub fn record_handoff(&self) {
        self.bump(&self.handoffs);
    }

    pub fn record_safepoint(&self) {
        self.bump(&self.safepoints);
    }

    pub fn record_slow_exclusive(&self) {
        self.bump(&self.slow_exclusive);
    }

    pub fn records_allocated(&self) -> u64 {
        self.records_allocated.load(Ordering::Relaxed)
    }

    pub fn exclusive_latency(&self) -> &Histogram {
        &self.exclusive_latency
    }

    pub fn summary(&self) -> SyncSummary {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SyncSummary {
            fast_enters: load(&self.fast_enters),
            recursive_enters: load(&self.recursive_enters),
            spin_acquires: load(&self.spin_acquires),
            blocking_enters: load(&self.blocking_enters),
            inflations: load(&self.inflations),
            reservation_cancellations: load(&self.reservation_cancellations),
            records_allocated: load(&self.records_allocated),
            exclusive_grants: load(&self.exclusive_grants),
            handoffs: load(&self.handoffs),
            safepoints: load(&self.safepoints),
            slow_exclusive: load(&self.slow_exclusive),
            exclusive_p50_us: self.exclusive_latency.p50(),
            exclusive_p99_us: self.exclusive_latency.p99(),
            exclusive_max_us: self.exclusive_latency.max(),
            block_p50_us: self.block_latency.p50(),
            block_max_us: self.block_latency.max(),
        }
    }

    pub fn reset(&self) {
        for c in [
            &self.fast_enters,
            &self.recursive_enters,
            &self.spin_acquires,
            &self.blocking_enters,
            &self.inflations,
            &self.reservation_cancellations,
            &self.records_allocated,
            &self.exclusive_grants,
            &self.handoffs,
            &self.safepoints,
            &self.slow_exclusive,
        ] {
            c.store(0, Ordering::Relaxed);
        }
        self.exclusive_latency.clear();
        self.block_latency.clear();
    }
}

impl Default for SyncStats {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Point-in-time copy of [`SyncStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub fast_enters: u64,
    pub recursive_enters: u64,
    pub spin_acquires: u64,
    pub blocking_enters: u64,
    pub inflations: u64,
    pub reservation_cancellations: u64,
    pub records_allocated: u64,
    pub exclusive_grants: u64,
    pub handoffs: u64,
    pub safepoints: u64,
    pub slow_exclusive: u64,
    pub exclusive_p50_us: u64,
    pub exclusive_p99_us: u64,
    pub exclusive_max_us: u64,
    pub block_p50_us: u64,
    pub block_max_us: u64,
}

/// Metric value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(f64),
}

impl MetricValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            MetricValue::Counter(v) => *v as f64,
            MetricValue::Gauge(v) => *v,
        }
    }
}

impl SyncSummary {
    pub fn total_enters(&self) -> u64 {
        self.fast_enters + self.recursive_enters + self.spin_acquires + self.blocking_enters
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Metrics in a stable export order.
    pub fn metrics(&self) -> IndexMap<&'static str, MetricValue> {
        let mut m = IndexMap::new();
        m.insert("vmsync_monitor_enters_fast_total", MetricValue::Counter(self.fast_enters));
        m.insert(
            "vmsync_monitor_enters_recursive_total",
            MetricValue::Counter(self.recursive_enters),
        );
        m.insert("vmsync_monitor_enters_spin_total", MetricValue::Counter(self.spin_acquires));
        m.insert(
            "vmsync_monitor_enters_blocking_total",
            MetricValue::Counter(self.blocking_enters),
        );
        m.insert("vmsync_monitor_inflations_total", MetricValue::Counter(self.inflations));
        m.insert(
            "vmsync_reservation_cancellations_total",
            MetricValue::Counter(self.reservation_cancellations),
        );
        m.insert("vmsync_monitor_records_total", MetricValue::Counter(self.records_allocated));
        m.insert("vmsync_exclusive_grants_total", MetricValue::Counter(self.exclusive_grants));
        m.insert("vmsync_exclusive_handoffs_total", MetricValue::Counter(self.handoffs));
        m.insert("vmsync_safepoints_total", MetricValue::Counter(self.safepoints));
        m.insert("vmsync_exclusive_slow_total", MetricValue::Counter(self.slow_exclusive));
        m.insert(
            "vmsync_exclusive_latency_p99_us",
            MetricValue::Gauge(self.exclusive_p99_us as f64),
        );
        m.insert(
            "vmsync_monitor_block_max_us",
            MetricValue::Gauge(self.block_max_us as f64),
        );
        m
    }

    /// Export to Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        for (name, value) in self.metrics() {
            output.push_str(&format!("{} {}\n", name, value.as_f64()));
        }
        output
    }
}
