//! Metrics collection and reporting.
//!
//! Follows the teacher's pattern of global `prometheus` vecs behind a
//! `once_cell::sync::Lazy` registry for the scrape-endpoint surface, plus a
//! rolling-window collector (spec.md §4.5) for queue depth, throughput and
//! submission-to-assign latency percentiles that the scrape endpoint alone
//! can't answer cheaply.

use crate::error::Result;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec, Registry,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Global metrics registry.
pub static METRICS_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static TASKS_SUBMITTED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "task_queue_submitted_total",
        "Total number of tasks submitted",
        &["priority"]
    )
    .unwrap()
});

pub static TASKS_COMPLETED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "task_queue_completed_total",
        "Total number of tasks completed",
        &["outcome"]
    )
    .unwrap()
});

pub static ASSIGN_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "task_queue_assign_latency_seconds",
        "Submission-to-assignment latency in seconds",
        &["priority"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    )
    .unwrap()
});

pub static QUEUE_DEPTH: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "task_queue_depth",
        "Number of tasks currently queued",
        &["priority"]
    )
    .unwrap()
});

pub static AGENT_UTILIZATION: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "task_queue_agent_utilization",
        "Fraction of agent capacity in use",
        &["agent_id"]
    )
    .unwrap()
});

pub static ERROR_COUNTER: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "task_queue_errors_total",
        "Total number of errors",
        &["error_type", "severity"]
    )
    .unwrap()
});

/// Register all metrics with the global registry. Call once at startup.
pub fn init_metrics() -> Result<()> {
    METRICS_REGISTRY.register(Box::new(TASKS_SUBMITTED.clone()))?;
    METRICS_REGISTRY.register(Box::new(TASKS_COMPLETED.clone()))?;
    METRICS_REGISTRY.register(Box::new(ASSIGN_LATENCY.clone()))?;
    METRICS_REGISTRY.register(Box::new(QUEUE_DEPTH.clone()))?;
    METRICS_REGISTRY.register(Box::new(AGENT_UTILIZATION.clone()))?;
    METRICS_REGISTRY.register(Box::new(ERROR_COUNTER.clone()))?;
    Ok(())
}

impl From<prometheus::Error> for crate::error::Error {
    fn from(e: prometheus::Error) -> Self {
        crate::error::Error::Internal(e.to_string())
    }
}

/// Percentile snapshot of a latency window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Fixed-capacity ring buffer of millisecond samples with O(1) insert and
/// O(n log n) percentile queries — acceptable per spec.md §4.5 since writes
/// vastly outnumber reads.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    capacity: usize,
    samples: VecDeque<u64>,
}

impl LatencyWindow {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, value: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value.as_millis() as u64);
    }

    #[must_use]
    pub fn percentiles(&self) -> Percentiles {
        if self.samples.is_empty() {
            return Percentiles::default();
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let at = |q: f64| -> f64 {
            let idx = ((sorted.len() as f64 - 1.0) * q).round() as usize;
            sorted[idx.min(sorted.len() - 1)] as f64
        };
        Percentiles {
            p50_ms: at(0.50),
            p95_ms: at(0.95),
            p99_ms: at(0.99),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// One rolling window's worth of queue statistics (spec.md §4.5): queue
/// depth by priority, throughput, submission-to-assign latency, success
/// rate, agent utilization, per-kind average execution time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowStats {
    pub completed: u64,
    pub failed: u64,
    pub submitted: u64,
    pub assign_latency: Option<Percentiles>,
    pub avg_execution_ms_by_kind: HashMap<String, f64>,
}

impl WindowStats {
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let total = self.completed + self.failed;
        if total == 0 {
            1.0
        } else {
            self.completed as f64 / total as f64
        }
    }

    #[must_use]
    pub fn throughput_per_min(&self, window: Duration) -> f64 {
        let minutes = window.as_secs_f64() / 60.0;
        if minutes == 0.0 {
            0.0
        } else {
            self.completed as f64 / minutes
        }
    }
}

/// Live rolling-window manager: the thing `spawn_metrics_listener` actually
/// updates, and what answers a `QueueStatus` call's perf-snapshot fields
/// (spec.md §4.5). Separate from the flat `prometheus` vecs above, which
/// only ever grow monotonically and can't answer "right now" questions.
#[derive(Debug)]
pub struct MetricsWindow {
    assign_latency: Mutex<LatencyWindow>,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    exec_ms_by_kind: Mutex<HashMap<String, (f64, u64)>>,
}

impl MetricsWindow {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            assign_latency: Mutex::new(LatencyWindow::new(capacity)),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            exec_ms_by_kind: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_assign_latency(&self, latency: Duration) {
        self.assign_latency.lock().record(latency);
    }

    pub fn record_execution(&self, kind: &str, duration: Duration) {
        let mut by_kind = self.exec_ms_by_kind.lock();
        let entry = by_kind.entry(kind.to_string()).or_insert((0.0, 0));
        entry.1 += 1;
        entry.0 += (duration.as_millis() as f64 - entry.0) / entry.1 as f64;
    }

    #[must_use]
    pub fn snapshot(&self) -> WindowStats {
        WindowStats {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            assign_latency: Some(self.assign_latency.lock().percentiles()),
            avg_execution_ms_by_kind: self
                .exec_ms_by_kind
                .lock()
                .iter()
                .map(|(k, (avg, _))| (k.clone(), *avg))
                .collect(),
        }
    }
}

impl Default for MetricsWindow {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// MetricsCollector is read-only with respect to the scheduler — it only
/// observes events published on the event bus and answers queries in O(1)
/// beyond the percentile computation above.
pub trait MetricsCollector: Send + Sync {
    fn record_submitted(&self, priority: &str);
    fn record_completed(&self, outcome: &str);
    fn record_assign_latency(&self, priority: &str, latency: Duration);
    fn set_queue_depth(&self, priority: &str, depth: i64);
    fn set_agent_utilization(&self, agent_id: &str, utilization: f64);
    fn record_error(&self, error_type: &str, severity: &str);
}

/// Default collector: writes straight through to the global prometheus vecs.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusMetricsCollector;

impl MetricsCollector for PrometheusMetricsCollector {
    fn record_submitted(&self, priority: &str) {
        TASKS_SUBMITTED.with_label_values(&[priority]).inc();
    }

    fn record_completed(&self, outcome: &str) {
        TASKS_COMPLETED.with_label_values(&[outcome]).inc();
    }

    fn record_assign_latency(&self, priority: &str, latency: Duration) {
        ASSIGN_LATENCY
            .with_label_values(&[priority])
            .observe(latency.as_secs_f64());
    }

    fn set_queue_depth(&self, priority: &str, depth: i64) {
        QUEUE_DEPTH.with_label_values(&[priority]).set(depth as f64);
    }

    fn set_agent_utilization(&self, agent_id: &str, utilization: f64) {
        AGENT_UTILIZATION
            .with_label_values(&[agent_id])
            .set(utilization);
    }

    fn record_error(&self, error_type: &str, severity: &str) {
        ERROR_COUNTER
            .with_label_values(&[error_type, severity])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_window_computes_percentiles() {
        let mut window = LatencyWindow::new(1024);
        for ms in 1..=100u64 {
            window.record(Duration::from_millis(ms));
        }
        let p = window.percentiles();
        assert!((p.p50_ms - 50.0).abs() <= 1.0);
        assert!(p.p99_ms >= 98.0);
    }

    #[test]
    fn latency_window_evicts_oldest() {
        let mut window = LatencyWindow::new(2);
        window.record(Duration::from_millis(1));
        window.record(Duration::from_millis(2));
        window.record(Duration::from_millis(3));
        assert_eq!(window.len(), 2);
        let p = window.percentiles();
        assert!(p.p50_ms >= 2.0);
    }

    #[test]
    fn success_rate_with_no_samples_is_one() {
        assert_eq!(WindowStats::default().success_rate(), 1.0);
    }

    #[test]
    fn metrics_window_snapshot_reflects_recorded_events() {
        let window = MetricsWindow::new(16);
        window.record_submitted();
        window.record_submitted();
        window.record_completed();
        window.record_failed();
        window.record_assign_latency(Duration::from_millis(50));
        window.record_execution("noop", Duration::from_millis(10));
        window.record_execution("noop", Duration::from_millis(20));

        let snapshot = window.snapshot();
        assert_eq!(snapshot.submitted, 2);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.assign_latency.unwrap().p50_ms, 50.0);
        assert!((snapshot.avg_execution_ms_by_kind["noop"] - 15.0).abs() < 0.01);
    }
}
