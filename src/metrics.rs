//! Execution metrics for monitoring and observability.
//!
//! Per-invocation metrics ride on every `WasmResult`; the process-wide
//! collector aggregates them into counters, a duration histogram, and
//! per-instance peak memory, exported in text exposition format.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::context::ExecutionStatus;

/// Histogram bucket upper bounds for handler execution time, in seconds
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Metrics collected for a single execute/resume span
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    /// Span duration in microseconds
    pub duration_us: u64,

    /// Memory in use by the instance at the end of the span
    pub memory_used_bytes: u64,

    /// Peak memory over the instance's lifetime so far
    pub memory_peak_bytes: u64,

    /// Host ABI call counts by function name
    pub host_calls: HashMap<String, u32>,

    /// Whether the compile cache was hit for this handler
    pub cache_hit: bool,

    /// Compilation time in microseconds (absent on cache hits)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_time_us: Option<u64>,
}

impl ExecutionMetrics {
    /// Create empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the span duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_us = duration.as_micros() as u64;
        self
    }

    /// Record memory usage
    pub fn with_memory(mut self, used: u64, peak: u64) -> Self {
        self.memory_used_bytes = used;
        self.memory_peak_bytes = peak;
        self
    }

    /// Record host call counts
    pub fn with_host_calls(mut self, calls: HashMap<String, u32>) -> Self {
        self.host_calls = calls;
        self
    }

    /// Record whether compilation was cached
    pub fn with_cache_hit(mut self, hit: bool) -> Self {
        self.cache_hit = hit;
        self
    }

    /// Total host calls in the span
    pub fn total_host_calls(&self) -> u32 {
        self.host_calls.values().sum()
    }
}

/// Snapshot of runtime-wide statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStats {
    /// Total execute/resume spans completed
    pub total_executions: u64,

    /// Instances currently executing
    pub active: usize,

    /// Idle instances in the pool
    pub available: usize,

    /// Instances parked on a suspension
    pub parked: usize,

    /// Compile cache hit rate (0-1)
    pub cache_hit_rate: f64,

    /// Average span duration in microseconds
    pub avg_exec_us: f64,

    /// Memory held by active and parked instances
    pub memory_total: u64,
}

/// Instance gauges supplied by the pool at exposition time
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolGauges {
    /// Instances currently executing
    pub active: usize,
    /// Instances parked on a suspension
    pub parked: usize,
    /// Idle instances
    pub idle: usize,
}

/// Fixed-bucket duration histogram
struct DurationHistogram {
    buckets: Vec<AtomicU64>,
    sum_us: AtomicU64,
    count: AtomicU64,
}

impl DurationHistogram {
    fn new() -> Self {
        Self {
            buckets: (0..DURATION_BUCKETS.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, duration_us: u64) {
        let seconds = duration_us as f64 / 1_000_000.0;
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_us.fetch_add(duration_us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn render(&self, out: &mut String, name: &str) {
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            let _ = writeln!(
                out,
                "{}_bucket{{le=\"{}\"}} {}",
                name,
                bound,
                self.buckets[i].load(Ordering::Relaxed)
            );
        }
        let count = self.count.load(Ordering::Relaxed);
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, count);
        let _ = writeln!(
            out,
            "{}_sum {}",
            name,
            self.sum_us.load(Ordering::Relaxed) as f64 / 1_000_000.0
        );
        let _ = writeln!(out, "{}_count {}", name, count);
    }
}

/// Process-wide metrics collector
pub struct MetricsCollector {
    success: AtomicU64,
    error: AtomicU64,
    suspended: AtomicU64,
    total_duration_us: AtomicU64,
    duration_histogram: DurationHistogram,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    host_calls: parking_lot::Mutex<HashMap<String, u64>>,
    instance_peaks: parking_lot::Mutex<HashMap<String, u64>>,
    error_counts: parking_lot::Mutex<HashMap<String, u64>>,
}

impl MetricsCollector {
    /// Create a new collector
    pub fn new() -> Self {
        Self {
            success: AtomicU64::new(0),
            error: AtomicU64::new(0),
            suspended: AtomicU64::new(0),
            total_duration_us: AtomicU64::new(0),
            duration_histogram: DurationHistogram::new(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            host_calls: parking_lot::Mutex::new(HashMap::new()),
            instance_peaks: parking_lot::Mutex::new(HashMap::new()),
            error_counts: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Record a completed execute/resume span
    pub fn record_execution(&self, metrics: &ExecutionMetrics, status: ExecutionStatus) {
        match status {
            ExecutionStatus::Success => self.success.fetch_add(1, Ordering::Relaxed),
            ExecutionStatus::Error => self.error.fetch_add(1, Ordering::Relaxed),
            ExecutionStatus::Suspended => self.suspended.fetch_add(1, Ordering::Relaxed),
        };

        self.total_duration_us
            .fetch_add(metrics.duration_us, Ordering::Relaxed);
        self.duration_histogram.observe(metrics.duration_us);

        let mut host_calls = self.host_calls.lock();
        for (name, count) in &metrics.host_calls {
            *host_calls.entry(name.clone()).or_insert(0) += *count as u64;
        }
    }

    /// Record a compile cache lookup
    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record (monotonically) an instance's peak memory
    pub fn record_instance_peak(&self, instance_id: &str, peak_bytes: u64) {
        let mut peaks = self.instance_peaks.lock();
        let entry = peaks.entry(instance_id.to_string()).or_insert(0);
        if peak_bytes > *entry {
            *entry = peak_bytes;
        }
    }

    /// Drop an instance's peak memory series when the instance is destroyed
    pub fn drop_instance(&self, instance_id: &str) {
        self.instance_peaks.lock().remove(instance_id);
    }

    /// Record an error by code for the error-rate series
    pub fn record_error(&self, code: &str) {
        let mut counts = self.error_counts.lock();
        *counts.entry(code.to_string()).or_insert(0) += 1;
    }

    /// Total execute/resume spans recorded
    pub fn total_executions(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
            + self.error.load(Ordering::Relaxed)
            + self.suspended.load(Ordering::Relaxed)
    }

    /// Compile cache hit rate (0-1)
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Average span duration in microseconds
    pub fn avg_execution_time_us(&self) -> f64 {
        let total = self.total_executions();
        if total == 0 {
            0.0
        } else {
            self.total_duration_us.load(Ordering::Relaxed) as f64 / total as f64
        }
    }

    /// Render all series in text exposition format
    pub fn render(&self, gauges: PoolGauges) -> String {
        let mut out = String::new();

        out.push_str("# HELP handler_executions_total Handler execution spans by status\n");
        out.push_str("# TYPE handler_executions_total counter\n");
        let _ = writeln!(
            out,
            "handler_executions_total{{status=\"success\"}} {}",
            self.success.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "handler_executions_total{{status=\"error\"}} {}",
            self.error.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "handler_executions_total{{status=\"suspended\"}} {}",
            self.suspended.load(Ordering::Relaxed)
        );

        out.push_str("\n# HELP handler_execution_seconds Handler execution span duration\n");
        out.push_str("# TYPE handler_execution_seconds histogram\n");
        self.duration_histogram
            .render(&mut out, "handler_execution_seconds");

        out.push_str("\n# HELP compile_cache_hits_total Compile cache hits\n");
        out.push_str("# TYPE compile_cache_hits_total counter\n");
        let _ = writeln!(
            out,
            "compile_cache_hits_total {}",
            self.cache_hits.load(Ordering::Relaxed)
        );
        out.push_str("# HELP compile_cache_misses_total Compile cache misses\n");
        out.push_str("# TYPE compile_cache_misses_total counter\n");
        let _ = writeln!(
            out,
            "compile_cache_misses_total {}",
            self.cache_misses.load(Ordering::Relaxed)
        );

        out.push_str("\n# HELP peak_memory_bytes Peak linear memory per live instance\n");
        out.push_str("# TYPE peak_memory_bytes gauge\n");
        {
            let peaks = self.instance_peaks.lock();
            let mut ids: Vec<_> = peaks.keys().collect();
            ids.sort();
            for id in ids {
                let _ = writeln!(out, "peak_memory_bytes{{instance_id=\"{}\"}} {}", id, peaks[id]);
            }
        }

        out.push_str("\n# HELP host_calls_total Host ABI calls by function\n");
        out.push_str("# TYPE host_calls_total counter\n");
        {
            let calls = self.host_calls.lock();
            let mut names: Vec<_> = calls.keys().collect();
            names.sort();
            for name in names {
                let _ = writeln!(out, "host_calls_total{{name=\"{}\"}} {}", name, calls[name]);
            }
        }

        out.push_str("\n# HELP active_instances Instances currently executing\n");
        out.push_str("# TYPE active_instances gauge\n");
        let _ = writeln!(out, "active_instances {}", gauges.active);
        out.push_str("# HELP parked_instances Instances parked on a suspension\n");
        out.push_str("# TYPE parked_instances gauge\n");
        let _ = writeln!(out, "parked_instances {}", gauges.parked);
        out.push_str("# HELP idle_instances Idle pooled instances\n");
        out.push_str("# TYPE idle_instances gauge\n");
        let _ = writeln!(out, "idle_instances {}", gauges.idle);

        {
            let errors = self.error_counts.lock();
            if !errors.is_empty() {
                out.push_str("\n# HELP handler_errors_total Handler errors by code\n");
                out.push_str("# TYPE handler_errors_total counter\n");
                let mut codes: Vec<_> = errors.keys().collect();
                codes.sort();
                for code in codes {
                    let _ = writeln!(
                        out,
                        "handler_errors_total{{code=\"{}\"}} {}",
                        code, errors[code]
                    );
                }
            }
        }

        out
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer for measuring an execute/resume span
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    /// Start a new timer
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Build span metrics from the timer
    pub fn into_metrics(self, cache_hit: bool) -> ExecutionMetrics {
        ExecutionMetrics::new()
            .with_duration(self.elapsed())
            .with_cache_hit(cache_hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_builder() {
        let metrics = ExecutionMetrics::new()
            .with_duration(Duration::from_millis(100))
            .with_cache_hit(true)
            .with_memory(1000, 2000);

        assert_eq!(metrics.duration_us, 100_000);
        assert!(metrics.cache_hit);
        assert_eq!(metrics.memory_peak_bytes, 2000);
    }

    #[test]
    fn test_collector_status_counters() {
        let collector = MetricsCollector::new();
        let metrics = ExecutionMetrics::new().with_duration(Duration::from_millis(10));

        collector.record_execution(&metrics, ExecutionStatus::Success);
        collector.record_execution(&metrics, ExecutionStatus::Suspended);
        collector.record_execution(&metrics, ExecutionStatus::Error);

        assert_eq!(collector.total_executions(), 3);
        assert!((collector.avg_execution_time_us() - 10_000.0).abs() < 1.0);
    }

    #[test]
    fn test_cache_hit_rate() {
        let collector = MetricsCollector::new();

        collector.record_cache_lookup(true);
        collector.record_cache_lookup(true);
        collector.record_cache_lookup(false);

        assert!((collector.cache_hit_rate() - 2.0 / 3.0).abs() < 0.001);
    }

    #[test]
    fn test_exposition_series_names() {
        let collector = MetricsCollector::new();
        let mut metrics = ExecutionMetrics::new().with_duration(Duration::from_millis(5));
        metrics.host_calls.insert("state_set".to_string(), 3);

        collector.record_execution(&metrics, ExecutionStatus::Success);
        collector.record_cache_lookup(false);
        collector.record_instance_peak("inst-1", 4096);

        let text = collector.render(PoolGauges {
            active: 1,
            parked: 2,
            idle: 3,
        });

        assert!(text.contains("handler_executions_total{status=\"success\"} 1"));
        assert!(text.contains("handler_executions_total{status=\"suspended\"} 0"));
        assert!(text.contains("handler_execution_seconds_bucket"));
        assert!(text.contains("handler_execution_seconds_count 1"));
        assert!(text.contains("compile_cache_misses_total 1"));
        assert!(text.contains("peak_memory_bytes{instance_id=\"inst-1\"} 4096"));
        assert!(text.contains("host_calls_total{name=\"state_set\"} 3"));
        assert!(text.contains("active_instances 1"));
        assert!(text.contains("parked_instances 2"));
        assert!(text.contains("idle_instances 3"));
    }

    #[test]
    fn test_instance_peak_dropped_on_destroy() {
        let collector = MetricsCollector::new();
        collector.record_instance_peak("gone", 1);
        collector.drop_instance("gone");

        let text = collector.render(PoolGauges::default());
        assert!(!text.contains("instance_id=\"gone\""));
    }

    #[test]
    fn test_histogram_buckets_cumulative() {
        let collector = MetricsCollector::new();
        // 2ms lands in every bucket from 2.5ms upward.
        let metrics = ExecutionMetrics::new().with_duration(Duration::from_millis(2));
        collector.record_execution(&metrics, ExecutionStatus::Success);

        let text = collector.render(PoolGauges::default());
        assert!(text.contains("handler_execution_seconds_bucket{le=\"0.001\"} 0"));
        assert!(text.contains("handler_execution_seconds_bucket{le=\"0.0025\"} 1"));
        assert!(text.contains("handler_execution_seconds_bucket{le=\"+Inf\"} 1"));
    }
}
