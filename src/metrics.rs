use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sliding window of latency samples
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: Arc<Mutex<VecDeque<Duration>>>,
    window_size: usize,
}

impl LatencyWindow {
    pub fn new(window_size: usize) -> Self {
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(window_size))),
            window_size,
        }
    }

    /// Record one sample, evicting the oldest once the window is full
    pub fn record(&self, latency: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.window_size {
            samples.pop_front();
        }
        samples.push_back(latency);
    }

    /// Latency at quantile `q` (0.0-1.0), zero if nothing was recorded
    pub fn quantile(&self, q: f64) -> Duration {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return Duration::ZERO;
        }

        let mut sorted: Vec<_> = samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = ((sorted.len() as f64 * q).ceil() as usize).saturating_sub(1);
        sorted[idx.min(sorted.len() - 1)]
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}

/// Per-stage counters, shared between the stage thread and the orchestrator
#[derive(Debug, Clone)]
pub struct StageMetrics {
    processed: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    latency: LatencyWindow,
    start_time: Instant,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self {
            processed: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            latency: LatencyWindow::new(1000),
            start_time: Instant::now(),
        }
    }

    /// Record an item that went through the stage's work and how long it took
    pub fn record_processed(&self, latency: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.latency.record(latency);
    }

    /// Record a failed unit of work
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Items per second since the metrics were created
    pub fn throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.total_processed() as f64 / elapsed
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.total_processed(),
            errors: self.total_errors(),
            throughput: self.throughput(),
            latency_p50: self.latency.quantile(0.50),
            latency_p95: self.latency.quantile(0.95),
            latency_p99: self.latency.quantile(0.99),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Stage metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub errors: u64,
    pub throughput: f64,
    pub latency_p50: Duration,
    pub latency_p95: Duration,
    pub latency_p99: Duration,
    pub elapsed: Duration,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Processed: {}, Errors: {}, Throughput: {:.2} items/s, \
             Latency P50: {:.2?}, P95: {:.2?}, P99: {:.2?}, Elapsed: {:.2}s",
            self.processed,
            self.errors,
            self.throughput,
            self.latency_p50,
            self.latency_p95,
            self.latency_p99,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Lifetime counters owned by a queue
#[derive(Debug, Default)]
pub(crate) struct QueueStats {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    enqueue_waits: AtomicU64,
}

impl QueueStats {
    pub(crate) fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dequeued(&self) {
        self.dequeued.fetch_add(1, Ordering::Relaxed);
    }

    /// An enqueue found the queue full and had to block
    pub(crate) fn record_enqueue_wait(&self) {
        self.enqueue_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            enqueue_waits: self.enqueue_waits.load(Ordering::Relaxed),
        }
    }
}

/// Queue counters at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub enqueued: u64,
    pub dequeued: u64,
    /// Number of enqueues that found the queue full
    pub enqueue_waits: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_window() {
        let window = LatencyWindow::new(10);
        for i in 1..=10 {
            window.record(Duration::from_micros(i));
        }
        assert_eq!(window.quantile(0.50), Duration::from_micros(5));
        assert_eq!(window.quantile(0.99), Duration::from_micros(10));
    }

    #[test]
    fn test_latency_window_evicts_oldest() {
        let window = LatencyWindow::new(3);
        for i in 1..=5 {
            window.record(Duration::from_millis(i));
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.quantile(0.0), Duration::from_millis(3));
    }

    #[test]
    fn test_empty_window_is_zero() {
        let window = LatencyWindow::new(4);
        assert!(window.is_empty());
        assert_eq!(window.quantile(0.95), Duration::ZERO);
    }

    #[test]
    fn test_stage_metrics() {
        let metrics = StageMetrics::new();
        for _ in 0..100 {
            metrics.record_processed(Duration::from_micros(1));
        }
        metrics.record_error();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.processed, 100);
        assert_eq!(snapshot.errors, 1);
        assert!(snapshot.to_string().starts_with("Processed: 100, Errors: 1"));
    }

    #[test]
    fn test_stage_metrics_clone_shares_counters() {
        let metrics = StageMetrics::new();
        let handle = metrics.clone();
        handle.record_processed(Duration::from_micros(3));
        assert_eq!(metrics.total_processed(), 1);
    }
}
