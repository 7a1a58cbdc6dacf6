//! Metrics collector — per-service request tracking.
//!
//! Counters are atomics; latency samples and completion timestamps sit
//! behind a short-lived mutex per service. Every record also feeds an
//! overall bucket so balancer-wide figures need no aggregation pass.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

/// Latency samples kept per service.
pub const DEFAULT_SAMPLE_CAPACITY: usize = 1024;

/// Window over which requests per second is measured.
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(10);

/// Mean and tail latency over the sample window, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub avg_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Point-in-time figures for one service.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceSnapshot {
    pub service_id: String,
    pub requests_served: u64,
    pub requests_failed: u64,
    pub requests_per_second: f64,
    pub latency: LatencySummary,
    /// Filled in by the balancer, which owns the queues.
    pub queued_requests: usize,
    /// Filled in by the balancer, which owns the instance pools.
    pub running_instances: u32,
}

struct Window {
    latencies_ms: VecDeque<f64>,
    completions: VecDeque<Instant>,
}

/// Per-service metrics bucket.
struct ServiceMetrics {
    served: AtomicU64,
    failed: AtomicU64,
    window: Mutex<Window>,
}

impl ServiceMetrics {
    fn new(sample_capacity: usize) -> Self {
        Self {
            served: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            window: Mutex::new(Window {
                latencies_ms: VecDeque::with_capacity(sample_capacity),
                completions: VecDeque::new(),
            }),
        }
    }

    fn window(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_success(&self, latency: Duration, capacity: usize, rate_window: Duration) {
        self.served.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut window = self.window();
        if window.latencies_ms.len() == capacity {
            window.latencies_ms.pop_front();
        }
        window.latencies_ms.push_back(latency.as_secs_f64() * 1000.0);
        window.completions.push_back(now);
        prune(&mut window.completions, now, rate_window);
    }

    fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn summary(&self) -> LatencySummary {
        let window = self.window();
        let samples: Vec<f64> = window.latencies_ms.iter().copied().collect();
        drop(window);

        if samples.is_empty() {
            return LatencySummary::default();
        }
        let avg_ms = samples.iter().sum::<f64>() / samples.len() as f64;
        let (p95_ms, p99_ms) = compute_percentiles(&samples);
        LatencySummary { avg_ms, p95_ms, p99_ms }
    }

    fn requests_per_second(&self, rate_window: Duration) -> f64 {
        let mut window = self.window();
        prune(&mut window.completions, Instant::now(), rate_window);
        window.completions.len() as f64 / rate_window.as_secs_f64()
    }
}

/// Collects request metrics across all services.
pub struct MetricsCollector {
    services: RwLock<HashMap<String, Arc<ServiceMetrics>>>,
    overall: ServiceMetrics,
    sample_capacity: usize,
    rate_window: Duration,
}

impl MetricsCollector {
    pub fn new(sample_capacity: usize, rate_window: Duration) -> Self {
        let sample_capacity = sample_capacity.max(1);
        Self {
            services: RwLock::new(HashMap::new()),
            overall: ServiceMetrics::new(sample_capacity),
            sample_capacity,
            rate_window: rate_window.max(Duration::from_millis(1)),
        }
    }

    /// Start tracking a service. Idempotent.
    pub fn register(&self, service_id: &str) {
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        services
            .entry(service_id.to_string())
            .or_insert_with(|| Arc::new(ServiceMetrics::new(self.sample_capacity)));
        debug!(service = %service_id, "registered for metrics collection");
    }

    pub fn unregister(&self, service_id: &str) {
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        services.remove(service_id);
        debug!(service = %service_id, "unregistered from metrics collection");
    }

    /// Record a request that completed successfully after `latency`.
    pub fn record_success(&self, service_id: &str, latency: Duration) {
        self.overall
            .record_success(latency, self.sample_capacity, self.rate_window);
        if let Some(m) = self.service(service_id) {
            m.record_success(latency, self.sample_capacity, self.rate_window);
        }
    }

    /// Record a request that ended in an error of any kind.
    pub fn record_failure(&self, service_id: &str) {
        self.overall.record_failure();
        if let Some(m) = self.service(service_id) {
            m.record_failure();
        }
    }

    /// Successful requests across all services since startup.
    pub fn total_served(&self) -> u64 {
        self.overall.served.load(Ordering::Relaxed)
    }

    pub fn total_failed(&self) -> u64 {
        self.overall.failed.load(Ordering::Relaxed)
    }

    /// Latency across all services.
    pub fn summary(&self) -> LatencySummary {
        self.overall.summary()
    }

    /// Successful requests per second across all services.
    pub fn requests_per_second(&self) -> f64 {
        self.overall.requests_per_second(self.rate_window)
    }

    /// Figures for one service, or `None` if it is not tracked.
    pub fn snapshot(&self, service_id: &str) -> Option<ServiceSnapshot> {
        let m = self.service(service_id)?;
        Some(ServiceSnapshot {
            service_id: service_id.to_string(),
            requests_served: m.served.load(Ordering::Relaxed),
            requests_failed: m.failed.load(Ordering::Relaxed),
            requests_per_second: m.requests_per_second(self.rate_window),
            latency: m.summary(),
            ..Default::default()
        })
    }

    /// Figures for every tracked service, ordered by service id.
    pub fn snapshots(&self) -> Vec<ServiceSnapshot> {
        let mut ids: Vec<String> = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids.iter().filter_map(|id| self.snapshot(id)).collect()
    }

    fn service(&self, service_id: &str) -> Option<Arc<ServiceMetrics>> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service_id)
            .cloned()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_CAPACITY, DEFAULT_RATE_WINDOW)
    }
}

fn prune(completions: &mut VecDeque<Instant>, now: Instant, rate_window: Duration) {
    while completions
        .front()
        .is_some_and(|at| now.saturating_duration_since(*at) > rate_window)
    {
        completions.pop_front();
    }
}

/// Compute P95 and P99 from unsorted samples.
///
/// Returns (p95, p99). If empty, returns (0.0, 0.0).
fn compute_percentiles(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }

    let mut sorted = samples.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);

    let last = sorted.len() - 1;
    let p95_idx = (sorted.len() as f64 * 0.95) as usize;
    let p99_idx = (sorted.len() as f64 * 0.99) as usize;

    (sorted[p95_idx.min(last)], sorted[p99_idx.min(last)])
}
