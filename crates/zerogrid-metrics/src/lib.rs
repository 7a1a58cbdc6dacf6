//! zerogrid-metrics — request observability for the load balancer.
//!
//! Tracks completed requests per service (served/failed counters, a
//! bounded window of latency samples, and completion timestamps for
//! throughput) and renders everything in Prometheus text format.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector
//!   ├── record_success() / record_failure() ← called per dispatched request
//!   ├── summary() / requests_per_second()  → LoadBalancerStats fields
//!   └── snapshots()                        → per-service ServiceSnapshot
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for the /metrics endpoint
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{LatencySummary, MetricsCollector, ServiceSnapshot};
pub use prometheus::render_prometheus;
