//! zerogrid-balancer — request queueing and dispatch.
//!
//! Ties the autoscaler and circuit breaker together behind `route`.
//!
//! # Architecture
//!
//! ```text
//! LoadBalancer
//!   ├── per-service ServiceQueue (bounded FIFO, requeue at front)
//!   ├── AutoScaler      (instances, least-connections leases)
//!   ├── CircuitBreaker  (one circuit per "service:instance")
//!   ├── Upstream        (forwards the request object)
//!   └── loops
//!       ├── queue   (100ms) expire, select, dispatch
//!       └── scaling (5s)    evaluate, health sweep, min_instances, prune
//! ```

pub mod balancer;
pub mod queue;
pub mod upstream;

pub use balancer::LoadBalancer;
pub use queue::{QueuedRequest, ServiceQueue};
pub use upstream::{HttpUpstream, Upstream};
