//! zerogrid-health — HTTP health probes and the endpoint-pool factory.
//!
//! # Architecture
//!
//! ```text
//! EndpointPoolFactory (InstanceFactory)
//!   ├── free endpoints per service, leased to instances
//!   ├── create  → lease, wait_until_healthy() → Running | Error
//!   ├── destroy → endpoint back to the free list
//!   └── health_check → http_probe() once
//! ```
//!
//! A probe is healthy only on a 2xx answer; connection errors and
//! timeouts are reported as `Failed`.

pub mod checker;
pub mod pool;

pub use checker::{ProbeResult, http_probe, wait_until_healthy};
pub use pool::EndpointPoolFactory;
