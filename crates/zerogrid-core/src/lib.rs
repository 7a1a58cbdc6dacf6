//! zerogrid-core — shared types for the ZeroGrid control plane.
//!
//! Everything the other crates agree on lives here: service definitions,
//! instance records, scaling events, the request/response objects handed
//! to upstreams, the error taxonomy, and `zerogrid.toml` parsing.

pub mod config;
pub mod duration;
pub mod error;
pub mod request;
pub mod types;

pub use config::{
    AutoscalerConfig, BalancerConfig, CircuitBreakerConfig, ServiceConfig, ZeroGridConfig,
};
pub use error::{ErrorKind, FabricError, FabricResult};
pub use request::{UpstreamRequest, UpstreamResponse};
pub use types::*;
