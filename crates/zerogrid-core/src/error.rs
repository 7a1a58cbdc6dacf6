//! Error taxonomy for the control plane.

use thiserror::Error;

/// Result alias used throughout the control plane.
pub type FabricResult<T> = Result<T, FabricError>;

/// Errors surfaced by `route` and the registry operations.
///
/// `CircuitBroken` is recovered inside the dispatcher; every other kind
/// reaches the original caller.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FabricError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("service already registered: {0}")]
    AlreadyRegistered(String),

    #[error("invalid service definition: {0}")]
    InvalidDefinition(String),

    #[error("service {service} overloaded: queue holds {max_queue_size} requests")]
    CapacityExceeded {
        service: String,
        max_queue_size: usize,
    },

    #[error("service {service} unavailable: {reason}")]
    ServiceUnavailable { service: String, reason: String },

    #[error("request {request_id} timed out after {waited_ms}ms")]
    RequestTimeout { request_id: String, waited_ms: u64 },

    #[error("circuit broken: {0}")]
    CircuitBroken(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("provisioning failed for {service}: {reason}")]
    Provisioning { service: String, reason: String },
}

/// Coarse classification used by the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Invalid,
    CapacityExceeded,
    ServiceUnavailable,
    RequestTimeout,
    CircuitBroken,
    UpstreamError,
}

impl FabricError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FabricError::ServiceNotFound(_) => ErrorKind::NotFound,
            FabricError::AlreadyRegistered(_) => ErrorKind::Conflict,
            FabricError::InvalidDefinition(_) => ErrorKind::Invalid,
            FabricError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            FabricError::ServiceUnavailable { .. } | FabricError::Provisioning { .. } => {
                ErrorKind::ServiceUnavailable
            }
            FabricError::RequestTimeout { .. } => ErrorKind::RequestTimeout,
            FabricError::CircuitBroken(_) => ErrorKind::CircuitBroken,
            FabricError::Upstream(_) => ErrorKind::UpstreamError,
        }
    }

    /// Only a broken circuit is retried internally against another instance.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FabricError::CircuitBroken(_))
    }

    pub fn unavailable(service: &str, reason: impl Into<String>) -> Self {
        FabricError::ServiceUnavailable {
            service: service.to_string(),
            reason: reason.into(),
        }
    }
}
