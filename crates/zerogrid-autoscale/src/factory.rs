//! The external collaborator that provisions compute.

use async_trait::async_trait;

use zerogrid_core::{Instance, ServiceDefinition};

/// Creates, destroys, and health-checks instances for a service.
///
/// Implementations own the actual compute (containers, VMs, leased
/// endpoints); the autoscaler only sees the resulting `Instance` records.
#[async_trait]
pub trait InstanceFactory: Send + Sync {
    /// Provision an instance and wait for it to pass its health check.
    ///
    /// Returns an instance in `Running` state, or in `Error` state when
    /// the health check timed out. Hard failures are returned as `Err`.
    async fn create(&self, service: &ServiceDefinition) -> anyhow::Result<Instance>;

    /// Tear down an instance. Called once its connections have drained.
    async fn destroy(&self, instance: &Instance) -> anyhow::Result<()>;

    /// One-shot liveness check of a running instance.
    async fn health_check(&self, instance: &Instance) -> bool;
}
