//! `InstanceFactory` over pre-provisioned endpoints.
//!
//! Each service owns a list of `host:port` endpoints from `zerogrid.toml`.
//! Creating an instance leases a free endpoint and waits for its health
//! probe; destroying it hands the endpoint back.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use zerogrid_autoscale::InstanceFactory;
use zerogrid_core::{Instance, InstanceId, InstanceStatus, ServiceDefinition, ServiceId, ZeroGridConfig};

use crate::checker::{DEFAULT_PROBE_TIMEOUT, http_probe, wait_until_healthy};

#[derive(Debug)]
struct Lease {
    service_id: ServiceId,
    endpoint: String,
    health_path: String,
}

#[derive(Debug, Default)]
struct Pools {
    free: HashMap<ServiceId, VecDeque<String>>,
    leased: HashMap<InstanceId, Lease>,
}

/// Leases endpoints to the autoscaler as instances.
#[derive(Debug)]
pub struct EndpointPoolFactory {
    pools: Mutex<Pools>,
    probe_timeout: Duration,
    next_id: AtomicU64,
}

impl Default for EndpointPoolFactory {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl EndpointPoolFactory {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            pools: Mutex::new(Pools::default()),
            probe_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    /// Build a factory holding every service's configured endpoints.
    pub fn from_config(config: &ZeroGridConfig) -> Self {
        let factory = Self::default();
        for svc in &config.services {
            factory.add_endpoints(&svc.definition.id, svc.endpoints.iter().cloned());
        }
        factory
    }

    /// Add endpoints to a service's free list.
    pub fn add_endpoints(&self, service_id: &str, endpoints: impl IntoIterator<Item = String>) {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        let free = pools.free.entry(service_id.to_string()).or_default();
        for endpoint in endpoints {
            if !free.contains(&endpoint) {
                free.push_back(endpoint);
            }
        }
    }

    /// Endpoints not currently leased to an instance.
    pub fn available(&self, service_id: &str) -> usize {
        let pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        pools.free.get(service_id).map_or(0, VecDeque::len)
    }

    /// Instances currently holding an endpoint.
    pub fn leased(&self) -> usize {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner).leased.len()
    }

    fn lease(&self, service: &ServiceDefinition) -> anyhow::Result<(InstanceId, String)> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(endpoint) = pools.free.get_mut(&service.id).and_then(VecDeque::pop_front) else {
            bail!("no free endpoint for service {}", service.id);
        };

        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let instance_id = format!("{}-{n}", service.id);
        pools.leased.insert(
            instance_id.clone(),
            Lease {
                service_id: service.id.clone(),
                endpoint: endpoint.clone(),
                health_path: service.health.path.clone(),
            },
        );
        Ok((instance_id, endpoint))
    }
}

#[async_trait]
impl InstanceFactory for EndpointPoolFactory {
    async fn create(&self, service: &ServiceDefinition) -> anyhow::Result<Instance> {
        let (instance_id, endpoint) = self.lease(service)?;
        debug!(service = %service.id, instance = %instance_id, %endpoint, "endpoint leased");

        let mut instance = Instance::new(instance_id, &service.id, endpoint);
        if wait_until_healthy(&instance.endpoint, &service.health).await {
            instance.status = InstanceStatus::Running;
            info!(service = %service.id, instance = %instance.id, endpoint = %instance.endpoint, "instance healthy");
        } else {
            instance.status = InstanceStatus::Error;
            warn!(
                service = %service.id,
                instance = %instance.id,
                timeout_ms = service.health.timeout.as_millis() as u64,
                "instance did not become healthy"
            );
        }
        Ok(instance)
    }

    async fn destroy(&self, instance: &Instance) -> anyhow::Result<()> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(lease) = pools.leased.remove(&instance.id) else {
            warn!(instance = %instance.id, "destroy for unknown instance");
            return Ok(());
        };
        debug!(service = %lease.service_id, instance = %instance.id, endpoint = %lease.endpoint, "endpoint returned");
        pools.free.entry(lease.service_id).or_default().push_back(lease.endpoint);
        Ok(())
    }

    async fn health_check(&self, instance: &Instance) -> bool {
        let path = {
            let pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
            match pools.leased.get(&instance.id) {
                Some(lease) => lease.health_path.clone(),
                None => return false,
            }
        };
        http_probe(&instance.endpoint, &path, self.probe_timeout)
            .await
            .is_healthy()
    }
}
