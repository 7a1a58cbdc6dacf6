//! AutoScaler — owns every service's instances and scaling policy.
//!
//! Decisions are taken synchronously under the service's pool lock;
//! the slow parts (provisioning through the factory, draining) run as
//! independent tokio tasks so one service never waits on another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use zerogrid_core::{
    AutoscalerConfig, FabricError, FabricResult, Instance, InstanceId, InstanceStatus,
    ScalingAction, ScalingEvent, ServiceDefinition, ServiceId,
};

use crate::events::ScalingEventLog;
use crate::factory::InstanceFactory;

/// Instances and cooldown stamps for one service.
struct Pool {
    instances: Vec<Instance>,
    /// Factory `create` calls in flight.
    provisioning: u32,
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
}

impl Pool {
    fn new() -> Self {
        Self {
            instances: Vec::new(),
            provisioning: 0,
            last_scale_up: None,
            last_scale_down: None,
        }
    }

    fn running_count(&self) -> u32 {
        self.instances.iter().filter(|i| i.is_running()).count() as u32
    }

    /// Capacity that exists or is on its way; bounded by `max_instances`.
    fn live_count(&self) -> u32 {
        self.instances.iter().filter(|i| i.is_live()).count() as u32 + self.provisioning
    }

    fn active_connections(&self) -> u32 {
        self.instances
            .iter()
            .filter(|i| i.is_running())
            .map(|i| i.current_connections)
            .sum()
    }

    fn get(&self, id: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Instance> {
        self.instances.iter_mut().find(|i| i.id == id)
    }

    fn reserve(&mut self, now: Instant) {
        self.provisioning += 1;
        self.last_scale_up = Some(now);
    }

    fn release_reservation(&mut self) {
        self.provisioning = self.provisioning.saturating_sub(1);
    }

    /// Mark the most idle running instance with no connections as
    /// draining, unless that would drop below `min`.
    fn begin_drain(&mut self, min: u32) -> Option<InstanceId> {
        if self.live_count() <= min {
            return None;
        }
        let candidate = self
            .instances
            .iter_mut()
            .filter(|i| i.is_running() && i.current_connections == 0)
            .min_by_key(|i| i.last_activity_at)?;
        candidate.status = InstanceStatus::Draining;
        Some(candidate.id.clone())
    }
}

struct ServiceSlot {
    definition: ServiceDefinition,
    pool: Mutex<Pool>,
}

impl ServiceSlot {
    fn pool(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Load figures the scaling loop feeds into `evaluate`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceLoad {
    pub running: u32,
    pub live: u32,
    /// Sum of `current_connections` across running instances.
    pub active_connections: u32,
}

/// Counters across all services.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScalerStats {
    pub services: usize,
    pub total_instances: u32,
    pub running_instances: u32,
    pub draining_instances: u32,
    pub provisioning: u32,
    pub scaling_events_recorded: u64,
}

/// How a dispatched request ended, as seen by its instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Completion {
    Success(Duration),
    Failure,
    /// Never reached the instance (e.g. rejected by its circuit breaker).
    Aborted,
}

/// A connection slot on one instance, taken by `AutoScaler::acquire`.
///
/// Completing the lease decrements the instance's connection count and
/// updates its counters. Dropping it without completing counts as
/// `Completion::Aborted`.
pub struct InstanceLease {
    slot: Arc<ServiceSlot>,
    instance: Instance,
    ema_weight: f64,
    released: bool,
}

impl InstanceLease {
    /// Snapshot of the instance at acquisition time.
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn complete(mut self, outcome: Completion) {
        self.released = true;
        self.settle(outcome);
    }

    fn settle(&self, outcome: Completion) {
        let mut pool = self.slot.pool();
        // Already destroyed after a forced drain.
        let Some(inst) = pool.get_mut(&self.instance.id) else {
            return;
        };
        inst.current_connections = inst.current_connections.saturating_sub(1);
        inst.last_activity_at = Instant::now();

        match outcome {
            Completion::Success(latency) => {
                let sample = latency.as_secs_f64() * 1000.0;
                inst.avg_latency_ms = if inst.total_requests == inst.total_failures {
                    sample
                } else {
                    inst.avg_latency_ms * (1.0 - self.ema_weight) + sample * self.ema_weight
                };
                inst.total_requests += 1;
            }
            Completion::Failure => {
                inst.total_requests += 1;
                inst.total_failures += 1;
            }
            Completion::Aborted => {}
        }
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        if !self.released {
            self.settle(Completion::Aborted);
        }
    }
}

/// Scales every registered service between its min and max.
#[derive(Clone)]
pub struct AutoScaler {
    config: AutoscalerConfig,
    factory: Arc<dyn InstanceFactory>,
    services: Arc<RwLock<HashMap<ServiceId, Arc<ServiceSlot>>>>,
    events: Arc<Mutex<ScalingEventLog>>,
}

impl AutoScaler {
    pub fn new(config: AutoscalerConfig, factory: Arc<dyn InstanceFactory>) -> Self {
        Self {
            config,
            factory,
            services: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(Mutex::new(ScalingEventLog::default())),
        }
    }

    pub fn config(&self) -> &AutoscalerConfig {
        &self.config
    }

    // ── Registry ────────────────────────────────────────────────────

    /// Register a service and bring it up to `min_instances`.
    ///
    /// Failing to reach the minimum is logged, not returned: the scaling
    /// loop keeps retrying through `ensure_minimum`.
    pub async fn register_service(&self, definition: ServiceDefinition) -> FabricResult<()> {
        definition.validate()?;
        let service_id = definition.id.clone();
        {
            let mut services = self.services_mut();
            if services.contains_key(&service_id) {
                return Err(FabricError::AlreadyRegistered(service_id));
            }
            services.insert(
                service_id.clone(),
                Arc::new(ServiceSlot {
                    definition,
                    pool: Mutex::new(Pool::new()),
                }),
            );
        }
        info!(service = %service_id, "service registered with autoscaler");

        if let Err(e) = self.ensure_minimum(&service_id).await {
            warn!(service = %service_id, error = %e, "could not reach min_instances at registration");
        }
        Ok(())
    }

    /// Remove a service, drain every instance, and destroy them.
    ///
    /// Returns the number of instances destroyed.
    pub async fn unregister_service(&self, service_id: &str) -> FabricResult<usize> {
        let slot = self
            .services_mut()
            .remove(service_id)
            .ok_or_else(|| FabricError::ServiceNotFound(service_id.to_string()))?;

        let ids: Vec<InstanceId> = {
            let mut pool = slot.pool();
            for inst in pool.instances.iter_mut().filter(|i| i.is_live()) {
                inst.status = InstanceStatus::Draining;
            }
            pool.instances.iter().map(|i| i.id.clone()).collect()
        };

        let mut drains = JoinSet::new();
        for id in ids {
            let this = self.clone();
            let slot = Arc::clone(&slot);
            drains.spawn(async move { this.retire(slot, id, "service unregistered").await });
        }

        let mut destroyed = 0;
        while let Some(result) = drains.join_next().await {
            if matches!(result, Ok(true)) {
                destroyed += 1;
            }
        }

        info!(service = %service_id, destroyed, "service unregistered from autoscaler");
        Ok(destroyed)
    }

    pub fn service_ids(&self) -> Vec<ServiceId> {
        self.services().keys().cloned().collect()
    }

    pub fn definition(&self, service_id: &str) -> Option<ServiceDefinition> {
        self.slot(service_id).map(|s| s.definition.clone())
    }

    // ── Decisions ───────────────────────────────────────────────────

    /// Decide whether `service_id` needs more or less capacity and start
    /// acting on it.
    ///
    /// Provisioning and draining run as background tasks; the returned
    /// action says what was started.
    pub fn evaluate(
        &self,
        service_id: &str,
        queue_depth: usize,
        active_connections: u32,
    ) -> ScalingAction {
        let Some(slot) = self.slot(service_id) else {
            debug!(service = %service_id, "evaluate on unknown service");
            return ScalingAction::None;
        };
        let now = Instant::now();
        let scaling = &slot.definition.scaling;
        let mut pool = slot.pool();

        if let Some(reason) = self.scale_up_reason(&slot.definition, &pool, queue_depth, active_connections) {
            if !cooled_down(pool.last_scale_up, self.config.scale_up_cooldown, now) {
                debug!(service = %service_id, "scale-up suppressed by cooldown");
                return ScalingAction::None;
            }
            if pool.live_count() >= scaling.max_instances {
                debug!(service = %service_id, max = scaling.max_instances, "scale-up wanted but at max_instances");
                return ScalingAction::None;
            }
            pool.reserve(now);
            drop(pool);

            info!(
                service = %service_id,
                queue_depth,
                active_connections,
                %reason,
                "scaling up"
            );
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.provision(slot, &reason).await {
                    warn!(error = %e, "scale-up failed");
                }
            });
            return ScalingAction::ScaleUp;
        }

        if self.has_idle_surplus(&slot.definition, &pool, now)
            && cooled_down(pool.last_scale_down, self.config.scale_down_cooldown, now)
            && let Some(instance_id) = pool.begin_drain(scaling.min_instances)
        {
            pool.last_scale_down = Some(now);
            drop(pool);

            info!(service = %service_id, instance = %instance_id, "scaling down idle instance");
            let this = self.clone();
            tokio::spawn(async move {
                this.retire(slot, instance_id, "idle").await;
            });
            return ScalingAction::ScaleDown;
        }

        ScalingAction::None
    }

    /// Why `service_id` should grow, if it should.
    fn scale_up_reason(
        &self,
        definition: &ServiceDefinition,
        pool: &Pool,
        queue_depth: usize,
        active_connections: u32,
    ) -> Option<String> {
        let scaling = &definition.scaling;
        let running = pool.running_count();

        if pool.live_count() == 0 && (queue_depth > 0 || active_connections > 0) {
            return Some("cold start".to_string());
        }
        if running < scaling.max_instances
            && queue_depth > 0
            && queue_depth >= scaling.scale_up_threshold
        {
            return Some(format!("queue depth {queue_depth}"));
        }
        let capacity = f64::from(running) * f64::from(scaling.target_concurrency);
        if running > 0
            && f64::from(active_connections) >= self.config.utilization_threshold * capacity
        {
            return Some(format!("{active_connections} connections on {running} instances"));
        }
        None
    }

    /// Whether an instance has been idle long enough to remove.
    fn has_idle_surplus(&self, definition: &ServiceDefinition, pool: &Pool, now: Instant) -> bool {
        let idle_after = definition
            .scaling
            .scale_down_delay
            .unwrap_or(self.config.scale_down_threshold);

        pool.live_count() > definition.scaling.min_instances
            && pool.instances.iter().any(|i| {
                i.is_running() && i.current_connections == 0 && i.idle_for(now) > idle_after
            })
    }

    // ── Actions ─────────────────────────────────────────────────────

    /// Add one instance to `service_id`.
    pub async fn scale_up(&self, service_id: &str) -> FabricResult<Instance> {
        self.scale_up_for(service_id, "scale-up requested").await
    }

    /// Add one instance, recording `reason` in the scaling log.
    ///
    /// Refused with `ServiceUnavailable` when the service is at
    /// `max_instances` (provisioning in flight included).
    pub async fn scale_up_for(&self, service_id: &str, reason: &str) -> FabricResult<Instance> {
        let slot = self.require(service_id)?;
        {
            let mut pool = slot.pool();
            let max = slot.definition.scaling.max_instances;
            if pool.live_count() >= max {
                return Err(FabricError::unavailable(
                    service_id,
                    format!("already at max_instances ({max})"),
                ));
            }
            pool.reserve(Instant::now());
        }
        self.provision_detached(slot, reason).await
    }

    /// Provision the first instance of a service with no live capacity.
    ///
    /// Returns `None` without provisioning when an instance is already
    /// starting, running, or being created, so concurrent first requests
    /// share one cold start.
    pub async fn cold_start(&self, service_id: &str) -> FabricResult<Option<Instance>> {
        let slot = self.require(service_id)?;
        {
            let mut pool = slot.pool();
            if pool.live_count() > 0 {
                return Ok(None);
            }
            pool.reserve(Instant::now());
        }
        info!(service = %service_id, "cold start");
        self.provision_detached(slot, "cold start").await.map(Some)
    }

    /// Remove the most idle instance of `service_id`, waiting for the
    /// drain to finish. Returns `None` when nothing can be removed.
    pub async fn scale_down(&self, service_id: &str) -> FabricResult<Option<InstanceId>> {
        let slot = self.require(service_id)?;
        let candidate = {
            let mut pool = slot.pool();
            let candidate = pool.begin_drain(slot.definition.scaling.min_instances);
            if candidate.is_some() {
                pool.last_scale_down = Some(Instant::now());
            }
            candidate
        };

        let Some(instance_id) = candidate else {
            debug!(service = %service_id, "no idle instance above min_instances");
            return Ok(None);
        };
        self.retire(slot, instance_id.clone(), "scale-down requested").await;
        Ok(Some(instance_id))
    }

    /// Scale up until `min_instances` is met. Returns how many were added.
    pub async fn ensure_minimum(&self, service_id: &str) -> FabricResult<u32> {
        let slot = self.require(service_id)?;
        let min = slot.definition.scaling.min_instances;
        let mut created = 0;

        while slot.pool().live_count() < min {
            self.scale_up_for(service_id, "below min_instances").await?;
            created += 1;
        }
        if created > 0 {
            info!(service = %service_id, created, min, "restored min_instances");
        }
        Ok(created)
    }

    /// Probe every running instance; retire those that failed
    /// `unhealthy_threshold` checks in a row. Returns how many were retired.
    pub async fn check_health(&self, service_id: &str) -> FabricResult<usize> {
        let slot = self.require(service_id)?;
        let threshold = slot.definition.health.unhealthy_threshold.max(1);
        let running: Vec<Instance> = slot
            .pool()
            .instances
            .iter()
            .filter(|i| i.is_running())
            .cloned()
            .collect();

        let mut unhealthy = Vec::new();
        for instance in &running {
            let healthy = self.factory.health_check(instance).await;
            let mut pool = slot.pool();
            let Some(inst) = pool.get_mut(&instance.id) else {
                continue;
            };
            if healthy {
                inst.health_failures = 0;
                continue;
            }
            inst.health_failures += 1;
            debug!(
                service = %service_id,
                instance = %inst.id,
                failures = inst.health_failures,
                threshold,
                "health check failed"
            );
            if inst.health_failures >= threshold && inst.is_running() {
                inst.status = InstanceStatus::Error;
                warn!(service = %service_id, instance = %inst.id, "instance unhealthy, replacing");
                unhealthy.push(inst.id.clone());
            }
        }

        let retired = unhealthy.len();
        for instance_id in unhealthy {
            let this = self.clone();
            let slot = Arc::clone(&slot);
            tokio::spawn(async move {
                this.retire(slot, instance_id, "health check failed").await;
            });
        }
        Ok(retired)
    }

    /// Run `provision` on its own task and wait for it. The reservation is
    /// settled by that task even if the caller's future is dropped.
    async fn provision_detached(
        &self,
        slot: Arc<ServiceSlot>,
        reason: &str,
    ) -> FabricResult<Instance> {
        let service_id = slot.definition.id.clone();
        let this = self.clone();
        let reason = reason.to_string();
        match tokio::spawn(async move { this.provision(slot, &reason).await }).await {
            Ok(result) => result,
            Err(e) => Err(FabricError::Provisioning {
                service: service_id,
                reason: format!("provisioning task failed: {e}"),
            }),
        }
    }

    /// Create an instance for a slot whose reservation is already taken.
    async fn provision(&self, slot: Arc<ServiceSlot>, reason: &str) -> FabricResult<Instance> {
        let service_id = slot.definition.id.clone();
        let mut instance = match self.factory.create(&slot.definition).await {
            Ok(instance) => instance,
            Err(e) => {
                slot.pool().release_reservation();
                warn!(service = %service_id, error = %e, "instance factory failed");
                return Err(FabricError::Provisioning {
                    service: service_id,
                    reason: e.to_string(),
                });
            }
        };
        instance.service_id = service_id.clone();

        if instance.status != InstanceStatus::Running || !self.is_current(&slot) {
            slot.pool().release_reservation();
            let status = instance.status;
            if let Err(e) = self.factory.destroy(&instance).await {
                warn!(service = %service_id, instance = %instance.id, error = %e, "destroy failed");
            }
            if status != InstanceStatus::Running {
                warn!(service = %service_id, instance = %instance.id, %status, "instance did not become healthy");
                return Err(FabricError::Provisioning {
                    service: service_id,
                    reason: format!("instance {} came up {status}", instance.id),
                });
            }
            return Err(FabricError::ServiceNotFound(service_id));
        }

        let now = Instant::now();
        instance.last_activity_at = now;
        let (from, to) = {
            let mut pool = slot.pool();
            pool.release_reservation();
            let from = pool.instances.len() as u32;
            pool.instances.push(instance.clone());
            pool.last_scale_up = Some(now);
            (from, from + 1)
        };

        self.record(ScalingEvent::new(ScalingAction::ScaleUp, &service_id, from, to, reason));
        info!(
            service = %service_id,
            instance = %instance.id,
            endpoint = %instance.endpoint,
            from,
            to,
            %reason,
            "instance added"
        );
        Ok(instance)
    }

    /// Drain protocol: wait for the instance's connections to reach zero
    /// (bounded by the drain timeout), then destroy and remove it.
    async fn retire(&self, slot: Arc<ServiceSlot>, instance_id: InstanceId, reason: &str) -> bool {
        let service_id = slot.definition.id.clone();
        let poll = self.config.drain_poll_interval.max(Duration::from_millis(1));
        let max_attempts = drain_attempts(self.config.connection_drain_timeout, poll);
        let mut attempts = 0;

        loop {
            let connections = slot.pool().get(&instance_id).map(|i| i.current_connections);
            let Some(connections) = connections else {
                debug!(service = %service_id, instance = %instance_id, "instance already removed");
                return false;
            };
            if connections == 0 {
                break;
            }
            if attempts >= max_attempts {
                warn!(
                    service = %service_id,
                    instance = %instance_id,
                    connections,
                    "drain timeout exceeded, forcing shutdown"
                );
                break;
            }
            attempts += 1;
            debug!(service = %service_id, instance = %instance_id, connections, attempts, "draining");
            tokio::time::sleep(poll).await;
        }

        let instance = {
            let mut pool = slot.pool();
            match pool.get_mut(&instance_id) {
                Some(inst) => {
                    inst.status = InstanceStatus::Stopped;
                    inst.clone()
                }
                None => return false,
            }
        };

        if let Err(e) = self.factory.destroy(&instance).await {
            warn!(service = %service_id, instance = %instance_id, error = %e, "destroy failed");
        }

        let (from, to) = {
            let mut pool = slot.pool();
            let from = pool.instances.len() as u32;
            pool.instances.retain(|i| i.id != instance_id);
            (from, pool.instances.len() as u32)
        };
        self.record(ScalingEvent::new(ScalingAction::ScaleDown, &service_id, from, to, reason));
        info!(service = %service_id, instance = %instance_id, from, to, %reason, "instance removed");
        true
    }

    // ── Dispatch support ────────────────────────────────────────────

    /// Take a connection slot on the least-loaded running instance with
    /// spare capacity (`current_connections < target_concurrency`) for
    /// which `admit` holds.
    pub fn acquire(
        &self,
        service_id: &str,
        mut admit: impl FnMut(&Instance) -> bool,
    ) -> Option<InstanceLease> {
        let slot = self.slot(service_id)?;
        let target = slot.definition.scaling.target_concurrency;
        let instance = {
            let mut pool = slot.pool();
            let inst = pool
                .instances
                .iter_mut()
                .filter(|i| i.is_running() && i.current_connections < target && admit(i))
                .min_by_key(|i| i.current_connections)?;
            inst.current_connections += 1;
            inst.last_activity_at = Instant::now();
            inst.clone()
        };

        Some(InstanceLease {
            slot,
            instance,
            ema_weight: self.config.latency_ema_weight,
            released: false,
        })
    }

    /// Return a lease taken by `acquire`, recording how the request ended.
    pub fn release(&self, lease: InstanceLease, outcome: Completion) {
        lease.complete(outcome);
    }

    /// No instance is running, starting, or being provisioned.
    pub fn needs_cold_start(&self, service_id: &str) -> FabricResult<bool> {
        Ok(self.require(service_id)?.pool().live_count() == 0)
    }

    pub fn load(&self, service_id: &str) -> Option<ServiceLoad> {
        let slot = self.slot(service_id)?;
        let pool = slot.pool();
        Some(ServiceLoad {
            running: pool.running_count(),
            live: pool.live_count(),
            active_connections: pool.active_connections(),
        })
    }

    // ── Observability ───────────────────────────────────────────────

    pub fn get_instances(&self, service_id: &str) -> Vec<Instance> {
        self.slot(service_id)
            .map(|s| s.pool().instances.clone())
            .unwrap_or_default()
    }

    pub fn get_running_instances(&self, service_id: &str) -> Vec<Instance> {
        self.slot(service_id)
            .map(|s| {
                s.pool()
                    .instances
                    .iter()
                    .filter(|i| i.is_running())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The most recent `limit` scaling events (all retained when `None`).
    pub fn get_scaling_events(&self, limit: Option<usize>) -> Vec<ScalingEvent> {
        self.events().recent(limit)
    }

    pub fn get_stats(&self) -> ScalerStats {
        let mut stats = ScalerStats::default();
        {
            let services = self.services();
            stats.services = services.len();
            for slot in services.values() {
                let pool = slot.pool();
                stats.total_instances += pool.instances.len() as u32;
                stats.running_instances += pool.running_count();
                stats.draining_instances += pool
                    .instances
                    .iter()
                    .filter(|i| i.status == InstanceStatus::Draining)
                    .count() as u32;
                stats.provisioning += pool.provisioning;
            }
        }
        stats.scaling_events_recorded = self.events().total_recorded();
        stats
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn record(&self, event: ScalingEvent) {
        self.events().push(event);
    }

    fn slot(&self, service_id: &str) -> Option<Arc<ServiceSlot>> {
        self.services().get(service_id).cloned()
    }

    fn require(&self, service_id: &str) -> FabricResult<Arc<ServiceSlot>> {
        self.slot(service_id)
            .ok_or_else(|| FabricError::ServiceNotFound(service_id.to_string()))
    }

    /// The slot is still the registered one (not unregistered meanwhile).
    fn is_current(&self, slot: &Arc<ServiceSlot>) -> bool {
        self.services()
            .get(&slot.definition.id)
            .is_some_and(|s| Arc::ptr_eq(s, slot))
    }

    fn services(&self) -> RwLockReadGuard<'_, HashMap<ServiceId, Arc<ServiceSlot>>> {
        self.services.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn services_mut(&self) -> RwLockWriteGuard<'_, HashMap<ServiceId, Arc<ServiceSlot>>> {
        self.services.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn events(&self) -> MutexGuard<'_, ScalingEventLog> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn cooled_down(last: Option<Instant>, cooldown: Duration, now: Instant) -> bool {
    last.is_none_or(|at| now.saturating_duration_since(at) >= cooldown)
}

/// Poll attempts that cover `timeout` at `poll` spacing (rounded up).
fn drain_attempts(timeout: Duration, poll: Duration) -> u32 {
    let poll_ms = poll.as_millis().max(1);
    timeout.as_millis().div_ceil(poll_ms) as u32
}
