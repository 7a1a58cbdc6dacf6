//! LoadBalancer — the request queue and dispatcher.
//!
//! `route` parks each request in its service's FIFO and waits on a
//! oneshot. Two background loops drive everything else:
//!
//! - the queue loop pairs queued requests with instances that have spare
//!   capacity and a circuit that admits calls, dispatching each as its
//!   own task;
//! - the scaling loop feeds queue depth and connection counts to the
//!   autoscaler, runs the periodic health sweep, restores
//!   `min_instances`, and forgets breakers of instances that are gone.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use zerogrid_autoscale::{AutoScaler, Completion, InstanceFactory, InstanceLease};
use zerogrid_breaker::CircuitBreaker;
use zerogrid_core::{
    BalancerConfig, CircuitState, CircuitStats, FabricError, FabricResult, Instance,
    LoadBalancerStats, ScalingAction, ScalingEvent, ServiceDefinition, ServiceId, UpstreamRequest,
    UpstreamResponse, ZeroGridConfig,
};
use zerogrid_metrics::{MetricsCollector, ServiceSnapshot, render_prometheus};

use crate::queue::{QueuedRequest, ServiceQueue};
use crate::upstream::Upstream;

type SharedQueue = Arc<Mutex<ServiceQueue>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State reachable from the loops and dispatch tasks.
struct Shared {
    config: BalancerConfig,
    scaler: AutoScaler,
    breaker: CircuitBreaker,
    upstream: Arc<dyn Upstream>,
    metrics: MetricsCollector,
    queues: RwLock<HashMap<ServiceId, SharedQueue>>,
    scaling_ticks: AtomicU64,
}

/// Front door of the fabric: owns the queues, the breaker, and the
/// autoscaler. Share it through `Arc`.
pub struct LoadBalancer {
    shared: Arc<Shared>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl LoadBalancer {
    pub fn new(
        config: BalancerConfig,
        scaler: AutoScaler,
        breaker: CircuitBreaker,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                scaler,
                breaker,
                upstream,
                metrics: MetricsCollector::default(),
                queues: RwLock::new(HashMap::new()),
                scaling_ticks: AtomicU64::new(0),
            }),
            shutdown: Mutex::new(None),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Build the balancer and its collaborators from `zerogrid.toml`.
    /// Services listed in the file are not registered here.
    pub fn from_config(
        config: &ZeroGridConfig,
        factory: Arc<dyn InstanceFactory>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        Self::new(
            config.balancer.clone(),
            AutoScaler::new(config.autoscaler.clone(), factory),
            CircuitBreaker::new(config.circuit_breaker.clone()),
            upstream,
        )
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.shared.config
    }

    pub fn scaler(&self) -> &AutoScaler {
        &self.shared.scaler
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.shared.breaker
    }

    // ── Registry ────────────────────────────────────────────────────

    /// Register a service: create its queue and bring it to `min_instances`.
    pub async fn register_service(&self, definition: ServiceDefinition) -> FabricResult<()> {
        definition.validate()?;
        let service_id = definition.id.clone();
        {
            let mut queues = self.shared.queues_mut();
            if queues.contains_key(&service_id) {
                return Err(FabricError::AlreadyRegistered(service_id));
            }
            queues.insert(
                service_id.clone(),
                Arc::new(Mutex::new(ServiceQueue::new(self.shared.config.max_queue_size))),
            );
        }

        if let Err(e) = self.shared.scaler.register_service(definition).await {
            self.shared.queues_mut().remove(&service_id);
            return Err(e);
        }
        self.shared.metrics.register(&service_id);
        info!(service = %service_id, "service registered");
        Ok(())
    }

    /// Unregister a service. Every queued request is rejected with
    /// `ServiceUnavailable` and every instance drained and destroyed.
    ///
    /// Returns the number of queued requests rejected.
    pub async fn unregister_service(&self, service_id: &str) -> FabricResult<usize> {
        let queue = self
            .shared
            .queues_mut()
            .remove(service_id)
            .ok_or_else(|| FabricError::ServiceNotFound(service_id.to_string()))?;

        let pending = lock(&queue).drain();
        let rejected = pending.len();
        for request in pending {
            request.respond(Err(FabricError::unavailable(service_id, "service unregistered")));
        }

        let destroyed = match self.shared.scaler.unregister_service(service_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(service = %service_id, error = %e, "autoscaler had no record of service");
                0
            }
        };

        let prefix = format!("{service_id}:");
        self.shared.breaker.retain(|key| !key.starts_with(&prefix));
        self.shared.metrics.unregister(service_id);

        info!(service = %service_id, rejected, destroyed, "service unregistered");
        Ok(rejected)
    }

    /// Registered service definitions, ordered by id.
    pub fn services(&self) -> Vec<ServiceDefinition> {
        let mut ids = self.shared.service_ids();
        ids.sort();
        ids.iter()
            .filter_map(|id| self.shared.scaler.definition(id))
            .collect()
    }

    // ── Routing ─────────────────────────────────────────────────────

    /// Send `request` to `service_id` and wait for the outcome.
    ///
    /// A service with no live capacity is cold-started before the request
    /// is queued; a failed cold start is reported as `ServiceUnavailable`.
    pub async fn route(
        &self,
        service_id: &str,
        request: UpstreamRequest,
    ) -> FabricResult<UpstreamResponse> {
        let shared = &self.shared;
        let queue = shared
            .queue(service_id)
            .ok_or_else(|| FabricError::ServiceNotFound(service_id.to_string()))?;
        if lock(&queue).is_full() {
            return Err(shared.overloaded(service_id));
        }

        match shared.scaler.cold_start(service_id).await {
            Ok(Some(instance)) => {
                debug!(service = %service_id, instance = %instance.id, "cold start complete");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(service = %service_id, error = %e, "cold start failed");
                shared.metrics.record_failure(service_id);
                return Err(FabricError::unavailable(service_id, format!("cold start failed: {e}")));
            }
        }

        let (queued, rx) = QueuedRequest::new(service_id, request, shared.config.request_timeout);
        let request_id = queued.id.clone();
        let deadline = queued.deadline;

        let pushed = lock(&queue).push_back(queued);
        if pushed.is_err() {
            return Err(shared.overloaded(service_id));
        }
        debug!(service = %service_id, request = %request_id, "request queued");

        shared.process_queue(service_id, &queue);

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FabricError::unavailable(
                service_id,
                "request dropped before completion",
            )),
            Err(_) => Err(FabricError::RequestTimeout {
                request_id,
                waited_ms: shared.config.request_timeout.as_millis() as u64,
            }),
        }
    }

    // ── Control loops ───────────────────────────────────────────────

    /// Spawn the scaling and queue loops. A second call is a no-op.
    pub fn start(&self) {
        let mut shutdown = lock(&self.shutdown);
        if shutdown.is_some() {
            warn!("load balancer already started");
            return;
        }
        let (tx, rx) = watch::channel(false);
        let config = &self.shared.config;

        let handles = vec![
            tokio::spawn(run_loop(
                Arc::clone(&self.shared),
                "scaling",
                config.scaling_interval,
                Shared::scaling_tick,
                rx.clone(),
            )),
            tokio::spawn(run_loop(
                Arc::clone(&self.shared),
                "queue",
                config.queue_interval,
                Shared::process_queues,
                rx,
            )),
        ];
        *shutdown = Some(tx);
        lock(&self.loops).extend(handles);
        info!(
            scaling_interval_ms = config.scaling_interval.as_millis() as u64,
            queue_interval_ms = config.queue_interval.as_millis() as u64,
            "load balancer started"
        );
    }

    /// Signal both loops and wait for them to exit.
    pub async fn stop(&self) {
        let tx = lock(&self.shutdown).take();
        let Some(tx) = tx else {
            return;
        };
        let _ = tx.send(true);

        let handles: Vec<JoinHandle<()>> = lock(&self.loops).drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "control loop task failed");
            }
        }
        info!("load balancer stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shutdown).is_some()
    }

    /// One pass of the queue loop over every service.
    pub fn process_queues(&self) {
        self.shared.process_queues();
    }

    /// One pass of the scaling loop over every service.
    pub fn scaling_tick(&self) {
        self.shared.scaling_tick();
    }

    // ── Observability ───────────────────────────────────────────────

    pub fn get_stats(&self) -> LoadBalancerStats {
        let scaler = self.shared.scaler.get_stats();
        let latency = self.shared.metrics.summary();
        let queued_requests = self
            .shared
            .queue_entries()
            .iter()
            .map(|(_, q)| lock(q).len())
            .sum();

        LoadBalancerStats {
            active_instances: scaler.running_instances,
            total_instances: scaler.total_instances,
            queued_requests,
            total_requests_served: self.shared.metrics.total_served(),
            avg_latency_ms: latency.avg_ms,
            p95_latency_ms: latency.p95_ms,
            p99_latency_ms: latency.p99_ms,
            requests_per_second: self.shared.metrics.requests_per_second(),
            scaling_events: self.shared.scaler.get_scaling_events(None),
        }
    }

    pub fn get_circuit_stats(&self) -> BTreeMap<String, CircuitStats> {
        self.shared.breaker.get_stats()
    }

    pub fn get_instances(&self, service_id: &str) -> FabricResult<Vec<Instance>> {
        if self.shared.queue(service_id).is_none() {
            return Err(FabricError::ServiceNotFound(service_id.to_string()));
        }
        Ok(self.shared.scaler.get_instances(service_id))
    }

    pub fn get_scaling_events(&self, limit: Option<usize>) -> Vec<ScalingEvent> {
        self.shared.scaler.get_scaling_events(limit)
    }

    pub fn queue_depth(&self, service_id: &str) -> Option<usize> {
        self.shared.queue(service_id).map(|q| lock(&q).len())
    }

    /// Per-service request figures with queue depth and running count.
    pub fn service_snapshots(&self) -> Vec<ServiceSnapshot> {
        let mut snapshots = self.shared.metrics.snapshots();
        for snapshot in &mut snapshots {
            snapshot.queued_requests = self.queue_depth(&snapshot.service_id).unwrap_or(0);
            snapshot.running_instances = self
                .shared
                .scaler
                .load(&snapshot.service_id)
                .map_or(0, |l| l.running);
        }
        snapshots
    }

    /// Prometheus text exposition of everything above.
    pub fn render_metrics(&self) -> String {
        render_prometheus(
            &self.get_stats(),
            &self.service_snapshots(),
            &self.get_circuit_stats(),
        )
    }
}

impl Shared {
    fn queue(&self, service_id: &str) -> Option<SharedQueue> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service_id)
            .cloned()
    }

    fn queues_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ServiceId, SharedQueue>> {
        self.queues.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue_entries(&self) -> Vec<(ServiceId, SharedQueue)> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, q)| (id.clone(), Arc::clone(q)))
            .collect()
    }

    fn service_ids(&self) -> Vec<ServiceId> {
        self.queue_entries().into_iter().map(|(id, _)| id).collect()
    }

    fn overloaded(&self, service_id: &str) -> FabricError {
        warn!(service = %service_id, max = self.config.max_queue_size, "queue full, rejecting request");
        self.metrics.record_failure(service_id);
        FabricError::CapacityExceeded {
            service: service_id.to_string(),
            max_queue_size: self.config.max_queue_size,
        }
    }

    fn process_queues(self: &Arc<Self>) {
        for (service_id, queue) in self.queue_entries() {
            self.process_queue(&service_id, &queue);
        }
    }

    /// Expire stale requests, then pair queued requests with instances
    /// until either runs out.
    fn process_queue(self: &Arc<Self>, service_id: &str, queue: &SharedQueue) {
        let now = Instant::now();
        let expired = lock(queue).take_expired(now);
        for request in expired {
            self.reject_expired(request, now);
        }

        loop {
            if lock(queue).is_empty() {
                return;
            }
            let Some(lease) = self
                .scaler
                .acquire(service_id, |inst| self.breaker.can_execute(&inst.circuit_key()))
            else {
                self.reject_if_circuits_open(service_id, queue);
                return;
            };

            let popped = lock(queue).pop_front();
            let Some(request) = popped else {
                lease.complete(Completion::Aborted);
                return;
            };
            if request.is_expired(now) {
                lease.complete(Completion::Aborted);
                self.reject_expired(request, now);
                continue;
            }

            let this = Arc::clone(self);
            tokio::spawn(async move { this.dispatch(lease, request).await });
        }
    }

    /// Reject everything waiting when every running instance's circuit is
    /// open and no new capacity is starting. Busy instances, and half-open
    /// circuits with probes in flight, keep the queue intact.
    fn reject_if_circuits_open(&self, service_id: &str, queue: &SharedQueue) {
        let Some(load) = self.scaler.load(service_id) else {
            return;
        };
        if load.running == 0 || load.live > load.running {
            return;
        }
        let running = self.scaler.get_running_instances(service_id);
        let all_open = running.iter().all(|inst| {
            let key = inst.circuit_key();
            self.breaker.get_state(&key) == CircuitState::Open && !self.breaker.can_execute(&key)
        });
        if !all_open {
            return;
        }

        let pending = lock(queue).drain();
        if pending.is_empty() {
            return;
        }
        warn!(
            service = %service_id,
            rejected = pending.len(),
            "all instance circuits open, rejecting queued requests"
        );
        for request in pending {
            self.metrics.record_failure(service_id);
            request.respond(Err(FabricError::unavailable(
                service_id,
                "all instances have open circuits",
            )));
        }
    }

    fn reject_expired(&self, request: QueuedRequest, now: Instant) {
        let err = request.timeout_error(now);
        warn!(service = %request.service_id, request = %request.id, error = %err, "request expired in queue");
        self.metrics.record_failure(&request.service_id);
        request.respond(Err(err));
    }

    /// Forward through the instance's circuit, then settle the outcome.
    async fn dispatch(self: Arc<Self>, lease: InstanceLease, mut request: QueuedRequest) {
        request.attempts += 1;
        let instance = lease.instance().clone();
        let key = instance.circuit_key();
        debug!(
            service = %request.service_id,
            request = %request.id,
            instance = %instance.id,
            attempt = request.attempts,
            "dispatching"
        );

        let started = Instant::now();
        let result = self
            .breaker
            .execute(&key, || self.forward(&instance, &request))
            .await;
        self.settle(lease, request, result, started.elapsed());
    }

    /// Upstream call bounded by the request's remaining deadline.
    async fn forward(
        &self,
        instance: &Instance,
        request: &QueuedRequest,
    ) -> FabricResult<UpstreamResponse> {
        let call = self.upstream.forward(instance, &request.request);
        match tokio::time::timeout_at(request.deadline, call).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(FabricError::Upstream(format!("{}: {e:#}", instance.id))),
            Err(_) => Err(request.timeout_error(Instant::now())),
        }
    }

    fn settle(
        self: &Arc<Self>,
        lease: InstanceLease,
        request: QueuedRequest,
        result: FabricResult<UpstreamResponse>,
        latency: Duration,
    ) {
        match result {
            Ok(response) => {
                lease.complete(Completion::Success(latency));
                self.metrics.record_success(&request.service_id, latency);
                debug!(
                    service = %request.service_id,
                    request = %request.id,
                    status = %response.status,
                    latency_ms = latency.as_millis() as u64,
                    "request served"
                );
                request.respond(Ok(response));
            }
            Err(FabricError::CircuitBroken(key)) => {
                lease.complete(Completion::Aborted);
                self.requeue_or_reject(request, &key);
            }
            Err(err) => {
                lease.complete(Completion::Failure);
                self.metrics.record_failure(&request.service_id);
                warn!(
                    service = %request.service_id,
                    request = %request.id,
                    error = %err,
                    "request failed"
                );
                request.respond(Err(err));
            }
        }
    }

    /// A circuit rejected the call after selection: retry at the head of
    /// the queue if another running instance still admits calls.
    fn requeue_or_reject(self: &Arc<Self>, request: QueuedRequest, broken_key: &str) {
        let service_id = request.service_id.clone();
        let alternative = self
            .scaler
            .get_running_instances(&service_id)
            .iter()
            .map(Instance::circuit_key)
            .any(|key| key != broken_key && self.breaker.can_execute(&key));

        match self.queue(&service_id) {
            Some(queue) if alternative => {
                debug!(service = %service_id, request = %request.id, circuit = %broken_key, "circuit open, requeueing at front");
                lock(&queue).push_front(request);
                self.process_queue(&service_id, &queue);
            }
            _ => {
                warn!(service = %service_id, request = %request.id, "no instance with a closed circuit");
                self.metrics.record_failure(&service_id);
                request.respond(Err(FabricError::unavailable(
                    &service_id,
                    "all instances have open circuits",
                )));
            }
        }
    }

    fn scaling_tick(self: &Arc<Self>) {
        let tick = self.scaling_ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let every = u64::from(self.config.health_check_every);
        let run_health = every > 0 && tick % every == 0;
        let mut live_keys = HashSet::new();

        for (service_id, queue) in self.queue_entries() {
            let queue_depth = lock(&queue).len();
            let load = self.scaler.load(&service_id).unwrap_or_default();
            let action = self
                .scaler
                .evaluate(&service_id, queue_depth, load.active_connections);
            if action != ScalingAction::None {
                debug!(
                    service = %service_id,
                    ?action,
                    queue_depth,
                    active_connections = load.active_connections,
                    running = load.running,
                    "scaling decision"
                );
            }

            let scaler = self.scaler.clone();
            let id = service_id.clone();
            tokio::spawn(async move {
                if run_health && let Err(e) = scaler.check_health(&id).await {
                    debug!(service = %id, error = %e, "health sweep skipped");
                }
                if let Err(e) = scaler.ensure_minimum(&id).await {
                    warn!(service = %id, error = %e, "could not restore min_instances");
                }
            });

            live_keys.extend(
                self.scaler
                    .get_instances(&service_id)
                    .iter()
                    .map(Instance::circuit_key),
            );
        }

        self.breaker.retain(|key| live_keys.contains(key));
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    name: &'static str,
    interval: Duration,
    tick: fn(&Arc<Shared>),
    mut shutdown: watch::Receiver<bool>,
) {
    info!(task = name, interval_ms = interval.as_millis() as u64, "control loop started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => tick(&shared),
            _ = shutdown.changed() => {
                info!(task = name, "control loop shutting down");
                break;
            }
        }
    }
}
