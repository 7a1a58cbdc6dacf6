//! End-to-end behaviour of the queue, dispatcher, and scaling loop
//! against in-memory factory and upstream implementations.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use tokio::sync::Semaphore;

use zerogrid_autoscale::{AutoScaler, InstanceFactory};
use zerogrid_balancer::{LoadBalancer, Upstream};
use zerogrid_breaker::CircuitBreaker;
use zerogrid_core::{
    AutoscalerConfig, BalancerConfig, CircuitBreakerConfig, CircuitState, FabricError, Instance,
    InstanceStatus, ScalingAction, ServiceDefinition, UpstreamRequest, UpstreamResponse,
};

#[derive(Default)]
struct Factory {
    created: AtomicU32,
    destroyed: AtomicU32,
    unhealthy: AtomicBool,
    create_delay: Duration,
}

impl Factory {
    fn slow(create_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            create_delay,
            ..Default::default()
        })
    }

    fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    fn destroyed(&self) -> u32 {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceFactory for Factory {
    async fn create(&self, service: &ServiceDefinition) -> anyhow::Result<Instance> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let mut inst = Instance::new(
            format!("{}-{n}", service.id),
            &service.id,
            format!("10.0.0.{n}:8080"),
        );
        inst.status = InstanceStatus::Running;
        Ok(inst)
    }

    async fn destroy(&self, _instance: &Instance) -> anyhow::Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self, _instance: &Instance) -> bool {
        !self.unhealthy.load(Ordering::SeqCst)
    }
}

/// Upstream that records request paths and can be delayed, gated, or
/// made to fail.
#[derive(Default)]
struct Backend {
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    failing: AtomicBool,
    seen: Mutex<Vec<String>>,
}

impl Backend {
    fn immediate() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn delayed(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    /// Every request blocks until `release` hands out a permit.
    fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Default::default()
        })
    }

    fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Upstream for Backend {
    async fn forward(
        &self,
        instance: &Instance,
        request: &UpstreamRequest,
    ) -> anyhow::Result<UpstreamResponse> {
        self.seen
            .lock()
            .unwrap()
            .push(request.path_and_query.clone());
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("connection reset by {}", instance.endpoint);
        }
        Ok(UpstreamResponse::ok(instance.id.clone()))
    }
}

fn service(id: &str, min: u32, max: u32, target: u32) -> ServiceDefinition {
    let mut def = ServiceDefinition::new(id, id, "http");
    def.scaling.min_instances = min;
    def.scaling.max_instances = max;
    def.scaling.target_concurrency = target;
    def
}

fn balancer_with(
    config: BalancerConfig,
    breaker: CircuitBreakerConfig,
    factory: Arc<Factory>,
    backend: Arc<Backend>,
) -> Arc<LoadBalancer> {
    Arc::new(LoadBalancer::new(
        config,
        AutoScaler::new(AutoscalerConfig::default(), factory),
        CircuitBreaker::new(breaker),
        backend,
    ))
}

fn balancer(factory: Arc<Factory>, backend: Arc<Backend>) -> Arc<LoadBalancer> {
    balancer_with(
        BalancerConfig::default(),
        CircuitBreakerConfig::default(),
        factory,
        backend,
    )
}

fn spawn_route(
    lb: &Arc<LoadBalancer>,
    service_id: &'static str,
    path: &'static str,
) -> tokio::task::JoinHandle<Result<UpstreamResponse, FabricError>> {
    let lb = Arc::clone(lb);
    tokio::spawn(async move { lb.route(service_id, UpstreamRequest::get(path)).await })
}

async fn pause(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn first_request_cold_starts_exactly_one_instance() {
    let factory = Arc::new(Factory::default());
    let lb = balancer(factory.clone(), Backend::immediate());
    lb.register_service(service("svc", 0, 1, 10)).await.unwrap();
    assert!(lb.get_instances("svc").unwrap().is_empty());
    lb.start();

    let resp = lb.route("svc", UpstreamRequest::get("/")).await.unwrap();
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body, "svc-0");

    assert_eq!(factory.created(), 1);
    assert_eq!(lb.get_instances("svc").unwrap().len(), 1);
    let scale_ups = lb
        .get_scaling_events(None)
        .into_iter()
        .filter(|e| e.action == ScalingAction::ScaleUp)
        .count();
    assert_eq!(scale_ups, 1);

    lb.stop().await;
}

#[tokio::test(start_paused = true)]
async fn abandoned_cold_start_does_not_wedge_service() {
    let factory = Factory::slow(Duration::from_secs(2));
    let backend = Backend::immediate();
    let lb = balancer(factory.clone(), backend.clone());
    lb.register_service(service("svc", 0, 1, 10)).await.unwrap();
    lb.start();

    // The caller goes away while its cold start is still provisioning.
    let caller = spawn_route(&lb, "svc", "/first");
    pause(100).await;
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    pause(60_000).await;
    assert_eq!(lb.scaler().get_stats().provisioning, 0);
    assert!(factory.created() >= 1);

    let resp = lb.route("svc", UpstreamRequest::get("/second")).await.unwrap();
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(backend.seen(), vec!["/second"]);

    lb.stop().await;
}

#[tokio::test(start_paused = true)]
async fn full_queue_rejects_without_growing() {
    let backend = Backend::gated();
    let config = BalancerConfig {
        max_queue_size: 2,
        ..Default::default()
    };
    let lb = balancer_with(
        config,
        CircuitBreakerConfig::default(),
        Arc::new(Factory::default()),
        backend.clone(),
    );
    lb.register_service(service("svc", 1, 1, 1)).await.unwrap();

    let in_flight = spawn_route(&lb, "svc", "/1");
    pause(10).await;
    let queued = [spawn_route(&lb, "svc", "/2"), spawn_route(&lb, "svc", "/3")];
    pause(10).await;
    assert_eq!(lb.queue_depth("svc"), Some(2));

    let err = lb.route("svc", UpstreamRequest::get("/4")).await.unwrap_err();
    assert!(matches!(err, FabricError::CapacityExceeded { max_queue_size: 2, .. }));
    assert_eq!(lb.queue_depth("svc"), Some(2));

    backend.release(3);
    lb.start();
    in_flight.await.unwrap().unwrap();
    for handle in queued {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(backend.seen(), vec!["/1", "/2", "/3"]);
    lb.stop().await;
}

#[tokio::test(start_paused = true)]
async fn requests_dispatch_in_arrival_order() {
    let backend = Backend::delayed(Duration::from_millis(10));
    let lb = balancer(Arc::new(Factory::default()), backend.clone());
    lb.register_service(service("svc", 1, 1, 1)).await.unwrap();
    lb.start();

    let mut handles = Vec::new();
    for path in ["/a", "/b", "/c", "/d"] {
        handles.push(spawn_route(&lb, "svc", path));
        pause(1).await;
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(backend.seen(), vec!["/a", "/b", "/c", "/d"]);
    lb.stop().await;
}

#[tokio::test(start_paused = true)]
async fn queued_and_in_flight_requests_time_out() {
    let config = BalancerConfig {
        request_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let lb = balancer_with(
        config,
        CircuitBreakerConfig::default(),
        Arc::new(Factory::default()),
        Backend::gated(),
    );
    lb.register_service(service("svc", 1, 1, 1)).await.unwrap();

    let in_flight = spawn_route(&lb, "svc", "/slow");
    pause(10).await;

    let err = lb.route("svc", UpstreamRequest::get("/waiting")).await.unwrap_err();
    assert!(matches!(err, FabricError::RequestTimeout { .. }));

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(err, FabricError::RequestTimeout { .. }));

    // The in-flight timeout counted against the instance's circuit.
    let circuits = lb.get_circuit_stats();
    assert_eq!(circuits["svc:svc-0"].failures, 1);
}

#[tokio::test(start_paused = true)]
async fn upstream_failures_open_the_instance_circuit() {
    let backend = Backend::immediate();
    backend.failing.store(true, Ordering::SeqCst);
    let config = BalancerConfig {
        request_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let breaker = CircuitBreakerConfig {
        failure_threshold: 2,
        ..Default::default()
    };
    let lb = balancer_with(config, breaker, Arc::new(Factory::default()), backend);
    lb.register_service(service("svc", 1, 1, 10)).await.unwrap();

    for _ in 0..2 {
        let err = lb.route("svc", UpstreamRequest::get("/")).await.unwrap_err();
        assert!(matches!(err, FabricError::Upstream(_)));
    }
    assert_eq!(lb.get_circuit_stats()["svc:svc-0"].state, CircuitState::Open);

    // The only instance refuses calls and nothing else is starting, so the
    // request is turned away at once instead of waiting out its deadline.
    let started = tokio::time::Instant::now();
    let err = lb.route("svc", UpstreamRequest::get("/")).await.unwrap_err();
    assert!(matches!(err, FabricError::ServiceUnavailable { .. }), "{err:?}");
    assert!(err.to_string().contains("open circuits"));
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(lb.queue_depth("svc"), Some(0));

    let instances = lb.get_instances("svc").unwrap();
    assert_eq!(instances[0].total_failures, 2);
    assert_eq!(instances[0].current_connections, 0);
}

#[tokio::test(start_paused = true)]
async fn queue_pressure_scales_up_within_max() {
    let config = BalancerConfig {
        request_timeout: Duration::from_secs(60),
        ..Default::default()
    };
    let factory = Arc::new(Factory::default());
    let lb = balancer_with(
        config,
        CircuitBreakerConfig::default(),
        factory.clone(),
        Backend::delayed(Duration::from_secs(3)),
    );
    lb.register_service(service("svc", 1, 3, 1)).await.unwrap();

    let handles: Vec<_> = (0..8).map(|_| spawn_route(&lb, "svc", "/work")).collect();
    pause(10).await;
    assert_eq!(lb.queue_depth("svc"), Some(7));

    lb.start();
    pause(5_100).await;
    assert!(lb.get_instances("svc").unwrap().len() >= 2);

    for handle in handles {
        handle.await.unwrap().unwrap();
        assert!(lb.get_instances("svc").unwrap().len() <= 3);
    }
    assert!(factory.created() <= 3);

    let event = lb
        .get_scaling_events(None)
        .into_iter()
        .find(|e| e.action == ScalingAction::ScaleUp && e.reason.starts_with("queue depth"))
        .expect("queue-driven scale-up");
    assert_eq!(event.service_id, "svc");
    lb.stop().await;
}

#[tokio::test(start_paused = true)]
async fn idle_service_scales_to_zero_and_back() {
    let factory = Arc::new(Factory::default());
    let lb = balancer(factory.clone(), Backend::immediate());
    lb.register_service(service("svc", 0, 2, 10)).await.unwrap();
    lb.start();

    lb.route("svc", UpstreamRequest::get("/")).await.unwrap();
    assert_eq!(lb.get_circuit_stats().len(), 1);

    pause(80_000).await;
    assert!(lb.get_instances("svc").unwrap().is_empty());
    assert_eq!(factory.destroyed(), 1);
    let last = lb.get_scaling_events(Some(1)).pop().unwrap();
    assert_eq!(last.action, ScalingAction::ScaleDown);
    assert!(lb.get_circuit_stats().is_empty());

    lb.route("svc", UpstreamRequest::get("/")).await.unwrap();
    assert_eq!(factory.created(), 2);
    lb.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unhealthy_instance_replaced_by_scaling_loop() {
    let factory = Arc::new(Factory::default());
    let config = BalancerConfig {
        health_check_every: 1,
        ..Default::default()
    };
    let lb = balancer_with(
        config,
        CircuitBreakerConfig::default(),
        factory.clone(),
        Backend::immediate(),
    );
    lb.register_service(service("svc", 1, 2, 10)).await.unwrap();
    factory.unhealthy.store(true, Ordering::SeqCst);
    lb.start();

    // Three failed sweeps at 5s, 10s, and 15s.
    pause(16_000).await;
    factory.unhealthy.store(false, Ordering::SeqCst);
    pause(100).await;

    assert_eq!(factory.destroyed(), 1);
    assert_eq!(factory.created(), 2);
    let running: Vec<String> = lb
        .get_instances("svc")
        .unwrap()
        .into_iter()
        .filter(|i| i.is_running())
        .map(|i| i.id)
        .collect();
    assert_eq!(running, vec!["svc-1"]);
    assert!(
        lb.get_scaling_events(None)
            .iter()
            .any(|e| e.reason == "health check failed")
    );
    lb.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unregister_rejects_queued_requests() {
    let backend = Backend::gated();
    let factory = Arc::new(Factory::default());
    let lb = balancer(factory.clone(), backend.clone());
    lb.register_service(service("svc", 1, 1, 1)).await.unwrap();

    let in_flight = spawn_route(&lb, "svc", "/1");
    pause(10).await;
    let queued = spawn_route(&lb, "svc", "/2");
    pause(10).await;

    let unregister = tokio::spawn({
        let lb = Arc::clone(&lb);
        async move { lb.unregister_service("svc").await }
    });
    pause(10).await;

    let err = queued.await.unwrap().unwrap_err();
    assert!(matches!(err, FabricError::ServiceUnavailable { .. }));
    // The busy instance is still draining.
    assert_eq!(factory.destroyed(), 0);

    backend.release(1);
    in_flight.await.unwrap().unwrap();
    assert_eq!(unregister.await.unwrap().unwrap(), 1);
    assert_eq!(factory.destroyed(), 1);

    let err = lb.route("svc", UpstreamRequest::get("/")).await.unwrap_err();
    assert_eq!(err, FabricError::ServiceNotFound("svc".to_string()));
}
