//! Domain types shared across ZeroGrid crates.
//!
//! Service definitions are serializable so they can be loaded from
//! `zerogrid.toml` and returned by the API. Instance records carry
//! monotonic timestamps and are projected through [`InstanceView`]
//! whenever they leave the process.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{FabricError, FabricResult};

/// Unique identifier for a registered service.
pub type ServiceId = String;

/// Unique identifier for an instance within a service.
pub type InstanceId = String;

// ── Service ───────────────────────────────────────────────────────

/// Specification for a service fronted by the load balancer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceDefinition {
    pub id: ServiceId,
    pub name: String,
    /// Free-form workload type ("http", "worker", "storage", ...).
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub health: HealthCheckSpec,
    #[serde(default)]
    pub scaling: ScalingConfig,
}

impl ServiceDefinition {
    /// A definition with default resources, health check, and scaling.
    pub fn new(id: impl Into<String>, name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            service_type: service_type.into(),
            resources: ResourceRequirements::default(),
            health: HealthCheckSpec::default(),
            scaling: ScalingConfig::default(),
        }
    }

    /// Reject definitions the autoscaler cannot honour.
    pub fn validate(&self) -> FabricResult<()> {
        let invalid = |msg: String| Err(FabricError::InvalidDefinition(format!("{}: {msg}", self.id)));

        if self.id.trim().is_empty() {
            return Err(FabricError::InvalidDefinition("service id is empty".to_string()));
        }
        if self.id.contains(':') {
            return invalid("service id must not contain ':'".to_string());
        }
        let s = &self.scaling;
        if s.max_instances == 0 {
            return invalid("max_instances must be at least 1".to_string());
        }
        if s.min_instances > s.max_instances {
            return invalid(format!(
                "min_instances ({}) exceeds max_instances ({})",
                s.min_instances, s.max_instances
            ));
        }
        if s.target_concurrency == 0 {
            return invalid("target_concurrency must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Resource requirements per instance, passed through to the factory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceRequirements {
    /// CPU in millicores.
    pub cpu_millis: u32,
    /// Memory limit in bytes.
    pub memory_bytes: u64,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpu_millis: 1000,
            memory_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Health check parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthCheckSpec {
    /// HTTP path to probe (e.g., "/healthz").
    pub path: String,
    /// Interval between readiness probes while an instance starts.
    #[serde(with = "crate::duration")]
    pub interval: Duration,
    /// How long an instance may take to become healthy.
    #[serde(with = "crate::duration")]
    pub timeout: Duration,
    /// Consecutive failed checks before a running instance is replaced.
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            path: "/healthz".to_string(),
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            unhealthy_threshold: 3,
        }
    }
}

/// Per-service scaling policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScalingConfig {
    pub min_instances: u32,
    pub max_instances: u32,
    /// Concurrent requests one instance is expected to serve.
    pub target_concurrency: u32,
    /// Queue depth that triggers a scale-up.
    pub scale_up_threshold: usize,
    /// Idle time before an instance may be removed. Falls back to the
    /// autoscaler's `scale_down_threshold` when unset.
    #[serde(
        with = "crate::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub scale_down_delay: Option<Duration>,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_instances: 0,
            max_instances: 100,
            target_concurrency: 10,
            scale_up_threshold: 5,
            scale_down_delay: None,
        }
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Running,
    Draining,
    Stopped,
    Error,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Draining => "draining",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// One unit of compute serving a service.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: InstanceId,
    pub service_id: ServiceId,
    /// Address the upstream forwards to (host:port).
    pub endpoint: String,
    pub status: InstanceStatus,
    pub current_connections: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    /// Exponential moving average of request latency.
    pub avg_latency_ms: f64,
    /// Consecutive failed health checks.
    pub health_failures: u32,
    pub started_at: Instant,
    pub last_activity_at: Instant,
}

impl Instance {
    /// A fresh instance in `Starting` state.
    pub fn new(id: impl Into<String>, service_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            service_id: service_id.into(),
            endpoint: endpoint.into(),
            status: InstanceStatus::Starting,
            current_connections: 0,
            total_requests: 0,
            total_failures: 0,
            avg_latency_ms: 0.0,
            health_failures: 0,
            started_at: now,
            last_activity_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    /// Starting or running: counts toward `max_instances`.
    pub fn is_live(&self) -> bool {
        matches!(self.status, InstanceStatus::Starting | InstanceStatus::Running)
    }

    /// Circuit breaker key for this instance.
    pub fn circuit_key(&self) -> String {
        circuit_key(&self.service_id, &self.id)
    }

    /// Time since the last dispatch or completion.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity_at)
    }

    /// Serializable projection at `now`.
    pub fn view(&self, now: Instant) -> InstanceView {
        InstanceView {
            id: self.id.clone(),
            service_id: self.service_id.clone(),
            endpoint: self.endpoint.clone(),
            status: self.status,
            current_connections: self.current_connections,
            total_requests: self.total_requests,
            total_failures: self.total_failures,
            avg_latency_ms: self.avg_latency_ms,
            uptime_ms: now.saturating_duration_since(self.started_at).as_millis() as u64,
            idle_ms: self.idle_for(now).as_millis() as u64,
        }
    }
}

/// Composite `service:instance` key used by the circuit breaker.
pub fn circuit_key(service_id: &str, instance_id: &str) -> String {
    format!("{service_id}:{instance_id}")
}

/// Instance state as reported by the API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceView {
    pub id: InstanceId,
    pub service_id: ServiceId,
    pub endpoint: String,
    pub status: InstanceStatus,
    pub current_connections: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub avg_latency_ms: f64,
    pub uptime_ms: u64,
    pub idle_ms: u64,
}

// ── Scaling ───────────────────────────────────────────────────────

/// Outcome of a scaling evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    None,
}

/// One entry in the scaling log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingEvent {
    pub action: ScalingAction,
    pub service_id: ServiceId,
    pub from_count: u32,
    pub to_count: u32,
    pub reason: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
}

impl ScalingEvent {
    pub fn new(
        action: ScalingAction,
        service_id: &str,
        from_count: u32,
        to_count: u32,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            action,
            service_id: service_id.to_string(),
            from_count,
            to_count,
            reason: reason.into(),
            timestamp: epoch_millis(),
        }
    }
}

// ── Circuit breaker ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

/// Per-key breaker summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub failures: u32,
}

// ── Stats ─────────────────────────────────────────────────────────

/// Aggregate view returned by `LoadBalancer::get_stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoadBalancerStats {
    pub active_instances: u32,
    pub total_instances: u32,
    pub queued_requests: usize,
    pub total_requests_served: u64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub requests_per_second: f64,
    pub scaling_events: Vec<ScalingEvent>,
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_defaults_match_control_plane_defaults() {
        let def = ServiceDefinition::new("api", "API", "http");
        assert_eq!(def.scaling.min_instances, 0);
        assert_eq!(def.scaling.max_instances, 100);
        assert_eq!(def.scaling.target_concurrency, 10);
        assert_eq!(def.scaling.scale_up_threshold, 5);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        let mut def = ServiceDefinition::new("api", "API", "http");
        def.scaling.min_instances = 5;
        def.scaling.max_instances = 2;
        assert!(matches!(def.validate(), Err(FabricError::InvalidDefinition(_))));
    }

    #[test]
    fn validate_rejects_colon_in_id() {
        let def = ServiceDefinition::new("a:b", "AB", "http");
        assert!(def.validate().is_err());
    }

    #[test]
    fn definition_json_uses_type_field() {
        let def = ServiceDefinition::new("cdn", "CDN", "storage");
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["type"], "storage");
        assert_eq!(json["health"]["timeout"], "30s");
        assert!(json["scaling"].get("scale_down_delay").is_none());
    }

    #[test]
    fn circuit_state_serializes_kebab_case() {
        let json = serde_json::to_string(&CircuitState::HalfOpen).unwrap();
        assert_eq!(json, "\"half-open\"");
    }

    #[tokio::test(start_paused = true)]
    async fn instance_view_reports_idle_time() {
        let mut inst = Instance::new("i-1", "api", "127.0.0.1:9000");
        inst.status = InstanceStatus::Running;
        tokio::time::advance(Duration::from_millis(1500)).await;

        let view = inst.view(Instant::now());
        assert_eq!(view.idle_ms, 1500);
        assert_eq!(view.uptime_ms, 1500);
        assert_eq!(inst.circuit_key(), "api:i-1");
    }
}
