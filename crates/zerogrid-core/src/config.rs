//! zerogrid.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::ServiceDefinition;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZeroGridConfig {
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub autoscaler: AutoscalerConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// Queue and dispatch loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BalancerConfig {
    /// Deadline applied to each request at enqueue time.
    #[serde(with = "crate::duration")]
    pub request_timeout: Duration,
    /// Per-service queue bound.
    pub max_queue_size: usize,
    /// Period of the scaling evaluation loop.
    #[serde(with = "crate::duration")]
    pub scaling_interval: Duration,
    /// Period of the queue processing loop.
    #[serde(with = "crate::duration")]
    pub queue_interval: Duration,
    /// Run the health sweep every N scaling ticks (0 disables it).
    pub health_check_every: u32,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_queue_size: 1000,
            scaling_interval: Duration::from_secs(5),
            queue_interval: Duration::from_millis(100),
            health_check_every: 6,
        }
    }
}

/// Scaling policy knobs shared by all services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoscalerConfig {
    /// Idle time before an instance becomes a scale-down candidate.
    #[serde(with = "crate::duration")]
    pub scale_down_threshold: Duration,
    #[serde(with = "crate::duration")]
    pub scale_up_cooldown: Duration,
    #[serde(with = "crate::duration")]
    pub scale_down_cooldown: Duration,
    /// Hard cap on waiting for in-flight requests during a drain.
    #[serde(with = "crate::duration")]
    pub connection_drain_timeout: Duration,
    #[serde(with = "crate::duration")]
    pub drain_poll_interval: Duration,
    /// Fraction of `running * target_concurrency` that triggers a scale-up.
    pub utilization_threshold: f64,
    /// Weight of the newest sample in the latency moving average.
    pub latency_ema_weight: f64,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            scale_down_threshold: Duration::from_secs(60),
            scale_up_cooldown: Duration::from_secs(5),
            scale_down_cooldown: Duration::from_secs(30),
            connection_drain_timeout: Duration::from_secs(30),
            drain_poll_interval: Duration::from_secs(1),
            utilization_threshold: 0.8,
            latency_ema_weight: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Time an open circuit waits before admitting probes.
    #[serde(with = "crate::duration")]
    pub reset_timeout: Duration,
    /// Probes admitted while half-open.
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_requests: 3,
        }
    }
}

/// A service entry: its definition plus the endpoints it may be placed on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    #[serde(flatten)]
    pub definition: ServiceDefinition,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

impl ZeroGridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: ZeroGridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every service definition and the global knobs.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.balancer.max_queue_size == 0 {
            anyhow::bail!("balancer.max_queue_size must be at least 1");
        }
        for (name, interval) in [
            ("balancer.scaling_interval", self.balancer.scaling_interval),
            ("balancer.queue_interval", self.balancer.queue_interval),
            ("autoscaler.drain_poll_interval", self.autoscaler.drain_poll_interval),
        ] {
            if interval.is_zero() {
                anyhow::bail!("{name} must be greater than zero");
            }
        }
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.half_open_requests == 0 {
            anyhow::bail!("circuit_breaker thresholds must be at least 1");
        }
        let weight = self.autoscaler.latency_ema_weight;
        if !(weight > 0.0 && weight <= 1.0) {
            anyhow::bail!("autoscaler.latency_ema_weight must be in (0, 1], got {weight}");
        }
        let mut seen = std::collections::HashSet::new();
        for svc in &self.services {
            svc.definition.validate()?;
            if !seen.insert(svc.definition.id.as_str()) {
                anyhow::bail!("duplicate service id: {}", svc.definition.id);
            }
        }
        Ok(())
    }

    /// Scaffold a minimal zerogrid.toml with one scale-to-zero service.
    pub fn scaffold(service_id: &str, endpoint: &str) -> Self {
        ZeroGridConfig {
            services: vec![ServiceConfig {
                definition: ServiceDefinition::new(service_id, service_id, "http"),
                endpoints: vec![endpoint.to_string()],
            }],
            ..ZeroGridConfig::default()
        }
    }
}
