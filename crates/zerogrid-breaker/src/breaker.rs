//! Circuit breaker state machine and the shared keyed map.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use zerogrid_core::{CircuitBreakerConfig, CircuitState, CircuitStats, FabricError};

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// State for a single key.
#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    /// Consecutive failures (decays by one per success while closed).
    failures: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    /// Probes admitted while half-open and not yet completed.
    probes_in_flight: u32,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            last_failure_at: None,
            opened_at: None,
            probes_in_flight: 0,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probes_in_flight = 0;
    }

    fn reset_elapsed(&self, config: &CircuitBreakerConfig, now: Instant) -> bool {
        self.opened_at
            .is_none_or(|at| now.saturating_duration_since(at) >= config.reset_timeout)
    }
}

/// Keyed circuit breaker shared by every dispatch task.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `f` through the breaker for `key`.
    ///
    /// Fails with `CircuitBroken` without calling `f` when the circuit
    /// rejects. Any `Err` from `f` counts as a failure.
    pub async fn execute<T, E, F, Fut>(&self, key: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<FabricError>,
    {
        let permit = self.acquire(key)?;
        let result = f().await;
        match &result {
            Ok(_) => permit.success(),
            Err(_) => permit.failure(),
        }
        result
    }

    /// Admit one call for `key`, or fail with `CircuitBroken`.
    ///
    /// The returned permit must be completed with [`Permit::success`] or
    /// [`Permit::failure`]; dropping it counts as a failure.
    pub fn acquire(&self, key: &str) -> Result<Permit<'_>, FabricError> {
        let now = Instant::now();
        let mut circuits = self.circuits();
        let circuit = circuits.entry(key.to_string()).or_insert_with(Circuit::new);

        if circuit.state == CircuitState::Open {
            if !circuit.reset_elapsed(&self.config, now) {
                return Err(FabricError::CircuitBroken(key.to_string()));
            }
            circuit.state = CircuitState::HalfOpen;
            circuit.probes_in_flight = 0;
            info!(%key, "circuit half-open, admitting probes");
        }

        let admission = match circuit.state {
            CircuitState::Closed => Admission::Normal,
            CircuitState::HalfOpen => {
                if circuit.probes_in_flight >= self.config.half_open_requests {
                    debug!(%key, in_flight = circuit.probes_in_flight, "probe budget exhausted");
                    return Err(FabricError::CircuitBroken(key.to_string()));
                }
                circuit.probes_in_flight += 1;
                Admission::Probe
            }
            CircuitState::Open => return Err(FabricError::CircuitBroken(key.to_string())),
        };

        Ok(Permit {
            breaker: self,
            key: key.to_string(),
            admission,
            done: false,
        })
    }

    /// Whether a call for `key` would currently be admitted.
    ///
    /// Does not reserve a probe slot and does not change state.
    pub fn can_execute(&self, key: &str) -> bool {
        let now = Instant::now();
        let circuits = self.circuits();
        match circuits.get(key) {
            None => true,
            Some(c) => match c.state {
                CircuitState::Closed => true,
                CircuitState::Open => c.reset_elapsed(&self.config, now),
                CircuitState::HalfOpen => c.probes_in_flight < self.config.half_open_requests,
            },
        }
    }

    /// Stored state for `key`. Unknown keys are closed.
    pub fn get_state(&self, key: &str) -> CircuitState {
        self.circuits()
            .get(key)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Force `key` back to a fresh closed circuit.
    pub fn reset(&self, key: &str) {
        self.circuits().insert(key.to_string(), Circuit::new());
        info!(%key, "circuit reset");
    }

    /// Drop all state for `key`.
    pub fn forget(&self, key: &str) {
        self.circuits().remove(key);
    }

    /// Keep only keys for which `keep` returns true.
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) {
        self.circuits().retain(|key, _| keep(key));
    }

    /// State and failure count per key, ordered by key.
    pub fn get_stats(&self) -> BTreeMap<String, CircuitStats> {
        self.circuits()
            .iter()
            .map(|(key, c)| {
                (
                    key.clone(),
                    CircuitStats {
                        state: c.state,
                        failures: c.failures,
                    },
                )
            })
            .collect()
    }

    /// Time of the most recent failure for `key`.
    pub fn last_failure_at(&self, key: &str) -> Option<Instant> {
        self.circuits().get(key).and_then(|c| c.last_failure_at)
    }

    fn record(&self, key: &str, admission: Admission, success: bool) {
        let now = Instant::now();
        let mut circuits = self.circuits();
        // Forgotten while the call was in flight.
        let Some(circuit) = circuits.get_mut(key) else {
            return;
        };

        if success {
            match (circuit.state, admission) {
                (CircuitState::Closed, _) => {
                    circuit.failures = circuit.failures.saturating_sub(1);
                }
                (CircuitState::HalfOpen, Admission::Probe) => {
                    circuit.probes_in_flight = circuit.probes_in_flight.saturating_sub(1);
                    if circuit.probes_in_flight == 0 {
                        circuit.state = CircuitState::Closed;
                        circuit.failures = 0;
                        circuit.opened_at = None;
                        info!(%key, "circuit closed after successful probes");
                    }
                }
                // A call admitted before the circuit opened, or a probe
                // outliving a reopen: neither says anything new.
                _ => {}
            }
            return;
        }

        circuit.last_failure_at = Some(now);
        match circuit.state {
            CircuitState::Closed => {
                circuit.failures += 1;
                if circuit.failures >= self.config.failure_threshold {
                    circuit.open(now);
                    warn!(
                        %key,
                        failures = circuit.failures,
                        threshold = self.config.failure_threshold,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                circuit.failures += 1;
                circuit.open(now);
                warn!(%key, "probe failed, circuit reopened");
            }
            CircuitState::Open => {}
        }
    }

    fn circuits(&self) -> MutexGuard<'_, HashMap<String, Circuit>> {
        self.circuits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// An admitted call. Completing it feeds the outcome back to the circuit.
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    key: String,
    admission: Admission,
    done: bool,
}

impl Permit<'_> {
    pub fn success(mut self) {
        self.done = true;
        self.breaker.record(&self.key, self.admission, true);
    }

    pub fn failure(mut self) {
        self.done = true;
        self.breaker.record(&self.key, self.admission, false);
    }

    /// Whether this call is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.admission == Admission::Probe
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.done {
            debug!(key = %self.key, "permit dropped before completion, counting as failure");
            self.breaker.record(&self.key, self.admission, false);
        }
    }
}
