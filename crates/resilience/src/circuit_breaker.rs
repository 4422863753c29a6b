//! Per-provider circuit breaker
//!
//! Gates outbound calls to a model provider based on its recent reliability
//! and self-heals via timed probing. Each provider gets its own lazily
//! created circuit record, so an outage at one provider never blocks calls
//! to another.
//!
//! The `Open` → `HalfOpen` transition is pull-based: it happens the next time
//! the circuit's state is queried after the cooldown has elapsed, rather than
//! on a background timer. Every caller's gate check doubles as the timer
//! tick, which keeps the breaker free of scheduler threads.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};

//==============================================================================
// Errors
//==============================================================================

/// Configuration validation error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

//==============================================================================
// State machine
//==============================================================================

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through
    Closed,
    /// Circuit is open, requests are blocked outright
    Open,
    /// Circuit allows a bounded number of probe requests to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time to wait after the last failure before probing recovery
    pub cooldown: Duration,
    /// Consecutive probe successes needed to close a half-open circuit;
    /// also the probe quota for one half-open episode
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                message: "failure_threshold must be greater than 0".to_string(),
            });
        }

        if self.half_open_max_calls == 0 {
            return Err(ConfigError::Invalid {
                message: "half_open_max_calls must be greater than 0".to_string(),
            });
        }

        if self.cooldown.is_zero() {
            return Err(ConfigError::Invalid {
                message: "cooldown must be non-zero".to_string(),
            });
        }

        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    pub fn half_open_max_calls(mut self, max_calls: u32) -> Self {
        self.config.half_open_max_calls = max_calls;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

//==============================================================================
// Per-provider circuit record
//==============================================================================

/// Mutable state tracked for one provider.
///
/// `consecutive_failures` only ever increments or resets to 0.
/// `half_open_successes` is meaningful only while `state == HalfOpen` and is
/// cleared whenever the circuit leaves that state.
#[derive(Debug)]
struct ProviderCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
    half_open_successes: u32,
}

impl ProviderCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_time: None,
            half_open_successes: 0,
        }
    }
}

/// Read-only snapshot of one provider's circuit for observability
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub provider: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    /// Seconds since the most recent recorded failure, if any
    pub seconds_since_last_failure: Option<f64>,
    /// Whether a call issued right now would be allowed through
    pub can_execute: bool,
    #[serde(skip)]
    pub last_failure_time: Option<Instant>,
}

//==============================================================================
// Circuit breaker registry
//==============================================================================

/// Circuit breaker keyed by provider identifier
///
/// Circuits are created lazily on first access and live for the lifetime of
/// the breaker. Each provider's record sits behind its own mutex so unrelated
/// providers never serialize on each other.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, Mutex<ProviderCircuit>>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("providers", &self.circuits.len())
            .finish()
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a new circuit breaker with the given configuration using the
    /// system clock
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }

    /// Create a circuit breaker with default configuration
    pub fn with_defaults() -> Self {
        Self {
            config: CircuitBreakerConfig::default(),
            circuits: DashMap::new(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a new circuit breaker with a custom clock (useful for testing)
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;

        Ok(Self { config, circuits: DashMap::new(), clock: Arc::new(clock) })
    }

    /// The configuration this breaker was built with
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `f` against the provider's circuit record, creating it on first
    /// access.
    fn with_circuit<R>(&self, provider: &str, f: impl FnOnce(&mut ProviderCircuit) -> R) -> R {
        if let Some(entry) = self.circuits.get(provider) {
            let mut guard = entry.lock();
            return f(&mut guard);
        }

        let entry = self
            .circuits
            .entry(provider.to_string())
            .or_insert_with(|| Mutex::new(ProviderCircuit::new()));
        let mut guard = entry.lock();
        f(&mut guard)
    }

    /// Lazily transition `Open` → `HalfOpen` once the cooldown has elapsed.
    fn advance_cooldown(&self, provider: &str, circuit: &mut ProviderCircuit) {
        if circuit.state != CircuitState::Open {
            return;
        }

        if let Some(failure_time) = circuit.last_failure_time {
            if self.clock.now().duration_since(failure_time) >= self.config.cooldown {
                circuit.state = CircuitState::HalfOpen;
                circuit.half_open_successes = 0;
                info!(provider, "circuit cooled down, entering half-open probe window");
            }
        }
    }

    /// Check whether a call to `provider` is currently allowed.
    ///
    /// Returns `false` if the circuit is open and the cooldown has not
    /// elapsed, or if it is half-open and the probe quota for the current
    /// episode is exhausted. May perform the lazy `Open` → `HalfOpen`
    /// transition.
    pub fn can_execute(&self, provider: &str) -> bool {
        self.with_circuit(provider, |circuit| {
            self.advance_cooldown(provider, circuit);

            match circuit.state {
                CircuitState::Closed => true,
                CircuitState::Open => false,
                CircuitState::HalfOpen => {
                    circuit.half_open_successes < self.config.half_open_max_calls
                }
            }
        })
    }

    /// Current state of the provider's circuit.
    ///
    /// Like [`can_execute`](Self::can_execute), this may perform the lazy
    /// `Open` → `HalfOpen` transition.
    pub fn state_of(&self, provider: &str) -> CircuitState {
        self.with_circuit(provider, |circuit| {
            self.advance_cooldown(provider, circuit);
            circuit.state
        })
    }

    /// Record a successful call against `provider`.
    ///
    /// Safe to call unconditionally; never panics. A success observed while
    /// the circuit is open is ignored (callers that respect `can_execute`
    /// never get there).
    pub fn record_success(&self, provider: &str) {
        self.with_circuit(provider, |circuit| match circuit.state {
            CircuitState::Closed => {
                circuit.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                circuit.half_open_successes += 1;
                if circuit.half_open_successes >= self.config.half_open_max_calls {
                    circuit.state = CircuitState::Closed;
                    circuit.consecutive_failures = 0;
                    circuit.half_open_successes = 0;
                    info!(provider, "circuit closed after successful probes");
                }
            }
            CircuitState::Open => {
                debug!(provider, "success recorded while circuit is open, ignoring");
            }
        });
    }

    /// Record a failed call against `provider`.
    ///
    /// `error_kind` is informational only (logging); all failure kinds drive
    /// the state machine identically. Any single failure during a half-open
    /// episode reopens the circuit regardless of the failure threshold.
    pub fn record_failure(&self, provider: &str, error_kind: &str) {
        self.with_circuit(provider, |circuit| {
            circuit.consecutive_failures += 1;
            circuit.last_failure_time = Some(self.clock.now());

            match circuit.state {
                CircuitState::Closed
                    if circuit.consecutive_failures >= self.config.failure_threshold =>
                {
                    circuit.state = CircuitState::Open;
                    warn!(
                        provider,
                        error_kind,
                        failures = circuit.consecutive_failures,
                        "circuit opened after consecutive failures"
                    );
                }
                CircuitState::HalfOpen => {
                    circuit.state = CircuitState::Open;
                    circuit.half_open_successes = 0;
                    warn!(provider, error_kind, "probe failed, circuit reopened");
                }
                _ => {
                    debug!(
                        provider,
                        error_kind,
                        failures = circuit.consecutive_failures,
                        "failure recorded"
                    );
                }
            }
        });
    }

    /// Read-only snapshot of the provider's circuit.
    ///
    /// Never mutates state: a circuit whose cooldown has elapsed still
    /// reports `Open` here (with `can_execute: true`) until the next
    /// `can_execute`/`state_of` call performs the transition.
    pub fn status(&self, provider: &str) -> CircuitStatus {
        self.with_circuit(provider, |circuit| self.snapshot(provider, circuit))
    }

    /// Snapshots for every provider seen so far.
    pub fn all_statuses(&self) -> Vec<CircuitStatus> {
        self.circuits
            .iter()
            .map(|entry| {
                let circuit = entry.value().lock();
                self.snapshot(entry.key(), &circuit)
            })
            .collect()
    }

    fn snapshot(&self, provider: &str, circuit: &ProviderCircuit) -> CircuitStatus {
        let now = self.clock.now();
        let since_failure = circuit.last_failure_time.map(|t| now.duration_since(t));
        let cooled_down = since_failure.is_some_and(|d| d >= self.config.cooldown);

        let can_execute = match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => cooled_down,
            CircuitState::HalfOpen => {
                circuit.half_open_successes < self.config.half_open_max_calls
            }
        };

        CircuitStatus {
            provider: provider.to_string(),
            state: circuit.state,
            consecutive_failures: circuit.consecutive_failures,
            half_open_successes: circuit.half_open_successes,
            seconds_since_last_failure: since_failure.map(|d| d.as_secs_f64()),
            can_execute,
            last_failure_time: circuit.last_failure_time,
        }
    }

    /// Manually open the provider's circuit (e.g. for maintenance).
    ///
    /// Stamps the last-failure time so the normal cooldown applies to the
    /// manual open as well.
    pub fn force_open(&self, provider: &str) {
        self.with_circuit(provider, |circuit| {
            circuit.state = CircuitState::Open;
            circuit.last_failure_time = Some(self.clock.now());
            circuit.half_open_successes = 0;
            warn!(provider, "circuit forced open");
        });
    }

    /// Manually close the provider's circuit and clear its failure counter.
    pub fn force_close(&self, provider: &str) {
        self.with_circuit(provider, |circuit| {
            circuit.state = CircuitState::Closed;
            circuit.consecutive_failures = 0;
            circuit.half_open_successes = 0;
            info!(provider, "circuit forced closed");
        });
    }

    /// Reset the provider's circuit to a fresh closed record.
    pub fn reset(&self, provider: &str) {
        self.with_circuit(provider, |circuit| {
            *circuit = ProviderCircuit::new();
            info!(provider, "circuit reset");
        });
    }
}

impl Default for CircuitBreaker<SystemClock> {
    fn default() -> Self {
        Self::with_defaults()
    }
}
