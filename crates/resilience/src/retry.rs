//! Bounded, jittered exponential-backoff retries for provider calls
//!
//! Wraps a single fallible operation with a bounded attempt budget and
//! exponential backoff, coordinating with the per-provider
//! [`CircuitBreaker`] so that retries against an open circuit fail fast
//! instead of waiting out the full backoff schedule.
//!
//! Retryability is a caller-supplied classification via [`ErrorClassifier`];
//! the breaker itself treats all failure kinds identically.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::circuit_breaker::{CircuitBreaker, ConfigError, ConfigResult};
use crate::clock::{Clock, SystemClock};

//==============================================================================
// Errors
//==============================================================================

/// Errors surfaced by the retry engine
///
/// Generic over the underlying operation error type `E`, which is preserved
/// so callers always see either a successful result or the final error.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The provider's circuit is open (or its probe quota is exhausted);
    /// the call was rejected without running. Carries the last error
    /// observed during this retry sequence, if any attempt ran before the
    /// circuit tripped.
    #[error("circuit breaker for provider '{provider}' is open, rejecting call")]
    CircuitOpen { provider: String, last_error: Option<E> },

    /// Every attempt in the budget failed; `source` is the *last* error.
    #[error("all retry attempts exhausted after {attempts} tries")]
    AttemptsExhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    /// The operation failed with an error the classifier deemed fatal;
    /// propagated immediately with no backoff.
    #[error("operation failed with non-retryable error")]
    NonRetryable {
        #[source]
        source: E,
    },
}

/// Result type for retry operations
pub type RetryResult<T, E> = Result<T, RetryError<E>>;

//==============================================================================
// Error classification
//==============================================================================

/// Decides whether an operation error is worth retrying
///
/// Replaces exception-type membership testing with an explicit
/// classification function. `kind` feeds the breaker's informational
/// `error_kind` and defaults to the Rust type name of `E`.
pub trait ErrorClassifier<E> {
    /// Whether the error is transient and the call should be retried
    fn is_retryable(&self, error: &E) -> bool;

    /// Short label for logging and breaker bookkeeping
    fn kind(&self, _error: &E) -> &str {
        std::any::type_name::<E>()
    }
}

/// Ready-made classifiers for common scenarios
pub mod classifiers {
    use super::ErrorClassifier;

    /// Treats every error as retryable
    #[derive(Debug, Clone, Copy)]
    pub struct AlwaysRetry;

    impl<E> ErrorClassifier<E> for AlwaysRetry {
        fn is_retryable(&self, _error: &E) -> bool {
            true
        }
    }

    /// Treats every error as fatal
    #[derive(Debug, Clone, Copy)]
    pub struct NeverRetry;

    impl<E> ErrorClassifier<E> for NeverRetry {
        fn is_retryable(&self, _error: &E) -> bool {
            false
        }
    }

    /// Classifies with a caller-supplied predicate
    #[derive(Debug, Clone)]
    pub struct PredicateClassifier<F> {
        predicate: F,
    }

    impl<F> PredicateClassifier<F> {
        pub fn new(predicate: F) -> Self {
            Self { predicate }
        }
    }

    impl<F, E> ErrorClassifier<E> for PredicateClassifier<F>
    where
        F: Fn(&E) -> bool,
    {
        fn is_retryable(&self, error: &E) -> bool {
            (self.predicate)(error)
        }
    }
}

//==============================================================================
// Configuration
//==============================================================================

/// Configuration for retry behavior
///
/// Immutable; one instance is reused across calls. `max_attempts` is the
/// total call budget including the first attempt, not a retry count.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Base delay of the backoff formula
    pub base_delay: Duration,
    /// Cap applied to the computed delay before jitter
    pub max_delay: Duration,
    /// Exponent base of the backoff formula
    pub exponential_base: f64,
    /// Whether to add uniform random jitter to each delay
    pub jitter: bool,
    /// Upper bound (exclusive) of the added jitter
    pub jitter_range: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::moderate()
    }
}

impl RetryConfig {
    /// Fast, short-fused profile: 4 attempts, 2 s base, 30 s cap
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
            jitter_range: Duration::from_secs(1),
        }
    }

    /// Balanced default profile: 3 attempts, 3 s base, 45 s cap
    pub fn moderate() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(45),
            exponential_base: 2.5,
            jitter: true,
            jitter_range: Duration::from_secs(2),
        }
    }

    /// Patient profile for batch work: 5 attempts, 5 s base, 60 s cap
    pub fn conservative() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
            jitter_range: Duration::from_secs(3),
        }
    }

    /// Create a configuration builder
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                message: "max_attempts must be greater than 0".to_string(),
            });
        }

        if self.exponential_base <= 0.0 {
            return Err(ConfigError::Invalid {
                message: "exponential_base must be greater than 0".to_string(),
            });
        }

        if self.max_delay < self.base_delay {
            return Err(ConfigError::Invalid {
                message: "max_delay must be at least base_delay".to_string(),
            });
        }

        Ok(())
    }

    /// Backoff delay before the retry following completed attempt `attempt`
    /// (0-based).
    ///
    /// `delay = min(base_delay * exponential_base^attempt, max_delay)`, plus
    /// a uniform random duration in `[0, jitter_range)` when jitter is
    /// enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.base_delay.as_secs_f64() * self.exponential_base.powi(attempt as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let mut delay = Duration::from_secs_f64(capped);

        if self.jitter && !self.jitter_range.is_zero() {
            let jitter_secs =
                rand::thread_rng().gen_range(0.0..self.jitter_range.as_secs_f64());
            delay += Duration::from_secs_f64(jitter_secs);
        }

        delay
    }
}

/// Builder for [`RetryConfig`]
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn exponential_base(mut self, base: f64) -> Self {
        self.config.exponential_base = base;
        self
    }

    pub fn jitter(mut self, range: Duration) -> Self {
        self.config.jitter = true;
        self.config.jitter_range = range;
        self
    }

    pub fn no_jitter(mut self) -> Self {
        self.config.jitter = false;
        self
    }

    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

//==============================================================================
// Executor
//==============================================================================

/// Executes operations under a retry budget, optionally gated by a
/// provider's circuit
///
/// When bound to a provider, the breaker is consulted before *every*
/// attempt (including the first, so a circuit opened by an earlier
/// unrelated call blocks this one before it runs), and every outcome is
/// recorded against that provider.
pub struct RetryExecutor<P, C: Clock = SystemClock> {
    config: RetryConfig,
    classifier: P,
    breaker: Option<(Arc<CircuitBreaker<C>>, String)>,
}

impl<P> RetryExecutor<P, SystemClock> {
    /// Executor with no breaker coupling
    pub fn new(config: RetryConfig, classifier: P) -> Self {
        Self { config, classifier, breaker: None }
    }
}

impl<P, C: Clock> RetryExecutor<P, C> {
    /// Executor gated by `provider`'s circuit in the given breaker
    pub fn for_provider(
        config: RetryConfig,
        classifier: P,
        breaker: Arc<CircuitBreaker<C>>,
        provider: impl Into<String>,
    ) -> Self {
        Self { config, classifier, breaker: Some((breaker, provider.into())) }
    }

    /// Execute `operation` under the configured retry budget.
    ///
    /// Retryable errors back off and retry while attempts remain; the error
    /// surfaced after exhaustion is the *last* one encountered.
    /// Non-retryable errors and circuit-open conditions fail immediately
    /// with no sleep.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> RetryResult<T, E>
    where
        P: ErrorClassifier<E>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error: Option<E> = None;

        for attempt in 0..max_attempts {
            if let Some((breaker, provider)) = &self.breaker {
                if !breaker.can_execute(provider) {
                    warn!(provider = %provider, attempt, "circuit open, rejecting call");
                    return Err(RetryError::CircuitOpen {
                        provider: provider.clone(),
                        last_error,
                    });
                }
            }

            match operation().await {
                Ok(value) => {
                    if let Some((breaker, provider)) = &self.breaker {
                        breaker.record_success(provider);
                    }
                    if attempt > 0 {
                        debug!(retries = attempt, "operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    let retryable = self.classifier.is_retryable(&error);
                    let kind = self.classifier.kind(&error);

                    if let Some((breaker, provider)) = &self.breaker {
                        breaker.record_failure(provider, kind);
                    }

                    if !retryable {
                        debug!(kind, "non-retryable error, giving up");
                        return Err(RetryError::NonRetryable { source: error });
                    }

                    if attempt + 1 >= max_attempts {
                        warn!(attempts = max_attempts, kind, "retry attempts exhausted");
                        return Err(RetryError::AttemptsExhausted {
                            attempts: max_attempts,
                            source: error,
                        });
                    }

                    let delay = self.config.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        kind,
                        "operation failed, retrying after backoff"
                    );
                    last_error = Some(error);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // max_attempts >= 1, so the loop always returns from within.
        unreachable!("retry loop exits via return")
    }
}

//==============================================================================
// Convenience entry points
//==============================================================================

/// Retry `operation` without breaker coupling.
pub async fn retry_call<F, Fut, T, E, P>(
    config: RetryConfig,
    classifier: P,
    operation: F,
) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: ErrorClassifier<E>,
{
    RetryExecutor::new(config, classifier).execute(operation).await
}

/// Retry `operation` against `provider`, gated and tracked by `breaker`.
pub async fn retry_provider_call<F, Fut, T, E, P, C>(
    config: RetryConfig,
    classifier: P,
    breaker: Arc<CircuitBreaker<C>>,
    provider: &str,
    operation: F,
) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: ErrorClassifier<E>,
    C: Clock,
{
    RetryExecutor::for_provider(config, classifier, breaker, provider).execute(operation).await
}
