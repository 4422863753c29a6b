//! Dependency-injected reliability context
//!
//! One [`ReliabilityContext`] is constructed at process startup and passed
//! by `Arc` to every call site, instead of lazy module-level singletons.
//! Tests get fresh, isolated instances for free.

use std::sync::Arc;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, ConfigResult};
use crate::clock::{Clock, SystemClock};
use crate::env::load_keys_from_env;
use crate::key_pool::{ProviderKeyPool, DEFAULT_PROVIDERS};
use crate::retry::{RetryConfig, RetryExecutor};

/// Shared reliability services for provider calls: one circuit breaker and
/// one key pool for the life of the process
pub struct ReliabilityContext<C: Clock = SystemClock> {
    breaker: Arc<CircuitBreaker<C>>,
    keys: Arc<ProviderKeyPool>,
}

impl ReliabilityContext<SystemClock> {
    /// Context with the given breaker configuration and known providers
    pub fn new<S: AsRef<str>>(
        config: CircuitBreakerConfig,
        providers: &[S],
    ) -> ConfigResult<Self> {
        Self::with_clock(config, providers, SystemClock)
    }

    /// Context with default configuration and [`DEFAULT_PROVIDERS`]
    pub fn with_defaults() -> Self {
        Self {
            breaker: Arc::new(CircuitBreaker::with_defaults()),
            keys: Arc::new(ProviderKeyPool::with_default_providers()),
        }
    }

    /// Default context with credentials loaded from the environment
    /// (`{PROVIDER}_API_KEY`, `{PROVIDER}_API_KEY_2`..`_9`)
    pub fn from_env() -> Self {
        let context = Self::with_defaults();
        load_keys_from_env(&context.keys, DEFAULT_PROVIDERS);
        context
    }
}

impl<C: Clock> ReliabilityContext<C> {
    /// Context with a custom clock (useful for testing cooldown behavior)
    pub fn with_clock<S: AsRef<str>>(
        config: CircuitBreakerConfig,
        providers: &[S],
        clock: C,
    ) -> ConfigResult<Self> {
        Ok(Self {
            breaker: Arc::new(CircuitBreaker::with_clock(config, clock)?),
            keys: Arc::new(ProviderKeyPool::new(providers.iter().map(|p| p.as_ref()))),
        })
    }

    /// The shared circuit breaker
    pub fn breaker(&self) -> &Arc<CircuitBreaker<C>> {
        &self.breaker
    }

    /// The shared key pool
    pub fn keys(&self) -> &Arc<ProviderKeyPool> {
        &self.keys
    }

    /// Retry executor for `provider`, gated by this context's breaker
    pub fn executor<P>(
        &self,
        config: RetryConfig,
        classifier: P,
        provider: impl Into<String>,
    ) -> RetryExecutor<P, C> {
        RetryExecutor::for_provider(config, classifier, Arc::clone(&self.breaker), provider)
    }
}

impl Default for ReliabilityContext<SystemClock> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::key_pool::SelectionStrategy;
    use crate::retry::classifiers::AlwaysRetry;

    #[test]
    fn test_contexts_are_isolated() {
        let a = ReliabilityContext::with_defaults();
        let b = ReliabilityContext::with_defaults();

        a.breaker().force_open("openai");
        assert_eq!(a.breaker().state_of("openai"), CircuitState::Open);
        assert_eq!(b.breaker().state_of("openai"), CircuitState::Closed);
    }

    #[test]
    fn test_context_wires_pool_and_breaker() {
        let context = ReliabilityContext::with_defaults();
        context.keys().add_key("anthropic", "sk-a", "primary", 100, true);

        let key = context
            .keys()
            .get_key("anthropic", SelectionStrategy::Priority)
            .expect("key registered");
        assert_eq!(key.name, "primary");
        assert!(context.breaker().can_execute("anthropic"));
    }

    #[tokio::test]
    async fn test_executor_uses_context_breaker() {
        let context = ReliabilityContext::with_defaults();
        context.breaker().force_open("openai");

        let executor = context.executor(RetryConfig::default(), AlwaysRetry, "openai");
        let result: crate::retry::RetryResult<(), std::io::Error> =
            executor.execute(|| async { Ok(()) }).await;

        assert!(matches!(result, Err(crate::retry::RetryError::CircuitOpen { .. })));
    }
}
