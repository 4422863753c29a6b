//! Provider reliability layer for Quillforge content generation.
//!
//! Everything between "we want to call an LLM provider" and "the HTTP
//! request actually goes out" lives here:
//!
//! - [`circuit_breaker`]: per-provider circuit breakers that shed load from
//!   failing providers and probe for recovery after a cooldown
//! - [`retry`]: exponential-backoff retry with jitter, coupled to the
//!   breaker so open circuits block calls before the first attempt
//! - [`key_pool`]: multi-key credential pools with round-robin, random,
//!   and priority selection
//! - [`context`]: the dependency-injected bundle wiring the above together
//! - [`env`]: one-shot credential bootstrap from environment variables
//!
//! Construct a [`ReliabilityContext`] at startup and share it by `Arc`;
//! nothing in this crate uses global state.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod circuit_breaker;
pub mod clock;
pub mod context;
pub mod env;
pub mod key_pool;
pub mod retry;

// Re-export commonly used types for convenience
// ------------------------
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitState,
    CircuitStatus, ConfigError, ConfigResult,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use context::ReliabilityContext;
pub use env::load_keys_from_env;
pub use key_pool::{
    PoolStatus, ProviderKeyPool, SelectedKey, SelectionStrategy, DEFAULT_PROVIDERS,
};
pub use retry::{
    retry_call, retry_provider_call, ErrorClassifier, RetryConfig, RetryConfigBuilder,
    RetryError, RetryExecutor, RetryResult,
};
