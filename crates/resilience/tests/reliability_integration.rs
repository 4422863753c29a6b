//! Integration tests for the provider reliability layer
//!
//! Exercises the circuit breaker, retry engine, and key pool together the
//! way the generation pipeline uses them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quillforge_resilience::retry::classifiers::PredicateClassifier;
use quillforge_resilience::{
    load_keys_from_env, retry_provider_call, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    MockClock, ProviderKeyPool, ReliabilityContext, RetryConfig, RetryError, RetryResult,
    SelectionStrategy,
};

/// Custom error type for testing
#[derive(Debug, Clone)]
struct ProviderError {
    message: String,
    retryable: bool,
}

impl ProviderError {
    fn transient(message: &str) -> Self {
        Self { message: message.to_string(), retryable: true }
    }

    fn fatal(message: &str) -> Self {
        Self { message: message.to_string(), retryable: false }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProviderError {}

fn classifier() -> PredicateClassifier<fn(&ProviderError) -> bool> {
    PredicateClassifier::new(|e: &ProviderError| e.retryable)
}

/// Validates the full breaker lifecycle against a deterministic clock.
///
/// A provider that fails repeatedly must stop receiving traffic, then be
/// probed after the cooldown, then resume normal service once enough
/// probes succeed.
///
/// # Test Steps
/// 1. Configure threshold 2, cooldown 60s, 3 half-open probes
/// 2. First failure leaves the circuit CLOSED
/// 3. Second failure opens it and blocks execution
/// 4. Advancing the clock past the cooldown re-admits traffic (HALF_OPEN)
/// 5. Three recorded successes close the circuit with counters reset
#[tokio::test(flavor = "multi_thread")]
async fn test_breaker_open_cooldown_recover_cycle() {
    let clock = MockClock::new();
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(2)
        .cooldown(Duration::from_secs(60))
        .half_open_max_calls(3)
        .build()
        .expect("valid config");
    let breaker = CircuitBreaker::with_clock(config, clock.clone()).expect("valid config");

    breaker.record_failure("anthropic", "timeout");
    assert_eq!(breaker.state_of("anthropic"), CircuitState::Closed);
    assert!(breaker.can_execute("anthropic"));

    breaker.record_failure("anthropic", "timeout");
    assert_eq!(breaker.state_of("anthropic"), CircuitState::Open);
    assert!(!breaker.can_execute("anthropic"));

    // Not cooled down yet
    clock.advance_secs(59);
    assert!(!breaker.can_execute("anthropic"));

    clock.advance_secs(2);
    assert!(breaker.can_execute("anthropic"));
    assert_eq!(breaker.state_of("anthropic"), CircuitState::HalfOpen);

    breaker.record_success("anthropic");
    breaker.record_success("anthropic");
    assert_eq!(breaker.state_of("anthropic"), CircuitState::HalfOpen);

    breaker.record_success("anthropic");
    assert_eq!(breaker.state_of("anthropic"), CircuitState::Closed);

    let status = breaker.status("anthropic");
    assert_eq!(status.consecutive_failures, 0);
    assert!(status.can_execute);
}

/// Validates that a failed half-open probe immediately reopens the circuit.
///
/// # Test Steps
/// 1. Open the circuit, advance past the cooldown so a probe is admitted
/// 2. Record one probe failure
/// 3. Circuit is OPEN again and blocking, with a fresh cooldown window
#[tokio::test(flavor = "multi_thread")]
async fn test_failed_probe_reopens_circuit() {
    let clock = MockClock::new();
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(1)
        .cooldown(Duration::from_secs(30))
        .build()
        .expect("valid config");
    let breaker = CircuitBreaker::with_clock(config, clock.clone()).expect("valid config");

    breaker.record_failure("openai", "http_503");
    assert_eq!(breaker.state_of("openai"), CircuitState::Open);

    clock.advance_secs(31);
    assert!(breaker.can_execute("openai"));
    assert_eq!(breaker.state_of("openai"), CircuitState::HalfOpen);

    breaker.record_failure("openai", "http_503");
    assert_eq!(breaker.state_of("openai"), CircuitState::Open);
    assert!(!breaker.can_execute("openai"));

    // The reopen stamped a new failure time, so the old cooldown no longer
    // applies
    clock.advance_secs(29);
    assert!(!breaker.can_execute("openai"));
    clock.advance_secs(2);
    assert!(breaker.can_execute("openai"));
}

/// Validates the retry engine recovering from transient provider failures
/// while keeping the breaker informed of every outcome.
///
/// # Test Steps
/// 1. Fail twice with transient errors, succeed on the third call
/// 2. Verify the result and the call count
/// 3. Breaker is CLOSED with zero consecutive failures after the success
#[tokio::test(flavor = "multi_thread")]
async fn test_retry_recovers_and_breaker_stays_closed() {
    let breaker = Arc::new(CircuitBreaker::with_defaults());
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = Arc::clone(&calls);

    let config = RetryConfig::builder()
        .max_attempts(4)
        .base_delay(Duration::from_millis(5))
        .max_delay(Duration::from_millis(20))
        .no_jitter()
        .build()
        .expect("valid config");

    let result = retry_provider_call(config, classifier(), Arc::clone(&breaker), "openai", || {
        let calls = Arc::clone(&calls_clone);
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProviderError::transient("rate limited"))
            } else {
                Ok("generated text")
            }
        }
    })
    .await;

    assert_eq!(result.expect("should recover"), "generated text");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let status = breaker.status("openai");
    assert_eq!(status.state, CircuitState::Closed);
    assert_eq!(status.consecutive_failures, 0);
}

/// Validates that persistent failures exhaust the retry budget, trip the
/// breaker, and that subsequent calls are blocked without running at all.
///
/// # Test Steps
/// 1. Retry budget of 3 against a threshold-3 breaker; every call fails
/// 2. First run makes exactly 3 calls and surfaces AttemptsExhausted
/// 3. The breaker is now OPEN
/// 4. A second run makes zero calls and surfaces CircuitOpen
#[tokio::test(flavor = "multi_thread")]
async fn test_exhaustion_trips_breaker_and_blocks_next_call() {
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(3)
        .cooldown(Duration::from_secs(60))
        .build()
        .expect("valid config");
    let breaker = Arc::new(CircuitBreaker::new(config).expect("valid config"));

    let retry = RetryConfig::builder()
        .max_attempts(3)
        .base_delay(Duration::from_millis(5))
        .no_jitter()
        .build()
        .expect("valid config");

    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = Arc::clone(&calls);
    let result: RetryResult<(), _> = retry_provider_call(
        retry.clone(),
        classifier(),
        Arc::clone(&breaker),
        "anthropic",
        || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::transient("overloaded"))
            }
        },
    )
    .await;

    assert!(matches!(result, Err(RetryError::AttemptsExhausted { attempts: 3, .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(breaker.state_of("anthropic"), CircuitState::Open);

    let second_calls = Arc::new(AtomicU32::new(0));
    let second_calls_clone = Arc::clone(&second_calls);
    let blocked: RetryResult<(), ProviderError> = retry_provider_call(
        retry,
        classifier(),
        Arc::clone(&breaker),
        "anthropic",
        || {
            let calls = Arc::clone(&second_calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
    )
    .await;

    assert!(matches!(blocked, Err(RetryError::CircuitOpen { .. })));
    assert_eq!(second_calls.load(Ordering::SeqCst), 0);
}

/// Validates that a non-retryable error fails immediately but still counts
/// against the provider's circuit.
///
/// # Test Steps
/// 1. Fail once with a fatal error under a generous retry budget
/// 2. Exactly one call is made and NonRetryable is surfaced
/// 3. The breaker recorded the failure
#[tokio::test(flavor = "multi_thread")]
async fn test_fatal_error_fails_fast_but_counts() {
    let breaker = Arc::new(CircuitBreaker::with_defaults());
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = Arc::clone(&calls);

    let result: RetryResult<(), _> = retry_provider_call(
        RetryConfig::conservative(),
        classifier(),
        Arc::clone(&breaker),
        "openai",
        || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::fatal("invalid api key"))
            }
        },
    )
    .await;

    assert!(matches!(result, Err(RetryError::NonRetryable { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(breaker.status("openai").consecutive_failures, 1);
}

/// Validates that one provider tripping its circuit never affects another.
///
/// # Test Steps
/// 1. Drive "openai" past the failure threshold
/// 2. "anthropic" remains CLOSED and executable throughout
#[tokio::test(flavor = "multi_thread")]
async fn test_provider_isolation() {
    let config =
        CircuitBreakerConfig::builder().failure_threshold(2).build().expect("valid config");
    let breaker = CircuitBreaker::new(config).expect("valid config");

    breaker.record_failure("openai", "timeout");
    breaker.record_failure("openai", "timeout");

    assert_eq!(breaker.state_of("openai"), CircuitState::Open);
    assert_eq!(breaker.state_of("anthropic"), CircuitState::Closed);
    assert!(breaker.can_execute("anthropic"));
}

/// Validates round-robin key rotation across a multi-key pool, including
/// rotation after a key is disabled mid-stream.
///
/// # Test Steps
/// 1. Register three keys and draw six times: each key serves twice
/// 2. Disable one key and draw again: only the remaining two are served
/// 3. Re-enabled keys keep their accumulated request counts
#[tokio::test(flavor = "multi_thread")]
async fn test_round_robin_rotation_with_disable() {
    let pool = ProviderKeyPool::new(["anthropic"]);
    pool.add_key("anthropic", "sk-a", "primary", 100, true);
    pool.add_key("anthropic", "sk-b", "key_2", 90, true);
    pool.add_key("anthropic", "sk-c", "key_3", 80, true);

    let mut served: Vec<String> = Vec::new();
    for _ in 0..6 {
        let key = pool.get_key("anthropic", SelectionStrategy::RoundRobin).expect("keys exist");
        served.push(key.name);
    }
    for name in ["primary", "key_2", "key_3"] {
        assert_eq!(served.iter().filter(|n| n.as_str() == name).count(), 2);
    }

    pool.disable_key("anthropic", "key_2");
    for _ in 0..4 {
        let key = pool.get_key("anthropic", SelectionStrategy::RoundRobin).expect("keys exist");
        assert_ne!(key.name, "key_2");
    }

    pool.enable_key("anthropic", "key_2");
    let status = pool.pool_status("anthropic").expect("known provider");
    let key_2 = status.keys.iter().find(|k| k.name == "key_2").expect("key present");
    assert_eq!(key_2.request_count, 2);
}

/// Validates the environment bootstrap wiring through a full context: keys
/// loaded from variables are immediately selectable by priority.
///
/// # Test Steps
/// 1. Set primary and secondary variables for a dedicated fake provider
/// 2. Load them into a pool and select by priority
/// 3. The primary key wins; the secondary serves when primary is disabled
#[tokio::test(flavor = "multi_thread")]
async fn test_env_bootstrap_priority_selection() {
    std::env::set_var("MERIDIAN_API_KEY", "sk-primary");
    std::env::set_var("MERIDIAN_API_KEY_2", "sk-backup");

    let pool = ProviderKeyPool::new(["meridian"]);
    let registered = load_keys_from_env(&pool, &["meridian"]);
    assert_eq!(registered, 2);

    let key = pool.get_key("meridian", SelectionStrategy::Priority).expect("keys loaded");
    assert_eq!(key.name, "primary");
    assert_eq!(key.key, "sk-primary");

    pool.disable_key("meridian", "primary");
    let key = pool.get_key("meridian", SelectionStrategy::Priority).expect("backup enabled");
    assert_eq!(key.name, "key_2");
    assert_eq!(key.key, "sk-backup");
}

/// Validates the context as the single wiring point: its executor consults
/// the shared breaker, and its pool serves keys for the same provider.
///
/// # Test Steps
/// 1. Build a default context and register a key
/// 2. Run a failing-then-succeeding operation through the context executor
/// 3. The shared breaker observed the outcomes
#[tokio::test(flavor = "multi_thread")]
async fn test_context_end_to_end() {
    let context = ReliabilityContext::with_defaults();
    context.keys().add_key("openai", "sk-live", "primary", 100, true);

    let key = context.keys().get_key("openai", SelectionStrategy::Priority).expect("registered");
    assert_eq!(key.key, "sk-live");

    let config = RetryConfig::builder()
        .max_attempts(2)
        .base_delay(Duration::from_millis(5))
        .no_jitter()
        .build()
        .expect("valid config");
    let executor = context.executor(config, classifier(), "openai");

    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = Arc::clone(&calls);
    let result = executor
        .execute(|| {
            let calls = Arc::clone(&calls_clone);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ProviderError::transient("hiccup"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

    assert_eq!(result.expect("recovers on retry"), "done");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(context.breaker().status("openai").consecutive_failures, 0);
}
