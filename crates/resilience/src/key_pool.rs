//! Provider API key pool
//!
//! Holds a set of interchangeable credentials per provider and picks one per
//! outbound call for load distribution. This is explicitly *not* a failover
//! mechanism: the pool knows nothing about the circuit breaker, and a
//! disabled key stays out of rotation until manually re-enabled.

use std::fmt;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

/// Default provider identifiers the pipeline talks to
pub const DEFAULT_PROVIDERS: &[&str] = &["anthropic", "openai"];

/// How `get_key` picks among a provider's enabled keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Rotate through the enabled keys in pool order
    #[default]
    RoundRobin,
    /// Uniformly random enabled key
    Random,
    /// Always the highest-priority enabled key
    Priority,
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionStrategy::RoundRobin => write!(f, "round_robin"),
            SelectionStrategy::Random => write!(f, "random"),
            SelectionStrategy::Priority => write!(f, "priority"),
        }
    }
}

/// One registered API credential
#[derive(Debug, Clone)]
struct ProviderKey {
    key: String,
    name: String,
    priority: i32,
    enabled: bool,
    request_count: u64,
}

/// Credential handed to a caller by `get_key`
///
/// Deliberately does not implement `Serialize` or `Display`; the raw
/// credential should not wander into logs or status payloads.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub name: String,
    pub key: String,
}

/// Per-key observability view (credential omitted)
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    pub request_count: u64,
}

/// Per-provider observability view
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub provider: String,
    pub total_keys: usize,
    pub enabled_keys: usize,
    pub keys: Vec<KeyStatus>,
}

#[derive(Debug, Default)]
struct KeyPool {
    /// Kept sorted descending by priority; the sort is stable, so
    /// equal-priority keys retain insertion order.
    keys: Vec<ProviderKey>,
    /// Round-robin cursor over the *filtered enabled list* at call time.
    cursor: usize,
}

/// Prioritized, enable/disable-able credential pool keyed by provider
///
/// The set of known providers is fixed at construction; registrations for
/// unknown providers are logged and dropped rather than creating pools
/// implicitly.
pub struct ProviderKeyPool {
    pools: DashMap<String, Mutex<KeyPool>>,
}

impl fmt::Debug for ProviderKeyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderKeyPool").field("providers", &self.pools.len()).finish()
    }
}

impl ProviderKeyPool {
    /// Pool for the given provider identifiers
    pub fn new<I, S>(providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pools = DashMap::new();
        for provider in providers {
            pools.insert(provider.into(), Mutex::new(KeyPool::default()));
        }
        Self { pools }
    }

    /// Pool for [`DEFAULT_PROVIDERS`]
    pub fn with_default_providers() -> Self {
        Self::new(DEFAULT_PROVIDERS.iter().copied())
    }

    /// Provider identifiers this pool was built with
    pub fn providers(&self) -> Vec<String> {
        self.pools.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Register a credential for `provider`.
    ///
    /// Re-sorts the provider's list descending by priority (stable). Logs
    /// and no-ops when the provider is unknown.
    pub fn add_key(
        &self,
        provider: &str,
        key: impl Into<String>,
        name: impl Into<String>,
        priority: i32,
        enabled: bool,
    ) {
        let Some(entry) = self.pools.get(provider) else {
            warn!(provider, "unknown provider, dropping key registration");
            return;
        };

        let name = name.into();
        let mut pool = entry.lock();
        pool.keys.push(ProviderKey {
            key: key.into(),
            name: name.clone(),
            priority,
            enabled,
            request_count: 0,
        });
        pool.keys.sort_by(|a, b| b.priority.cmp(&a.priority));
        debug!(provider, name, priority, enabled, "registered provider key");
    }

    /// Pick an enabled key for `provider` using `strategy`.
    ///
    /// Returns `None` when the provider is unknown or has no enabled keys —
    /// the "what to do without a key" decision belongs to the caller. Every
    /// successful selection increments the key's request count.
    pub fn get_key(&self, provider: &str, strategy: SelectionStrategy) -> Option<SelectedKey> {
        let Some(entry) = self.pools.get(provider) else {
            warn!(provider, "unknown provider, no key available");
            return None;
        };

        let mut pool = entry.lock();

        let enabled: Vec<usize> = pool
            .keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.enabled)
            .map(|(i, _)| i)
            .collect();
        if enabled.is_empty() {
            debug!(provider, "no enabled keys in pool");
            return None;
        }

        let index = match strategy {
            // List is sorted descending by priority, so the first enabled
            // entry is the highest-priority one.
            SelectionStrategy::Priority => enabled[0],
            SelectionStrategy::Random => enabled[rand::thread_rng().gen_range(0..enabled.len())],
            SelectionStrategy::RoundRobin => {
                let slot = pool.cursor % enabled.len();
                pool.cursor = (pool.cursor + 1) % enabled.len();
                enabled[slot]
            }
        };

        let selected = &mut pool.keys[index];
        selected.request_count += 1;
        Some(SelectedKey { name: selected.name.clone(), key: selected.key.clone() })
    }

    /// Exclude a named key from selection, keeping it in the pool.
    pub fn disable_key(&self, provider: &str, name: &str) {
        self.set_enabled(provider, name, false);
    }

    /// Restore a named key's eligibility; its request count is untouched.
    pub fn enable_key(&self, provider: &str, name: &str) {
        self.set_enabled(provider, name, true);
    }

    fn set_enabled(&self, provider: &str, name: &str, enabled: bool) {
        let Some(entry) = self.pools.get(provider) else {
            warn!(provider, name, "unknown provider, cannot toggle key");
            return;
        };

        let mut pool = entry.lock();
        match pool.keys.iter_mut().find(|k| k.name == name) {
            Some(key) => {
                key.enabled = enabled;
                debug!(provider, name, enabled, "toggled provider key");
            }
            None => warn!(provider, name, "no such key in pool"),
        }
    }

    /// Observability view of one provider's pool.
    pub fn pool_status(&self, provider: &str) -> Option<PoolStatus> {
        let entry = self.pools.get(provider)?;
        let pool = entry.lock();
        Some(Self::snapshot(provider, &pool))
    }

    /// Observability view of every provider's pool.
    pub fn all_statuses(&self) -> Vec<PoolStatus> {
        self.pools
            .iter()
            .map(|entry| {
                let pool = entry.value().lock();
                Self::snapshot(entry.key(), &pool)
            })
            .collect()
    }

    fn snapshot(provider: &str, pool: &KeyPool) -> PoolStatus {
        PoolStatus {
            provider: provider.to_string(),
            total_keys: pool.keys.len(),
            enabled_keys: pool.keys.iter().filter(|k| k.enabled).count(),
            keys: pool
                .keys
                .iter()
                .map(|k| KeyStatus {
                    name: k.name.clone(),
                    priority: k.priority,
                    enabled: k.enabled,
                    request_count: k.request_count,
                })
                .collect(),
        }
    }
}

impl Default for ProviderKeyPool {
    fn default() -> Self {
        Self::with_default_providers()
    }
}
