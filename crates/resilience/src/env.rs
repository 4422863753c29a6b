//! Bootstrap provider credentials from environment variables
//!
//! Convention: `{PROVIDER}_API_KEY` is the primary (highest-priority) key;
//! `{PROVIDER}_API_KEY_2` through `_9` register as additional keys with
//! descending priority. Intended to run once at process startup.

use tracing::{debug, info};

use crate::key_pool::ProviderKeyPool;

/// Priority assigned to `{PROVIDER}_API_KEY`
const PRIMARY_PRIORITY: i32 = 100;
/// Priority decrement per numbered key, so `_2` = 90 … `_9` = 20
const PRIORITY_STEP: i32 = 10;
/// Highest numbered key suffix scanned
const MAX_KEY_SUFFIX: u32 = 9;

/// Register every key found in the environment for `providers`.
///
/// Variable names are the upper-cased provider id plus the suffix
/// convention above; empty values are skipped. Returns the number of keys
/// registered.
pub fn load_keys_from_env(pool: &ProviderKeyPool, providers: &[&str]) -> usize {
    let mut registered = 0;

    for provider in providers {
        let prefix = provider.to_uppercase();

        if let Some(key) = non_empty_var(&format!("{prefix}_API_KEY")) {
            pool.add_key(provider, key, "primary", PRIMARY_PRIORITY, true);
            registered += 1;
        }

        for n in 2..=MAX_KEY_SUFFIX {
            if let Some(key) = non_empty_var(&format!("{prefix}_API_KEY_{n}")) {
                let priority = PRIMARY_PRIORITY - PRIORITY_STEP * (n as i32 - 1);
                pool.add_key(provider, key, format!("key_{n}"), priority, true);
                registered += 1;
            }
        }
    }

    if registered == 0 {
        debug!("no provider keys found in environment");
    } else {
        info!(registered, "provider keys loaded from environment");
    }
    registered
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
