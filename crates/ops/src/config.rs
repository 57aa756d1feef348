//! Orchestration settings, read once from `SKIFF_*` environment variables.

use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpsConfig {
    pub start: RetryPolicy,
    pub stop: RetryPolicy,
    pub delete: RetryPolicy,
    /// Quiet window for debounced operations (delete, pipeline switch).
    pub debounce: Duration,
}

impl Default for OpsConfig {
    fn default() -> Self {
        let interval = Duration::from_millis(2000);
        Self {
            start: RetryPolicy::fixed(10, interval),
            stop: RetryPolicy::fixed(5, interval),
            delete: RetryPolicy::fixed(5, interval),
            debounce: Duration::from_millis(1000),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<u64>().ok())
}

impl OpsConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_u64)
    }

    /// Build from an arbitrary lookup; missing or unparsable values keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<u64>) -> Self {
        let d = Self::default();
        let interval = lookup("SKIFF_POLL_INTERVAL_MS").map(Duration::from_millis).unwrap_or(d.stop.interval);
        let retries = |name: &str, fallback: u32| lookup(name).and_then(|v| u32::try_from(v).ok()).unwrap_or(fallback);
        Self {
            start: RetryPolicy::fixed(retries("SKIFF_START_RETRIES", d.start.max_retries), interval),
            stop: RetryPolicy::fixed(retries("SKIFF_STOP_RETRIES", d.stop.max_retries), interval),
            delete: RetryPolicy::fixed(retries("SKIFF_DELETE_RETRIES", d.delete.max_retries), interval),
            debounce: lookup("SKIFF_DEBOUNCE_MS").map(Duration::from_millis).unwrap_or(d.debounce),
        }
    }
}
