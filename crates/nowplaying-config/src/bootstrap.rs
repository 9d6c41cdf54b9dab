//! Bootstrap configuration - seeds runtime state, then runtime owns it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Audibility selector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudibilityConfig {
    /// `newest` or `oldest`.
    #[serde(default = "AudibilityConfig::default_mixmode")]
    pub mixmode: String,

    /// Deck numbers (1..4) to exclude from selection entirely.
    #[serde(default)]
    pub deckskip: Vec<u8>,

    /// Minimum effective volume considered audible.
    #[serde(default = "AudibilityConfig::default_audible_threshold")]
    pub audible_threshold: f64,
}

impl AudibilityConfig {
    fn default_mixmode() -> String {
        "newest".to_string()
    }

    fn default_audible_threshold() -> f64 {
        0.1
    }
}

impl Default for AudibilityConfig {
    fn default() -> Self {
        Self {
            mixmode: Self::default_mixmode(),
            deckskip: Vec::new(),
            audible_threshold: Self::default_audible_threshold(),
        }
    }
}

/// Background worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "WorkerConfig::default_num_workers")]
    pub num_workers: usize,

    #[serde(default = "WorkerConfig::default_max_concurrent_per_worker")]
    pub max_concurrent_per_worker: usize,

    #[serde(default = "WorkerConfig::default_batch_size")]
    pub batch_size: usize,
}

impl WorkerConfig {
    fn default_num_workers() -> usize {
        2
    }

    fn default_max_concurrent_per_worker() -> usize {
        3
    }

    fn default_batch_size() -> usize {
        10
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: Self::default_num_workers(),
            max_concurrent_per_worker: Self::default_max_concurrent_per_worker(),
            batch_size: Self::default_batch_size(),
        }
    }
}

/// Per-provider rate limit overrides, requests/second. Unlisted providers
/// fall back to the built-in defaults (see `datacache::ratelimit`).
pub type RateOverrides = HashMap<String, f64>;

/// Per-data-type TTL overrides, in seconds. Unlisted data types fall back
/// to the built-in provider-derived defaults (see `datacache::fetch`).
pub type TtlOverrides = HashMap<String, u64>;

/// Bootstrap configuration - seeds runtime objects at construction time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub audibility: AudibilityConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub rate_overrides: RateOverrides,

    #[serde(default)]
    pub ttl_overrides: TtlOverrides,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_defaults() {
        let worker = WorkerConfig::default();
        assert_eq!(worker.num_workers, 2);
        assert_eq!(worker.max_concurrent_per_worker, 3);
        assert_eq!(worker.batch_size, 10);
    }

    #[test]
    fn audibility_defaults() {
        let audibility = AudibilityConfig::default();
        assert_eq!(audibility.mixmode, "newest");
        assert!(audibility.deckskip.is_empty());
        assert_eq!(audibility.audible_threshold, 0.1);
    }
}
