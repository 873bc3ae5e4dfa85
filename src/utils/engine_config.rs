// src/utils/engine_config.rs

use log::info;
use std::env;
use std::time::Duration;

use crate::plugins::score_cache::DEFAULT_SCORE_CACHE_SIZE;

pub const DEFAULT_EXTERNAL_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_MAX_BUCKET_SIZE: usize = 500;

/// Runtime knobs for the resolution engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Bucket tasks scored concurrently.
    pub max_concurrent_buckets: usize,
    /// Timeout applied to every ML scorer and CUSTOM function call.
    pub external_call_timeout_ms: u64,
    pub score_cache_size: usize,
    /// Bucket cap for rules that do not set `max_bucket_size`.
    pub default_max_bucket_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_buckets: num_cpus::get().max(1),
            external_call_timeout_ms: DEFAULT_EXTERNAL_TIMEOUT_MS,
            score_cache_size: DEFAULT_SCORE_CACHE_SIZE,
            default_max_bucket_size: DEFAULT_MAX_BUCKET_SIZE,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let config = Self {
            max_concurrent_buckets: lookup("RESOLUTION_MAX_CONCURRENT_BUCKETS")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_concurrent_buckets),
            external_call_timeout_ms: lookup("RESOLUTION_EXTERNAL_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.external_call_timeout_ms),
            score_cache_size: lookup("RESOLUTION_SCORE_CACHE_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.score_cache_size),
            default_max_bucket_size: lookup("RESOLUTION_DEFAULT_MAX_BUCKET_SIZE")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v >= 2)
                .unwrap_or(defaults.default_max_bucket_size),
        };
        info!(
            "Engine config: {} concurrent buckets, {}ms external timeout, score cache {}, default bucket cap {}",
            config.max_concurrent_buckets,
            config.external_call_timeout_ms,
            config.score_cache_size,
            config.default_max_bucket_size
        );
        config
    }

    pub fn external_timeout(&self) -> Duration {
        Duration::from_millis(self.external_call_timeout_ms)
    }
}
