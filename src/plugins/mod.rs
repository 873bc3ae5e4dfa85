// src/plugins/mod.rs
//! Named registries for the external ML scorer and CUSTOM merge functions.
//! Every external call runs under the registry's timeout.

pub mod score_cache;

use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ResolutionError, Result};
use crate::matching::comparators::clamp_score;
use crate::models::core::{AttributeValue, Record};
use crate::plugins::score_cache::{create_shared_cache, ScoreCacheService, SharedScoreCache};

/// Opaque similarity model used by ML rules.
#[async_trait]
pub trait ExternalScorer: Send + Sync {
    async fn score(&self, attribute: &str, a: &AttributeValue, b: &AttributeValue) -> anyhow::Result<f64>;
}

/// Externally supplied survivorship function. Returning `Ok(None)` leaves the
/// attribute unresolved.
#[async_trait]
pub trait CustomMergeFunction: Send + Sync {
    async fn resolve(&self, attribute: &str, members: &[Record]) -> anyhow::Result<Option<AttributeValue>>;
}

/// Result of one external scoring call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalScore {
    pub score: f64,
    pub warning: Option<String>,
}

pub struct PluginRegistry {
    scorers: HashMap<String, Arc<dyn ExternalScorer>>,
    custom_functions: HashMap<String, Arc<dyn CustomMergeFunction>>,
    timeout: Duration,
    score_cache: Option<SharedScoreCache>,
}

impl PluginRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            scorers: HashMap::new(),
            custom_functions: HashMap::new(),
            timeout,
            score_cache: None,
        }
    }

    /// Enables caching of external scores. A capacity of zero disables it.
    pub fn with_score_cache(mut self, capacity: usize) -> Self {
        self.score_cache = (capacity > 0).then(|| create_shared_cache(capacity));
        self
    }

    pub fn register_scorer(&mut self, name: impl Into<String>, scorer: Arc<dyn ExternalScorer>) {
        self.scorers.insert(name.into(), scorer);
    }

    pub fn register_custom_function(&mut self, name: impl Into<String>, function: Arc<dyn CustomMergeFunction>) {
        self.custom_functions.insert(name.into(), function);
    }

    pub fn has_scorer(&self, name: &str) -> bool {
        self.scorers.contains_key(name)
    }

    pub fn has_custom_function(&self, name: &str) -> bool {
        self.custom_functions.contains_key(name)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn cache_stats(&self) -> Option<(usize, usize)> {
        match &self.score_cache {
            Some(cache) => Some(cache.lock().await.get_stats()),
            None => None,
        }
    }

    /// Scores a value pair with a named external scorer. Failures and timeouts
    /// come back as `ComparisonFailure`; out-of-range scores are clamped and
    /// flagged.
    pub async fn score_external(
        &self,
        name: &str,
        attribute: &str,
        a: &AttributeValue,
        b: &AttributeValue,
    ) -> Result<ExternalScore> {
        let failure = |reason: String| ResolutionError::ComparisonFailure {
            capability: name.to_string(),
            reason,
        };
        let scorer = self
            .scorers
            .get(name)
            .ok_or_else(|| failure("scorer is not registered".to_string()))?;

        let cache_key = ScoreCacheService::get_pair_key(name, attribute, a, b);
        if let Some(cache) = &self.score_cache {
            if let Some(score) = cache.lock().await.get(&cache_key) {
                return Ok(ExternalScore { score, warning: None });
            }
        }

        let raw = match tokio::time::timeout(self.timeout, scorer.score(attribute, a, b)).await {
            Ok(Ok(score)) => score,
            Ok(Err(e)) => return Err(failure(format!("{:#}", e))),
            Err(_) => return Err(failure(format!("timed out after {}ms", self.timeout.as_millis()))),
        };

        let score = clamp_score(raw);
        let warning = if score != raw {
            warn!("Scorer '{}' returned out-of-range score {} for '{}'; clamped to {}", name, raw, attribute, score);
            Some(format!("scorer '{}' returned {}; clamped to {}", name, raw, score))
        } else {
            None
        };

        if let Some(cache) = &self.score_cache {
            cache.lock().await.put(cache_key, score);
        }
        debug!("Scorer '{}' scored '{}' at {:.3}", name, attribute, score);
        Ok(ExternalScore { score, warning })
    }

    /// Runs a named CUSTOM merge function under the registry timeout.
    pub async fn run_custom(&self, name: &str, attribute: &str, members: &[Record]) -> Result<Option<AttributeValue>> {
        let failure = |reason: String| ResolutionError::ComparisonFailure {
            capability: name.to_string(),
            reason,
        };
        let function = self
            .custom_functions
            .get(name)
            .ok_or_else(|| failure("custom function is not registered".to_string()))?;

        match tokio::time::timeout(self.timeout, function.resolve(attribute, members)).await {
            Ok(Ok(value)) => Ok(value.filter(|v| !v.is_null())),
            Ok(Err(e)) => Err(failure(format!("{:#}", e))),
            Err(_) => Err(failure(format!("timed out after {}ms", self.timeout.as_millis()))),
        }
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut scorers: Vec<&String> = self.scorers.keys().collect();
        scorers.sort();
        let mut functions: Vec<&String> = self.custom_functions.keys().collect();
        functions.sort();
        f.debug_struct("PluginRegistry")
            .field("scorers", &scorers)
            .field("custom_functions", &functions)
            .field("timeout", &self.timeout)
            .field("score_cache", &self.score_cache.is_some())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a fixed score and counts calls.
    pub struct FixedScorer {
        pub score: f64,
        pub calls: AtomicUsize,
    }

    impl FixedScorer {
        pub fn new(score: f64) -> Self {
            Self {
                score,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ExternalScorer for FixedScorer {
        async fn score(&self, _attribute: &str, _a: &AttributeValue, _b: &AttributeValue) -> anyhow::Result<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.score)
        }
    }

    pub struct FailingScorer;

    #[async_trait]
    impl ExternalScorer for FailingScorer {
        async fn score(&self, _attribute: &str, _a: &AttributeValue, _b: &AttributeValue) -> anyhow::Result<f64> {
            anyhow::bail!("model endpoint unavailable")
        }
    }

    pub struct SlowScorer;

    #[async_trait]
    impl ExternalScorer for SlowScorer {
        async fn score(&self, _attribute: &str, _a: &AttributeValue, _b: &AttributeValue) -> anyhow::Result<f64> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1.0)
        }
    }

    /// Picks the longest text value among members.
    pub struct LongestText;

    #[async_trait]
    impl CustomMergeFunction for LongestText {
        async fn resolve(&self, attribute: &str, members: &[Record]) -> anyhow::Result<Option<AttributeValue>> {
            Ok(members
                .iter()
                .filter_map(|m| m.value(attribute))
                .max_by_key(|v| v.as_text().len())
                .cloned())
        }
    }

    /// Longest text value, returned after a delay.
    pub struct SlowLongestText(pub Duration);

    #[async_trait]
    impl CustomMergeFunction for SlowLongestText {
        async fn resolve(&self, attribute: &str, members: &[Record]) -> anyhow::Result<Option<AttributeValue>> {
            tokio::time::sleep(self.0).await;
            LongestText.resolve(attribute, members).await
        }
    }

    pub struct FailingFunction;

    #[async_trait]
    impl CustomMergeFunction for FailingFunction {
        async fn resolve(&self, _attribute: &str, _members: &[Record]) -> anyhow::Result<Option<AttributeValue>> {
            anyhow::bail!("rules service returned 503")
        }
    }
}
