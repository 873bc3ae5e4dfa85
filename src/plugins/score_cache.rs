// src/plugins/score_cache.rs
use log::{debug, info};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::core::AttributeValue;

pub const DEFAULT_SCORE_CACHE_SIZE: usize = 20000;

/// LRU cache of external scorer results, keyed by scorer, attribute and the
/// unordered pair of compared values.
pub struct ScoreCacheService {
    cache: LruCache<String, f64>,
    pub hits: usize,
    pub misses: usize,
}

impl ScoreCacheService {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        info!("Initializing ScoreCacheService with cache size: {}", capacity);
        Self {
            cache: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    /// Order-insensitive key: (a, b) and (b, a) share an entry.
    pub fn get_pair_key(scorer: &str, attribute: &str, a: &AttributeValue, b: &AttributeValue) -> String {
        let (ka, kb) = (a.dedup_key(), b.dedup_key());
        if ka <= kb {
            format!("{}:{}:{}:{}", scorer, attribute, ka, kb)
        } else {
            format!("{}:{}:{}:{}", scorer, attribute, kb, ka)
        }
    }

    pub fn get(&mut self, key: &str) -> Option<f64> {
        match self.cache.get(key) {
            Some(score) => {
                self.hits += 1;
                if self.hits % 1000 == 0 {
                    debug!(
                        "ScoreCacheService stats - hits: {}, misses: {}, hit rate: {:.2}%",
                        self.hits,
                        self.misses,
                        (self.hits as f64 / (self.hits + self.misses) as f64) * 100.0
                    );
                }
                Some(*score)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn put(&mut self, key: String, score: f64) {
        self.cache.put(key, score);
    }

    pub fn get_stats(&self) -> (usize, usize) {
        (self.hits, self.misses)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

pub type SharedScoreCache = Arc<Mutex<ScoreCacheService>>;

pub fn create_shared_cache(capacity: usize) -> SharedScoreCache {
    Arc::new(Mutex::new(ScoreCacheService::new(capacity)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_key_is_order_insensitive() {
        let a = AttributeValue::text("Acme");
        let b = AttributeValue::text("ACME Corp");
        assert_eq!(
            ScoreCacheService::get_pair_key("ml", "name", &a, &b),
            ScoreCacheService::get_pair_key("ml", "name", &b, &a)
        );
    }

    #[test]
    fn test_hits_and_misses_counted() {
        let mut cache = ScoreCacheService::new(2);
        assert!(cache.get("k").is_none());
        cache.put("k".to_string(), 0.7);
        assert_eq!(cache.get("k"), Some(0.7));
        assert_eq!(cache.get_stats(), (1, 1));
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = ScoreCacheService::new(1);
        cache.put("a".to_string(), 0.1);
        cache.put("b".to_string(), 0.2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("a").is_none());
    }
}
