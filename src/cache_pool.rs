//! The standalone caches that sit beside the result cache: a search
//! fallback, generated answers and per-key rate-limit counters.

use std::sync::Arc;

use crate::{
    bounded_cache::{BoundedCache, CacheStats, SweepHandle},
    config::PolicyConfig,
    types::RetrievalResult,
};

#[derive(Debug, Clone)]
pub struct CachePool {
    pub search_fallback: Arc<BoundedCache<Vec<RetrievalResult>>>,
    pub ai_response: Arc<BoundedCache<String>>,
    pub rate_limit: Arc<BoundedCache<u64>>,
}

impl CachePool {
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            search_fallback: Arc::new(BoundedCache::from_settings(
                "search-fallback",
                &config.search_fallback_cache,
            )),
            ai_response: Arc::new(
                BoundedCache::<String>::from_settings(
                    "ai-response",
                    &config.ai_response_cache,
                )
                .with_weigher(String::len),
            ),
            rate_limit: Arc::new(BoundedCache::from_settings(
                "rate-limit",
                &config.rate_limit_cache,
            )),
        }
    }

    /// Count one request against `key` and return the count inside the
    /// current window. The window opens at the first request and lasts
    /// for the rate-limit TTL.
    pub fn count_request(&self, key: &str) -> u64 {
        self.rate_limit.upsert(key, 1, |n| *n += 1)
    }

    /// Start one sweeper per cache. Requires a Tokio runtime.
    pub fn spawn_sweepers(
        &self,
        every: std::time::Duration,
    ) -> Vec<SweepHandle> {
        vec![
            self.search_fallback.spawn_sweeper(every),
            self.ai_response.spawn_sweeper(every),
            self.rate_limit.spawn_sweeper(every),
        ]
    }

    pub fn stats(&self) -> Vec<CacheStats> {
        vec![
            self.search_fallback.stats(),
            self.ai_response.stats(),
            self.rate_limit.stats(),
        ]
    }

    pub fn clear(&self) {
        self.search_fallback.clear();
        self.ai_response.clear();
        self.rate_limit.clear();
    }
}
