//! Cache of final ranked result lists, keyed by canonical query text and
//! the caller's agency/state scope.

use std::{sync::Arc, time::Duration};

use crate::{
    bounded_cache::{BoundedCache, CacheStats, SweepHandle},
    config::CacheSettings,
    types::{NormalizedQuery, RetrievalResult, SearchParams},
};

const ALL_SCOPES: &str = "all";

#[derive(Debug)]
pub struct ResultCache {
    inner: Arc<BoundedCache<Vec<RetrievalResult>>>,
}

impl ResultCache {
    pub fn new(settings: &CacheSettings) -> Self {
        let inner = BoundedCache::from_settings("query-results", settings)
            .with_weigher(|results: &Vec<RetrievalResult>| {
                results
                    .iter()
                    .map(|r| {
                        r.id.len()
                            + r.protocol_number.len()
                            + r.protocol_title.len()
                            + r.section.as_ref().map_or(0, String::len)
                            + r.content.len()
                    })
                    .sum()
            });
        Self {
            inner: Arc::new(inner),
        }
    }

    /// `"<normalized query>:<agency or all>:<state or all>"`. Lookups are
    /// exact; there is no fuzzy matching between keys.
    pub fn key(params: &SearchParams, query: &NormalizedQuery) -> String {
        let agency = params
            .agency_id
            .map_or_else(|| ALL_SCOPES.to_string(), |id| id.to_string());
        let state = params
            .state_code
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map_or_else(|| ALL_SCOPES.to_string(), str::to_ascii_uppercase);
        format!("{}:{agency}:{state}", query.normalized)
    }

    pub fn get(
        &self,
        params: &SearchParams,
        query: &NormalizedQuery,
    ) -> Option<Vec<RetrievalResult>> {
        self.inner.get(&Self::key(params, query))
    }

    pub fn set(
        &self,
        params: &SearchParams,
        query: &NormalizedQuery,
        results: Vec<RetrievalResult>,
    ) {
        self.inner.set(Self::key(params, query), results);
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }

    /// Purge expired lists in the background every `every`. Requires a
    /// Tokio runtime.
    pub fn spawn_sweeper(&self, every: Duration) -> SweepHandle {
        self.inner.spawn_sweeper(every)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;

    fn query(text: &str) -> NormalizedQuery {
        NormalizedQuery {
            original: text.to_string(),
            normalized: text.to_string(),
            ..NormalizedQuery::default()
        }
    }

    fn results(ids: &[&str]) -> Vec<RetrievalResult> {
        ids.iter()
            .map(|id| RetrievalResult {
                id: id.to_string(),
                protocol_number: "1".into(),
                protocol_title: "t".into(),
                section: None,
                content: "c".into(),
                similarity: 0.5,
                reranked_score: None,
                image_urls: None,
                metadata: Map::new(),
            })
            .collect()
    }

    #[test]
    fn key_is_scope_qualified() {
        let q = query("epinephrine dose");
        let unscoped = SearchParams::new("epi dose");
        let scoped = SearchParams {
            agency_id: Some(12),
            state_code: Some("ca".into()),
            ..SearchParams::new("epi dose")
        };

        assert_eq!(ResultCache::key(&unscoped, &q), "epinephrine dose:all:all");
        assert_eq!(ResultCache::key(&scoped, &q), "epinephrine dose:12:CA");
    }

    #[test]
    fn same_text_different_scope_is_cached_separately() {
        let cache = ResultCache::new(&CacheSettings::new(10, 60_000));
        let q = query("chest pain");
        let ca = SearchParams {
            state_code: Some("CA".into()),
            ..SearchParams::new("chest pain")
        };
        let tx = SearchParams {
            state_code: Some("TX".into()),
            ..SearchParams::new("chest pain")
        };

        cache.set(&ca, &q, results(&["ca-1"]));
        assert!(cache.get(&tx, &q).is_none());
        assert_eq!(cache.get(&ca, &q).unwrap()[0].id, "ca-1");
    }

    #[test]
    fn capacity_is_enforced() {
        let cache = ResultCache::new(&CacheSettings::new(2, 60_000));
        let params = SearchParams::new("x");
        for text in ["a", "b", "c"] {
            cache.set(&params, &query(text), results(&[text]));
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&params, &query("a")).is_none());
        assert!(cache.stats().approx_bytes > 0);
    }

    #[tokio::test]
    async fn sweeper_purges_expired_lists() {
        let cache = ResultCache::new(&CacheSettings::new(10, 50));
        let params = SearchParams::new("x");
        cache.set(&params, &query("a"), results(&["a"]));

        let _sweeper = cache.spawn_sweeper(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(cache.is_empty());
    }
}
