use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::{
    config::PolicyConfig,
    error::{Error, Result},
    fusion::reciprocal_rank_fusion,
    latency::{LatencyMonitor, Operation, Stopwatch},
    normalizer::QueryNormalizer,
    reranker::{self, RerankMode},
    result_cache::ResultCache,
    selector::Selection,
    types::{
        Intent,
        Metrics,
        NormalizedQuery,
        RetrievalResult,
        SearchOptions,
        SearchParams,
        SearchResponse,
    },
};

/// Arguments handed to the search backend for one query string.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorSearchRequest {
    pub query: String,
    pub agency_id: Option<i64>,
    pub agency_name: Option<String>,
    pub state_code: Option<String>,
    pub limit: usize,
    pub threshold: f64,
}

/// Similarity search backend. Implementations may fail; the pipeline
/// never retries and never imposes a deadline on them.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn search(
        &self,
        request: &VectorSearchRequest,
    ) -> Result<Vec<RetrievalResult>>;
}

/// Candidates from the retrieve stage plus how they were obtained.
struct Retrieved {
    results: Vec<RetrievalResult>,
    multi_query: bool,
    variants_searched: usize,
    variants_failed: usize,
}

/// The retrieval pipeline: normalize, check the result cache, search
/// (single query or fused variants), re-rank, boost, trim, cache.
///
/// The cache and latency monitor are shared handles so several pipelines
/// (or tests) can own isolated or common instances.
pub struct RetrievalPipeline {
    backend: Arc<dyn VectorSearch>,
    normalizer: Arc<dyn QueryNormalizer>,
    cache: Arc<ResultCache>,
    monitor: Arc<LatencyMonitor>,
    config: Arc<PolicyConfig>,
}

impl RetrievalPipeline {
    pub fn new(
        backend: Arc<dyn VectorSearch>,
        normalizer: Arc<dyn QueryNormalizer>,
        cache: Arc<ResultCache>,
        monitor: Arc<LatencyMonitor>,
        config: Arc<PolicyConfig>,
    ) -> Self {
        Self {
            backend,
            normalizer,
            cache,
            monitor,
            config,
        }
    }

    /// Build a pipeline with a fresh cache and monitor sized from `config`.
    pub fn with_config(
        backend: Arc<dyn VectorSearch>,
        normalizer: Arc<dyn QueryNormalizer>,
        config: PolicyConfig,
    ) -> Self {
        let cache = Arc::new(ResultCache::new(&config.query_cache));
        let monitor = Arc::new(LatencyMonitor::from_config(&config));
        Self::new(backend, normalizer, cache, monitor, Arc::new(config))
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn monitor(&self) -> &Arc<LatencyMonitor> {
        &self.monitor
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Search with multi-query fusion, advanced re-ranking and context
    /// boosting all forced on.
    pub async fn high_accuracy_search(
        &self,
        params: &SearchParams,
    ) -> Result<SearchResponse> {
        self.search(params, SearchOptions::high_accuracy()).await
    }

    /// Execute the full pipeline for one request.
    ///
    /// 1. Normalize the query and resolve threshold, limit and model
    /// 2. Return the cached list on a hit
    /// 3. Retrieve: one query, or up to N variants fused with RRF
    /// 4. Re-rank, then apply the agency/state boost
    /// 5. Trim to the limit and cache
    ///
    /// A backend failure on the single-query path, or of every variant on
    /// the fused path, is returned as an error. An empty list is not.
    ///
    /// Requests with a limit override or non-default options bypass the
    /// result cache in both directions.
    pub async fn search(
        &self,
        params: &SearchParams,
        options: SearchOptions,
    ) -> Result<SearchResponse> {
        let total = Stopwatch::start();

        // Stage 1: normalization and policy selection
        let stage = Stopwatch::start();
        let normalized = self.normalizer.normalize(&params.query);
        let normalization_ms = stage.elapsed_ms();
        self.monitor.record(Operation::Normalization, normalization_ms);

        let selection = Selection::resolve(
            &self.config,
            &normalized,
            params.user_tier,
            params.limit,
        );
        debug!(
            intent = %normalized.intent,
            threshold = selection.threshold,
            limit = selection.limit,
            "resolved search policy"
        );

        let mut metrics = Metrics {
            normalization_ms,
            similarity_threshold: selection.threshold,
            result_limit: selection.limit,
            ..Metrics::default()
        };

        // Stage 2: result cache. Only default-shaped requests read or write
        // it, since the key carries neither the limit nor the options.
        let cacheable = params.limit.filter(|&n| n > 0).is_none()
            && options == SearchOptions::default();
        if let Some(results) = cacheable
            .then(|| self.cache.get(params, &normalized))
            .flatten()
        {
            metrics.cache_hit = true;
            metrics.result_count = results.len();
            metrics.total_ms = total.elapsed_ms();
            self.monitor.record(Operation::TotalRetrieval, metrics.total_ms);
            debug!(query = %normalized.normalized, "result cache hit");

            return Ok(SearchResponse {
                results,
                normalized_query: normalized,
                metrics,
                suggested_model: selection.model,
            });
        }

        // Stage 3: retrieval
        let stage = Stopwatch::start();
        let use_multi_query = options.multi_query
            || normalized.is_complex
            || normalized.intent == Intent::DifferentialDiagnosis;
        let retrieved = if use_multi_query {
            self.retrieve_fused(params, &normalized, selection.threshold)
                .await?
        } else {
            self.retrieve_single(params, &normalized, selection.threshold)
                .await?
        };
        metrics.search_ms = stage.elapsed_ms();
        self.monitor.record(Operation::VectorSearch, metrics.search_ms);
        metrics.multi_query = retrieved.multi_query;
        metrics.variants_searched = retrieved.variants_searched;
        metrics.variants_failed = retrieved.variants_failed;

        // Stage 4: re-rank and context boost
        let stage = Stopwatch::start();
        let mode = if options.advanced_rerank {
            RerankMode::Advanced
        } else {
            RerankMode::Basic
        };
        let mut ranked =
            reranker::rerank(&retrieved.results, &normalized, mode);
        self.monitor.record(Operation::Rerank, stage.elapsed_ms());

        if options.context_boost
            && (params.agency_id.is_some() || params.state_code.is_some())
        {
            let boost = Stopwatch::start();
            ranked = reranker::apply_context_boost(
                &ranked,
                params.agency_id,
                params.state_code.as_deref(),
            );
            self.monitor.record(Operation::ContextBoost, boost.elapsed_ms());
        }
        metrics.rerank_ms = stage.elapsed_ms();

        // Stage 5: trim and cache
        ranked.truncate(selection.limit);
        if cacheable {
            self.cache.set(params, &normalized, ranked.clone());
        }

        metrics.result_count = ranked.len();
        metrics.total_ms = total.elapsed_ms();
        self.monitor.record(Operation::TotalRetrieval, metrics.total_ms);

        info!(
            query = %normalized.normalized,
            intent = %normalized.intent,
            results = metrics.result_count,
            multi_query = metrics.multi_query,
            total_ms = metrics.total_ms,
            "search complete"
        );

        Ok(SearchResponse {
            results: ranked,
            normalized_query: normalized,
            metrics,
            suggested_model: selection.model,
        })
    }

    fn request(
        &self,
        params: &SearchParams,
        query: String,
        threshold: f64,
    ) -> VectorSearchRequest {
        VectorSearchRequest {
            query,
            agency_id: params.agency_id,
            agency_name: params.agency_name.clone(),
            state_code: params.state_code.clone(),
            limit: self.config.limits.initial_fetch,
            threshold,
        }
    }

    async fn retrieve_single(
        &self,
        params: &SearchParams,
        normalized: &NormalizedQuery,
        threshold: f64,
    ) -> Result<Retrieved> {
        let request =
            self.request(params, normalized.normalized.clone(), threshold);
        let results = self.backend.search(&request).await?;
        debug!(candidates = results.len(), "single-query search returned");

        Ok(Retrieved {
            results,
            multi_query: false,
            variants_searched: 1,
            variants_failed: 0,
        })
    }

    /// Search every variant concurrently with a relaxed threshold and
    /// fuse the lists. A failed variant contributes nothing.
    async fn retrieve_fused(
        &self,
        params: &SearchParams,
        normalized: &NormalizedQuery,
        threshold: f64,
    ) -> Result<Retrieved> {
        let mut variants: Vec<String> = self
            .normalizer
            .variants(&params.query)
            .into_iter()
            .take(self.config.max_query_variants.max(1))
            .collect();
        if variants.is_empty() {
            variants.push(normalized.normalized.clone());
        }

        let relaxed = threshold * self.config.variant_threshold_factor;
        let requests: Vec<VectorSearchRequest> = variants
            .iter()
            .map(|v| self.request(params, v.clone(), relaxed))
            .collect();

        let outcomes =
            join_all(requests.iter().map(|r| self.backend.search(r))).await;

        let mut lists = Vec::with_capacity(outcomes.len());
        let mut failed = 0;
        for (variant, outcome) in variants.iter().zip(outcomes) {
            match outcome {
                Ok(list) => {
                    if !list.is_empty() {
                        lists.push(list);
                    }
                }
                Err(e) => {
                    failed += 1;
                    warn!(
                        variant = %variant,
                        error = %e,
                        "query variant failed, continuing without it"
                    );
                }
            }
        }

        if failed == variants.len() {
            return Err(Error::AllVariantsFailed {
                attempted: variants.len(),
            });
        }

        let results = reciprocal_rank_fusion(
            &lists,
            self.config.rrf_k,
            self.config.limits.initial_fetch,
        );
        debug!(
            variants = variants.len(),
            failed,
            candidates = results.len(),
            "multi-query fusion complete"
        );

        Ok(Retrieved {
            results,
            multi_query: true,
            variants_searched: variants.len(),
            variants_failed: failed,
        })
    }
}

const PREVIEW_CHARS: usize = 160;

fn preview(content: &str) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_CHARS {
        return flat;
    }
    let mut cut: String = flat.chars().take(PREVIEW_CHARS).collect();
    cut.push_str("...");
    cut
}

/// Format a response for human-readable terminal output.
pub fn format_human(response: &SearchResponse) {
    if response.results.is_empty() {
        println!("No results found.");
        return;
    }

    for (i, r) in response.results.iter().enumerate() {
        println!(
            "{:>3}. [{:.2}] {} {}",
            i + 1,
            r.score(),
            r.protocol_number,
            r.protocol_title
        );
        if let Some(section) = &r.section {
            println!("     {section}");
        }
        println!("     {}", preview(&r.content));
    }

    let m = &response.metrics;
    println!(
        "\n{} result(s) in {:.1}ms{} | intent: {} | model: {:?}",
        m.result_count,
        m.total_ms,
        if m.cache_hit { " (cached)" } else { "" },
        response.normalized_query.intent,
        response.suggested_model,
    );
}

/// Format a response as JSON.
pub fn format_json(response: &SearchResponse) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}
