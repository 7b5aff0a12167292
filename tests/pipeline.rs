use std::{
    collections::HashSet,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use protocol_retrieval::{
    CorpusIndex,
    Error,
    KeywordNormalizer,
    PolicyConfig,
    RetrievalPipeline,
    Result,
    VectorSearch,
    VectorSearchRequest,
    corpus::ProtocolChunk,
    latency::Operation,
    types::{
        Intent,
        ModelTier,
        RetrievalResult,
        SearchOptions,
        SearchParams,
        UserTier,
    },
};
use serde_json::{Map, Value};

/// Backend returning a fixed candidate list, filtered by the request's
/// threshold and limit, and counting calls.
struct FixedBackend {
    candidates: Vec<RetrievalResult>,
    calls: AtomicUsize,
    last: Mutex<Option<VectorSearchRequest>>,
}

impl FixedBackend {
    fn new(candidates: Vec<RetrievalResult>) -> Self {
        Self {
            candidates,
            calls: AtomicUsize::new(0),
            last: Mutex::new(None),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorSearch for FixedBackend {
    async fn search(
        &self,
        request: &VectorSearchRequest,
    ) -> Result<Vec<RetrievalResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(request.clone());
        Ok(self
            .candidates
            .iter()
            .filter(|r| r.similarity >= request.threshold)
            .take(request.limit)
            .cloned()
            .collect())
    }
}

struct FailingBackend;

#[async_trait]
impl VectorSearch for FailingBackend {
    async fn search(
        &self,
        _request: &VectorSearchRequest,
    ) -> Result<Vec<RetrievalResult>> {
        Err(Error::Search("connection refused".into()))
    }
}

fn candidate(i: usize, agency_id: i64) -> RetrievalResult {
    let mut metadata = Map::new();
    metadata.insert("agencyId".into(), Value::from(agency_id));
    RetrievalResult {
        id: format!("chunk-{i}"),
        protocol_number: "1210".to_string(),
        protocol_title: "Allergic Reaction".to_string(),
        section: Some("Treatment".to_string()),
        content: "Epinephrine 0.3 mg IM for anaphylaxis. Repeat every 5 \
                  minutes as needed. Monitor airway and blood pressure \
                  closely during transport to the receiving facility, and \
                  prepare for further airway management."
            .to_string(),
        similarity: 0.9 - 0.02 * i as f64,
        reranked_score: None,
        image_urls: None,
        metadata,
    }
}

/// Twenty candidates in descending similarity; only chunk-3 belongs to
/// agency 12.
fn anaphylaxis_candidates() -> Vec<RetrievalResult> {
    (0..20)
        .map(|i| candidate(i, if i == 3 { 12 } else { 40 }))
        .collect()
}

fn pipeline(backend: Arc<dyn VectorSearch>) -> RetrievalPipeline {
    RetrievalPipeline::with_config(
        backend,
        Arc::new(KeywordNormalizer),
        PolicyConfig::default(),
    )
}

#[tokio::test]
async fn dosing_question_end_to_end() {
    let backend = Arc::new(FixedBackend::new(anaphylaxis_candidates()));
    let p = pipeline(backend.clone());
    let params = SearchParams {
        agency_id: Some(12),
        user_tier: UserTier::Pro,
        ..SearchParams::new("epi dose for anaphylaxis")
    };

    let response = p.search(&params, SearchOptions::default()).await.unwrap();

    let q = &response.normalized_query;
    assert_eq!(q.normalized, "epinephrine dose for anaphylaxis");
    assert_eq!(q.intent, Intent::MedicationDosing);
    assert!(!q.is_complex);

    let request = backend.last.lock().unwrap().clone().unwrap();
    assert_eq!(request.query, "epinephrine dose for anaphylaxis");
    assert_eq!(request.threshold, 0.45);
    assert_eq!(request.limit, 20);
    assert_eq!(request.agency_id, Some(12));

    assert_eq!(response.metrics.similarity_threshold, 0.45);
    assert_eq!(response.results.len(), 5);
    assert_eq!(response.metrics.result_count, 5);
    assert!(!response.metrics.cache_hit);
    assert!(!response.metrics.multi_query);
    assert_eq!(response.suggested_model, ModelTier::Standard);

    // The agency match outweighs a small similarity gap.
    assert_eq!(response.results[0].id, "chunk-3");
    assert_eq!(response.results[0].agency_id(), Some(12));
    for pair in response.results.windows(2) {
        assert!(pair[0].score() >= pair[1].score());
    }

    let again = p.search(&params, SearchOptions::default()).await.unwrap();
    assert!(again.metrics.cache_hit);
    assert_eq!(again.results, response.results);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn limit_override_bypasses_result_cache() {
    let backend = Arc::new(FixedBackend::new(anaphylaxis_candidates()));
    let p = pipeline(backend.clone());
    let narrow = SearchParams {
        limit: Some(2),
        ..SearchParams::new("epi dose for anaphylaxis")
    };

    let response = p.search(&narrow, SearchOptions::default()).await.unwrap();
    assert_eq!(response.results.len(), 2);
    assert_eq!(response.metrics.result_limit, 2);
    assert!(p.cache().is_empty());

    // A later default call still gets the full standard list.
    let default = SearchParams::new("epi dose for anaphylaxis");
    let full = p.search(&default, SearchOptions::default()).await.unwrap();
    assert!(!full.metrics.cache_hit);
    assert_eq!(full.results.len(), 5);

    let narrow_again =
        p.search(&narrow, SearchOptions::default()).await.unwrap();
    assert!(!narrow_again.metrics.cache_hit);
    assert_eq!(narrow_again.results.len(), 2);
    assert_eq!(backend.calls(), 3);
}

#[tokio::test]
async fn state_scope_changes_cache_key() {
    let backend = Arc::new(FixedBackend::new(anaphylaxis_candidates()));
    let p = pipeline(backend.clone());
    let ca = SearchParams {
        state_code: Some("CA".into()),
        ..SearchParams::new("epi dose for anaphylaxis")
    };
    let tx = SearchParams {
        state_code: Some("TX".into()),
        ..SearchParams::new("epi dose for anaphylaxis")
    };

    p.search(&ca, SearchOptions::default()).await.unwrap();
    p.search(&tx, SearchOptions::default()).await.unwrap();
    assert_eq!(backend.calls(), 2);
    assert_eq!(p.cache().len(), 2);
}

#[tokio::test]
async fn backend_failure_surfaces_as_error() {
    let p = pipeline(Arc::new(FailingBackend));

    let single = p
        .search(&SearchParams::new("stroke scale"), SearchOptions::default())
        .await;
    assert!(matches!(single, Err(Error::Search(_))));

    let fused = p.high_accuracy_search(&SearchParams::new("stroke")).await;
    assert!(matches!(fused, Err(Error::AllVariantsFailed { .. })));
}

#[tokio::test]
async fn high_accuracy_fuses_variants() {
    let backend = Arc::new(FixedBackend::new(anaphylaxis_candidates()));
    let p = pipeline(backend.clone());

    let response = p
        .high_accuracy_search(&SearchParams::new("epi dose for anaphylaxis"))
        .await
        .unwrap();

    assert!(response.metrics.multi_query);
    assert_eq!(response.metrics.variants_searched, 3);
    assert_eq!(response.metrics.variants_failed, 0);
    assert_eq!(backend.calls(), 3);

    let request = backend.last.lock().unwrap().clone().unwrap();
    assert!((request.threshold - 0.45 * 0.9).abs() < 1e-12);

    let ids: HashSet<_> = response.results.iter().map(|r| &r.id).collect();
    assert_eq!(ids.len(), response.results.len());
}

#[tokio::test]
async fn monitor_reports_healthy_after_fast_searches() {
    let p = pipeline(Arc::new(FixedBackend::new(anaphylaxis_candidates())));
    for query in ["epi dose for anaphylaxis", "stroke scale", "peds croup"] {
        p.search(&SearchParams::new(query), SearchOptions::default())
            .await
            .unwrap();
    }

    let snapshot = p.monitor().snapshot();
    assert!(snapshot.healthy);
    assert_eq!(snapshot.operations[&Operation::TotalRetrieval].count, 3);
    assert!(p.monitor().is_healthy());
}

#[tokio::test]
async fn corpus_backend_filters_by_state() {
    let chunk = |id: &str, state: &str| ProtocolChunk {
        id: id.to_string(),
        protocol_number: "510".to_string(),
        protocol_title: "Stroke".to_string(),
        section: Some("Assessment".to_string()),
        content: "Perform the stroke scale".to_string(),
        agency_id: None,
        agency_name: None,
        state_code: Some(state.to_string()),
        image_urls: None,
    };
    let corpus = CorpusIndex::new(vec![chunk("ca", "CA"), chunk("tx", "TX")]);
    let p = pipeline(Arc::new(corpus));

    let params = SearchParams {
        state_code: Some("ca".into()),
        ..SearchParams::new("stroke scale")
    };
    let response = p.search(&params, SearchOptions::default()).await.unwrap();

    let ids: Vec<_> = response.results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["ca"]);
    assert!(response.results[0].similarity > 0.35);
}
