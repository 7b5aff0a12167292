//! Data passed between the pipeline stages and handed to callers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One protocol excerpt returned by the search backend.
///
/// Scoring never mutates a shared result; it produces annotated copies
/// via [`RetrievalResult::with_score`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalResult {
    pub id: String,
    pub protocol_number: String,
    pub protocol_title: String,
    #[serde(default)]
    pub section: Option<String>,
    pub content: String,
    /// Backend similarity in [0, 1].
    pub similarity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reranked_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl RetrievalResult {
    /// The score downstream stages sort by: the re-ranked score once
    /// scoring has run, otherwise similarity on the same 0-100 scale.
    pub fn score(&self) -> f64 {
        self.reranked_score.unwrap_or(self.similarity * 100.0)
    }

    pub fn with_score(&self, score: f64) -> Self {
        Self {
            reranked_score: Some(score),
            ..self.clone()
        }
    }

    /// Agency id from metadata, accepting numeric or string encodings.
    pub fn agency_id(&self) -> Option<i64> {
        match self.metadata.get("agencyId")? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn state_code(&self) -> Option<&str> {
        self.metadata.get("stateCode").and_then(Value::as_str)
    }
}

/// Sort results by [`RetrievalResult::score`], highest first. Ties keep
/// their incoming order.
pub fn sort_by_score(results: &mut [RetrievalResult]) {
    results.sort_by(|a, b| {
        b.score()
            .partial_cmp(&a.score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl std::str::FromStr for UserTier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(format!("unknown user tier: {other}")),
        }
    }
}

/// Caller-supplied request. Also seeds the result cache key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    pub query: String,
    #[serde(default)]
    pub agency_id: Option<i64>,
    #[serde(default)]
    pub agency_name: Option<String>,
    #[serde(default)]
    pub state_code: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub user_tier: UserTier,
}

impl SearchParams {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    MedicationDosing,
    ProcedureSteps,
    ContraindicationCheck,
    DifferentialDiagnosis,
    PediatricSpecific,
    #[default]
    General,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MedicationDosing => "medication_dosing",
            Self::ProcedureSteps => "procedure_steps",
            Self::ContraindicationCheck => "contraindication_check",
            Self::DifferentialDiagnosis => "differential_diagnosis",
            Self::PediatricSpecific => "pediatric_specific",
            Self::General => "general",
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the query normalizer, read-only to the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedQuery {
    pub original: String,
    pub normalized: String,
    pub intent: Intent,
    pub is_complex: bool,
    pub is_emergent: bool,
    pub extracted_medications: Vec<String>,
    pub extracted_conditions: Vec<String>,
}

/// Generation model tier suggested to the downstream answer generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Cheaper, faster model.
    Standard,
    /// Higher-accuracy model for complex or safety-sensitive queries.
    Advanced,
}

/// Per-search timing and shape breakdown. Durations are milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub normalization_ms: f64,
    pub search_ms: f64,
    pub rerank_ms: f64,
    pub total_ms: f64,
    pub result_count: usize,
    pub cache_hit: bool,
    pub similarity_threshold: f64,
    pub result_limit: usize,
    pub multi_query: bool,
    pub variants_searched: usize,
    pub variants_failed: usize,
}

/// Optional pipeline behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOptions {
    /// Force multi-query fusion. It is also enabled automatically for
    /// complex queries and differential diagnosis.
    pub multi_query: bool,
    pub advanced_rerank: bool,
    pub context_boost: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            multi_query: false,
            advanced_rerank: true,
            context_boost: true,
        }
    }
}

impl SearchOptions {
    pub fn high_accuracy() -> Self {
        Self {
            multi_query: true,
            advanced_rerank: true,
            context_boost: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub results: Vec<RetrievalResult>,
    pub normalized_query: NormalizedQuery,
    pub metrics: Metrics,
    pub suggested_model: ModelTier,
}
