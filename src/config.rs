//! Retrieval policy: latency targets, similarity thresholds, result
//! limits, cache sizing and the static re-rank weight tables.
//!
//! Every field has a default, so a JSON policy file only needs to name
//! the values it overrides:
//!
//! ```
//! use protocol_retrieval::config::PolicyConfig;
//!
//! let config: PolicyConfig =
//!     serde_json::from_str(r#"{ "rrfK": 30.0 }"#).unwrap();
//! assert_eq!(config.rrf_k, 30.0);
//! assert_eq!(config.thresholds.medication, 0.45);
//! ```

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    error::{Error, Result},
    fusion::DEFAULT_RRF_K,
    latency::DEFAULT_WINDOW,
};

/// Environment variable naming a policy file to load.
pub const CONFIG_ENV_VAR: &str = "PROTOCOL_RETRIEVAL_CONFIG";

/// Per-operation latency targets in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LatencyTargets {
    pub embedding: f64,
    pub vector_search: f64,
    pub rerank: f64,
    pub total_retrieval: f64,
}

impl Default for LatencyTargets {
    fn default() -> Self {
        Self {
            embedding: 200.0,
            vector_search: 300.0,
            rerank: 100.0,
            total_retrieval: 1000.0,
        }
    }
}

/// Minimum similarity a candidate needs, by query class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimilarityThresholds {
    pub medication: f64,
    pub procedure: f64,
    pub general: f64,
    pub minimum: f64,
}

impl Default for SimilarityThresholds {
    fn default() -> Self {
        Self {
            medication: 0.45,
            procedure: 0.40,
            general: 0.35,
            minimum: 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResultLimits {
    /// Candidates requested from the backend before re-ranking.
    pub initial_fetch: usize,
    pub standard_return: usize,
    pub complex_return: usize,
}

impl Default for ResultLimits {
    fn default() -> Self {
        Self {
            initial_fetch: 20,
            standard_return: 5,
            complex_return: 8,
        }
    }
}

/// Capacity and expiry of one bounded cache instance.
///
/// In a policy file each cache section is laid over its own preset, so
/// `{ "queryCache": { "maxEntries": 10 } }` keeps the one-hour TTL. An
/// explicit `"ttlMs": null` turns expiry off.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSettings {
    pub max_entries: usize,
    /// `None` means entries never expire.
    pub ttl_ms: Option<u64>,
}

impl CacheSettings {
    pub const QUERY: Self = Self::new(5_000, 60 * 60 * 1000);
    pub const SEARCH_FALLBACK: Self = Self::new(500, 5 * 60 * 1000);
    pub const AI_RESPONSE: Self = Self::new(200, 30 * 60 * 1000);
    pub const RATE_LIMIT: Self = Self::new(10_000, 60 * 1000);

    pub const fn new(max_entries: usize, ttl_ms: u64) -> Self {
        Self {
            max_entries,
            ttl_ms: Some(ttl_ms),
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}

/// The fields a policy file may set on one cache section.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CacheOverride {
    max_entries: Option<usize>,
    /// Outer `None` when absent, `Some(None)` for an explicit null.
    #[serde(deserialize_with = "present")]
    ttl_ms: Option<Option<u64>>,
}

impl CacheOverride {
    fn over(self, base: CacheSettings) -> CacheSettings {
        CacheSettings {
            max_entries: self.max_entries.unwrap_or(base.max_entries),
            ttl_ms: self.ttl_ms.unwrap_or(base.ttl_ms),
        }
    }
}

fn present<'de, D, T>(d: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(d).map(Some)
}

fn overlay<'de, D>(
    d: D,
    base: CacheSettings,
) -> std::result::Result<CacheSettings, D::Error>
where
    D: Deserializer<'de>,
{
    CacheOverride::deserialize(d).map(|o| o.over(base))
}

fn query_cache<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<CacheSettings, D::Error> {
    overlay(d, CacheSettings::QUERY)
}

fn search_fallback_cache<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<CacheSettings, D::Error> {
    overlay(d, CacheSettings::SEARCH_FALLBACK)
}

fn ai_response_cache<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<CacheSettings, D::Error> {
    overlay(d, CacheSettings::AI_RESPONSE)
}

fn rate_limit_cache<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<CacheSettings, D::Error> {
    overlay(d, CacheSettings::RATE_LIMIT)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PolicyConfig {
    pub latency_targets: LatencyTargets,
    pub thresholds: SimilarityThresholds,
    pub limits: ResultLimits,
    /// Reciprocal rank fusion smoothing constant.
    pub rrf_k: f64,
    pub max_query_variants: usize,
    /// Multiplier applied to the similarity threshold for each variant.
    pub variant_threshold_factor: f64,
    #[serde(deserialize_with = "query_cache")]
    pub query_cache: CacheSettings,
    #[serde(deserialize_with = "search_fallback_cache")]
    pub search_fallback_cache: CacheSettings,
    #[serde(deserialize_with = "ai_response_cache")]
    pub ai_response_cache: CacheSettings,
    #[serde(deserialize_with = "rate_limit_cache")]
    pub rate_limit_cache: CacheSettings,
    pub sweep_interval_ms: u64,
    pub latency_window_ms: u64,
    pub max_latency_samples: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            latency_targets: LatencyTargets::default(),
            thresholds: SimilarityThresholds::default(),
            limits: ResultLimits::default(),
            rrf_k: DEFAULT_RRF_K,
            max_query_variants: 3,
            variant_threshold_factor: 0.9,
            query_cache: CacheSettings::QUERY,
            search_fallback_cache: CacheSettings::SEARCH_FALLBACK,
            ai_response_cache: CacheSettings::AI_RESPONSE,
            rate_limit_cache: CacheSettings::RATE_LIMIT,
            sweep_interval_ms: 60_000,
            latency_window_ms: DEFAULT_WINDOW.as_millis() as u64,
            max_latency_samples: 1_000,
        }
    }
}

impl PolicyConfig {
    /// Read and validate a JSON policy file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the active policy from, in order of priority:
    /// 1. An explicit path (from --config)
    /// 2. The PROTOCOL_RETRIEVAL_CONFIG environment variable
    /// 3. `fallback`, when that file exists
    /// 4. Built-in defaults
    pub fn resolve(
        explicit: Option<&Path>,
        fallback: Option<&Path>,
    ) -> Result<Self> {
        let path = if let Some(path) = explicit {
            Some(path.to_path_buf())
        } else if let Ok(val) = std::env::var(CONFIG_ENV_VAR) {
            Some(PathBuf::from(val))
        } else {
            fallback.filter(|p| p.exists()).map(Path::to_path_buf)
        };

        match path {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.thresholds;
        for (name, value) in [
            ("medication", t.medication),
            ("procedure", t.procedure),
            ("general", t.general),
            ("minimum", t.minimum),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "{name} threshold must be within [0, 1], got {value}"
                )));
            }
        }

        let l = &self.limits;
        if l.initial_fetch == 0
            || l.standard_return == 0
            || l.complex_return == 0
        {
            return Err(Error::Config("result limits must be positive".into()));
        }

        if !(self.variant_threshold_factor > 0.0
            && self.variant_threshold_factor <= 1.0)
        {
            return Err(Error::Config(format!(
                "variantThresholdFactor must be within (0, 1], got {}",
                self.variant_threshold_factor
            )));
        }

        if self.rrf_k < 0.0 {
            return Err(Error::Config("rrfK must not be negative".into()));
        }

        for (name, cache) in [
            ("queryCache", &self.query_cache),
            ("searchFallbackCache", &self.search_fallback_cache),
            ("aiResponseCache", &self.ai_response_cache),
            ("rateLimitCache", &self.rate_limit_cache),
        ] {
            if cache.max_entries == 0 {
                return Err(Error::Config(format!(
                    "{name}.maxEntries must be positive"
                )));
            }
        }

        for (name, value) in [
            ("sweepIntervalMs", self.sweep_interval_ms),
            ("latencyWindowMs", self.latency_window_ms),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }

        if self.max_latency_samples == 0 {
            return Err(Error::Config(
                "maxLatencySamples must be positive".into(),
            ));
        }

        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn latency_window(&self) -> Duration {
        Duration::from_millis(self.latency_window_ms)
    }
}

/// Section headings that earn a re-rank bonus, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionPriority {
    Treatment,
    Medication,
    Dosing,
    Contraindication,
    Procedure,
    Indication,
    Assessment,
    Pediatric,
    Protocol,
    Reference,
    General,
}

impl SectionPriority {
    pub const ALL: [SectionPriority; 11] = [
        Self::Treatment,
        Self::Medication,
        Self::Dosing,
        Self::Contraindication,
        Self::Procedure,
        Self::Indication,
        Self::Assessment,
        Self::Pediatric,
        Self::Protocol,
        Self::Reference,
        Self::General,
    ];

    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Treatment => "treatment",
            Self::Medication => "medication",
            Self::Dosing => "dosing",
            Self::Contraindication => "contraindication",
            Self::Procedure => "procedure",
            Self::Indication => "indication",
            Self::Assessment => "assessment",
            Self::Pediatric => "pediatric",
            Self::Protocol => "protocol",
            Self::Reference => "reference",
            Self::General => "general",
        }
    }

    pub const fn weight(self) -> f64 {
        match self {
            Self::Treatment | Self::Medication | Self::Dosing => 10.0,
            Self::Contraindication => 9.0,
            Self::Procedure => 8.0,
            Self::Indication => 7.0,
            Self::Assessment | Self::Pediatric => 6.0,
            Self::Protocol => 4.0,
            Self::Reference => 3.0,
            Self::General => 2.0,
        }
    }

    /// Highest weight among the keywords contained in `section`.
    pub fn weight_for(section: &str) -> f64 {
        let section = section.to_lowercase();
        Self::ALL
            .iter()
            .filter(|p| section.contains(p.keyword()))
            .map(|p| p.weight())
            .fold(0.0, f64::max)
    }
}

/// Content keywords worth a small bonus each.
pub const BOOST_KEYWORDS: &[&str] = &[
    "dose",
    "dosage",
    "mg",
    "mcg",
    "route",
    "administer",
    "contraindication",
    "indication",
    "pediatric",
    "adult",
    "step",
    "maximum",
    "repeat",
];
