//! protocol-retrieval - a low-latency retrieval and ranking pipeline for
//! EMS protocol excerpts.
//!
//! A question is normalized (abbreviations expanded, intent classified),
//! then answered from a bounded TTL/LRU result cache or by a pluggable
//! [`VectorSearch`] backend. Complex questions fan out over several query
//! variants merged with Reciprocal Rank Fusion. Candidates are re-ranked
//! with clinical heuristics and boosted toward the caller's agency and
//! state. Every stage reports its latency to a [`LatencyMonitor`].
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use protocol_retrieval::{
//!     CorpusIndex, DataDir, KeywordNormalizer, PolicyConfig,
//!     RetrievalPipeline,
//! };
//! use protocol_retrieval::types::{SearchOptions, SearchParams, UserTier};
//!
//! # async fn run() -> protocol_retrieval::Result<()> {
//! let data_dir = DataDir::resolve(None)?;
//! let corpus = CorpusIndex::load(&data_dir.corpus())?;
//! let default_config = data_dir.config();
//! let config = PolicyConfig::resolve(None, Some(default_config.as_path()))?;
//!
//! let pipeline = RetrievalPipeline::with_config(
//!     Arc::new(corpus),
//!     Arc::new(KeywordNormalizer),
//!     config,
//! );
//!
//! let params = SearchParams {
//!     agency_id: Some(12),
//!     user_tier: UserTier::Pro,
//!     ..SearchParams::new("epi dose for anaphylaxis")
//! };
//! let response = pipeline.search(&params, SearchOptions::default()).await?;
//! for r in &response.results {
//!     println!("{} ({:.1})", r.protocol_title, r.score());
//! }
//! # Ok(())
//! # }
//! ```

pub mod bounded_cache;
pub mod cache_pool;
pub mod config;
pub mod corpus;
pub mod data_dir;
pub mod error;
pub mod fusion;
pub mod latency;
pub mod normalizer;
pub mod reranker;
pub mod result_cache;
pub mod search;
pub mod selector;
pub mod types;

pub use bounded_cache::BoundedCache;
pub use cache_pool::CachePool;
pub use config::PolicyConfig;
pub use corpus::CorpusIndex;
pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use latency::LatencyMonitor;
pub use normalizer::{KeywordNormalizer, QueryNormalizer};
pub use result_cache::ResultCache;
pub use search::{RetrievalPipeline, VectorSearch, VectorSearchRequest};
