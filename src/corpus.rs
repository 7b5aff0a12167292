//! In-memory protocol corpus implementing [`VectorSearch`].
//!
//! Similarity is cosine similarity between lowercase term-frequency
//! vectors of the query and of each chunk's title, section and content.
//! It stands in for an external vector database in the CLI and in tests.

use std::{collections::HashMap, path::Path};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    error::Result,
    search::{VectorSearch, VectorSearchRequest},
    types::RetrievalResult,
};

/// One protocol excerpt as stored in a corpus file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolChunk {
    pub id: String,
    pub protocol_number: String,
    pub protocol_title: String,
    #[serde(default)]
    pub section: Option<String>,
    pub content: String,
    #[serde(default)]
    pub agency_id: Option<i64>,
    #[serde(default)]
    pub agency_name: Option<String>,
    #[serde(default)]
    pub state_code: Option<String>,
    #[serde(default)]
    pub image_urls: Option<Vec<String>>,
}

struct IndexedChunk {
    chunk: ProtocolChunk,
    terms: HashMap<String, f64>,
    norm: f64,
}

pub struct CorpusIndex {
    chunks: Vec<IndexedChunk>,
}

fn term_frequencies(text: &str) -> HashMap<String, f64> {
    let mut tf = HashMap::new();
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        *tf.entry(token.to_lowercase()).or_insert(0.0) += 1.0;
    }
    tf
}

fn norm(tf: &HashMap<String, f64>) -> f64 {
    tf.values().map(|v| v * v).sum::<f64>().sqrt()
}

impl CorpusIndex {
    pub fn new(chunks: Vec<ProtocolChunk>) -> Self {
        let chunks = chunks
            .into_iter()
            .map(|chunk| {
                let text = format!(
                    "{} {} {}",
                    chunk.protocol_title,
                    chunk.section.as_deref().unwrap_or_default(),
                    chunk.content
                );
                let terms = term_frequencies(&text);
                let norm = norm(&terms);
                IndexedChunk { chunk, terms, norm }
            })
            .collect();
        Self { chunks }
    }

    /// Load a JSON array of [`ProtocolChunk`] records.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let chunks: Vec<ProtocolChunk> = serde_json::from_str(&contents)?;
        debug!(
            path = %path.display(),
            chunks = chunks.len(),
            "loaded corpus"
        );
        Ok(Self::new(chunks))
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn similarity(
        query: &HashMap<String, f64>,
        query_norm: f64,
        doc: &IndexedChunk,
    ) -> f64 {
        if query_norm == 0.0 || doc.norm == 0.0 {
            return 0.0;
        }
        let dot: f64 = query
            .iter()
            .filter_map(|(term, q)| doc.terms.get(term).map(|d| q * d))
            .sum();
        (dot / (query_norm * doc.norm)).clamp(0.0, 1.0)
    }

    /// Synchronous core of [`VectorSearch::search`].
    pub fn search_sync(
        &self,
        request: &VectorSearchRequest,
    ) -> Vec<RetrievalResult> {
        let query = term_frequencies(&request.query);
        let query_norm = norm(&query);
        let wanted_state = request.state_code.as_deref().map(str::trim);

        let mut hits: Vec<(f64, &ProtocolChunk)> = self
            .chunks
            .iter()
            .filter(|doc| {
                match (wanted_state, doc.chunk.state_code.as_deref()) {
                    (Some(wanted), Some(have)) => {
                        wanted.eq_ignore_ascii_case(have.trim())
                    }
                    _ => true,
                }
            })
            .map(|doc| (Self::similarity(&query, query_norm, doc), &doc.chunk))
            .filter(|(similarity, _)| *similarity >= request.threshold)
            .collect();

        hits.sort_by(|a, b| {
            b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(request.limit);

        hits.into_iter()
            .map(|(similarity, chunk)| to_result(chunk, similarity))
            .collect()
    }
}

fn to_result(chunk: &ProtocolChunk, similarity: f64) -> RetrievalResult {
    let mut metadata = Map::new();
    if let Some(id) = chunk.agency_id {
        metadata.insert("agencyId".into(), Value::from(id));
    }
    if let Some(name) = &chunk.agency_name {
        metadata.insert("agencyName".into(), Value::from(name.clone()));
    }
    if let Some(state) = &chunk.state_code {
        metadata.insert("stateCode".into(), Value::from(state.clone()));
    }

    RetrievalResult {
        id: chunk.id.clone(),
        protocol_number: chunk.protocol_number.clone(),
        protocol_title: chunk.protocol_title.clone(),
        section: chunk.section.clone(),
        content: chunk.content.clone(),
        similarity,
        reranked_score: None,
        image_urls: chunk.image_urls.clone(),
        metadata,
    }
}

#[async_trait]
impl VectorSearch for CorpusIndex {
    async fn search(
        &self,
        request: &VectorSearchRequest,
    ) -> Result<Vec<RetrievalResult>> {
        Ok(self.search_sync(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, title: &str, content: &str, state: &str) -> ProtocolChunk {
        ProtocolChunk {
            id: id.to_string(),
            protocol_number: "1".to_string(),
            protocol_title: title.to_string(),
            section: None,
            content: content.to_string(),
            agency_id: Some(7),
            agency_name: None,
            state_code: Some(state.to_string()),
            image_urls: None,
        }
    }

    fn request(query: &str) -> VectorSearchRequest {
        VectorSearchRequest {
            query: query.to_string(),
            agency_id: None,
            agency_name: None,
            state_code: None,
            limit: 10,
            threshold: 0.0,
        }
    }

    fn index() -> CorpusIndex {
        CorpusIndex::new(vec![
            chunk("a", "Anaphylaxis", "epinephrine 0.3 mg IM", "CA"),
            chunk("b", "Burns", "cool the burn with water", "CA"),
            chunk("c", "Anaphylaxis", "epinephrine 0.01 mg/kg", "TX"),
        ])
    }

    #[test]
    fn ranks_by_cosine_similarity() {
        let hits = index().search_sync(&request("epinephrine anaphylaxis"));
        assert_eq!(hits.len(), 3);
        assert_ne!(hits[0].id, "b");
        assert_eq!(hits[2].id, "b");
        assert_eq!(hits[2].similarity, 0.0);
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.similarity)));
    }

    #[test]
    fn threshold_and_limit_apply() {
        let mut req = request("epinephrine anaphylaxis");
        req.threshold = 0.1;
        req.limit = 1;
        let hits = index().search_sync(&req);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].similarity >= 0.1);
    }

    #[test]
    fn state_filter_excludes_other_states() {
        let mut req = request("epinephrine");
        req.state_code = Some("tx".into());
        let ids: Vec<_> =
            index().search_sync(&req).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, ["c"]);
    }

    #[test]
    fn metadata_carries_scope() {
        let hits = index().search_sync(&request("burn"));
        let burn = hits.iter().find(|h| h.id == "b").unwrap();
        assert_eq!(burn.agency_id(), Some(7));
        assert_eq!(burn.state_code(), Some("CA"));
    }

    #[test]
    fn load_reads_json_array() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("corpus.json");
        std::fs::write(
            &path,
            serde_json::to_string(&vec![chunk("a", "T", "text", "CA")]).unwrap(),
        )
        .unwrap();

        assert_eq!(CorpusIndex::load(&path).unwrap().len(), 1);
    }

    #[test]
    fn load_rejects_malformed_json() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("corpus.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            CorpusIndex::load(&path),
            Err(crate::error::Error::Json(_))
        ));
    }
}
