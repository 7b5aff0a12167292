//! Reciprocal Rank Fusion: score(id) = Σ 1/(k + rank + 1), rank 0-based.
//!
//! Merges result lists from several query variants without comparing
//! their raw similarities. When an id appears in more than one list its
//! contributions add up, and the copy with the higher similarity is kept.

use std::collections::HashMap;

use crate::types::RetrievalResult;

/// Smoothing constant used unless the policy overrides it.
pub const DEFAULT_RRF_K: f64 = 60.0;

/// Contribution of a single 0-based rank.
pub fn rrf_contribution(rank: usize, k: f64) -> f64 {
    1.0 / (k + rank as f64 + 1.0)
}

/// Fuse ranked lists and return the top `limit` results, highest fused
/// score first, with `reranked_score` set to `fused * 100`.
///
/// Ties keep first-seen order, so fusing a single list preserves it.
pub fn reciprocal_rank_fusion(
    lists: &[Vec<RetrievalResult>],
    k: f64,
    limit: usize,
) -> Vec<RetrievalResult> {
    let mut slots: HashMap<&str, usize> = HashMap::new();
    let mut fused: Vec<(&RetrievalResult, f64)> = Vec::new();

    for list in lists {
        for (rank, result) in list.iter().enumerate() {
            let contribution = rrf_contribution(rank, k);
            match slots.get(result.id.as_str()) {
                Some(&slot) => {
                    let (kept, score) = &mut fused[slot];
                    *score += contribution;
                    if result.similarity > kept.similarity {
                        *kept = result;
                    }
                }
                None => {
                    slots.insert(result.id.as_str(), fused.len());
                    fused.push((result, contribution));
                }
            }
        }
    }

    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
    });

    fused
        .into_iter()
        .take(limit)
        .map(|(result, score)| result.with_score(score * 100.0))
        .collect()
}
