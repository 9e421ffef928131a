//! Reciprocal Rank Fusion (RRF): combine a vector-search rank list and a
//! keyword-search rank list into one ordering, without needing the two
//! score scales to be comparable.
//!
//! `score(id) = sum over source lists containing id of weight / (k_rrf + rank)`,
//! where `rank` is 1-based position within that source's list. This is
//! the same rank-only combination strategy as the `rrf`/`rrf_multi`
//! family in the broader retrieval ecosystem's fusion stage; this
//! implementation adds caller-supplied per-source weights on top of the
//! unweighted baseline.

use std::collections::HashMap;

use crate::error::{Result, VectorDbError};

/// Default `k_rrf` constant from the original RRF paper: large enough
/// that a rank-1 hit doesn't completely dominate deeper signal from the
/// other list.
pub const DEFAULT_K_RRF: f32 = 60.0;

/// One ranked hit going into fusion: an ID and its 1-based rank within
/// its source list. The source's own score is intentionally not part of
/// this type — RRF only looks at rank.
#[derive(Debug, Clone)]
pub struct RankedHit {
    pub id: String,
    pub rank: usize,
}

/// A fused result: the combined RRF score and the ID it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub id: String,
    pub score: f32,
}

/// Fuse `vector_hits` and `keyword_hits` with the base (unweighted) RRF
/// formula, `score(id) = Σ 1/(k_rrf+rank)` — each list contributes with
/// weight `1.0`, not `0.5`, so a sole-list hit's fused score is exactly
/// `1/(k_rrf+rank)` (spec §8 invariant 8). Weighted fusion biasing
/// toward one list is opt-in via [`fuse_weighted`].
pub fn fuse(vector_hits: &[RankedHit], keyword_hits: &[RankedHit]) -> Vec<FusedHit> {
    fuse_impl(vector_hits, keyword_hits, 1.0, 1.0, DEFAULT_K_RRF)
}

/// Fuse with caller-supplied weights (must sum to `1.0`) and a
/// caller-supplied `k_rrf`.
///
/// Ties in the combined score are broken by whichever ID had the better
/// (lower) rank in either source list, then lexicographically by ID, so
/// output order is fully deterministic.
///
/// # Errors
/// Returns [`VectorDbError::InvalidArgument`] if the weights don't sum
/// to `1.0` within a small tolerance.
pub fn fuse_weighted(
    vector_hits: &[RankedHit],
    keyword_hits: &[RankedHit],
    vector_weight: f32,
    keyword_weight: f32,
    k_rrf: f32,
) -> Result<Vec<FusedHit>> {
    if (vector_weight + keyword_weight - 1.0).abs() > 1e-4 {
        return Err(VectorDbError::InvalidArgument(format!(
            "RRF weights must sum to 1.0, got {vector_weight} + {keyword_weight}"
        )));
    }
    Ok(fuse_impl(vector_hits, keyword_hits, vector_weight, keyword_weight, k_rrf))
}

fn fuse_impl(
    vector_hits: &[RankedHit],
    keyword_hits: &[RankedHit],
    vector_weight: f32,
    keyword_weight: f32,
    k_rrf: f32,
) -> Vec<FusedHit> {
    let mut scores: HashMap<String, f32> = HashMap::new();
    let mut best_rank: HashMap<String, usize> = HashMap::new();

    for (hits, weight) in [(vector_hits, vector_weight), (keyword_hits, keyword_weight)] {
        for hit in hits {
            let contribution = weight / (k_rrf + hit.rank as f32);
            *scores.entry(hit.id.clone()).or_insert(0.0) += contribution;
            best_rank
                .entry(hit.id.clone())
                .and_modify(|r| *r = (*r).min(hit.rank))
                .or_insert(hit.rank);
        }
    }

    let mut fused: Vec<FusedHit> = scores
        .into_iter()
        .map(|(id, score)| FusedHit { id, score })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| best_rank[&a.id].cmp(&best_rank[&b.id]))
            .then_with(|| a.id.cmp(&b.id))
    });

    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hits(ids: &[&str]) -> Vec<RankedHit> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| RankedHit {
                id: id.to_string(),
                rank: i + 1,
            })
            .collect()
    }

    #[test]
    fn id_present_in_both_lists_outranks_single_list_hits() {
        let vector_hits = hits(&["a", "b", "c"]);
        let keyword_hits = hits(&["b", "d", "a"]);
        let fused = fuse(&vector_hits, &keyword_hits);
        assert_eq!(fused[0].id, "b");
    }

    #[test]
    fn sole_list_hit_scores_exactly_one_over_k_plus_rank() {
        let vector_hits = hits(&["a"]);
        let fused = fuse(&vector_hits, &[]);
        assert_eq!(fused.len(), 1);
        let expected = 1.0 / (DEFAULT_K_RRF + 1.0);
        assert!((fused[0].score - expected).abs() < 1e-6);
    }

    #[test]
    fn unweighted_fuse_differs_from_equal_weighted_fuse() {
        let vector_hits = hits(&["a"]);
        let default_fused = fuse(&vector_hits, &[]);
        let explicit_fused = fuse_weighted(&vector_hits, &[], 0.5, 0.5, DEFAULT_K_RRF).unwrap();
        assert!((default_fused[0].score - 2.0 * explicit_fused[0].score).abs() < 1e-6);
    }

    #[test]
    fn weights_must_sum_to_one() {
        let vector_hits = hits(&["a"]);
        let keyword_hits = hits(&["b"]);
        assert!(fuse_weighted(&vector_hits, &keyword_hits, 0.9, 0.3, DEFAULT_K_RRF).is_err());
    }

    #[test]
    fn heavier_vector_weight_favors_vector_only_hit_over_keyword_only_hit() {
        let vector_hits = hits(&["a"]);
        let keyword_hits = hits(&["b"]);
        let fused = fuse_weighted(&vector_hits, &keyword_hits, 0.9, 0.1, DEFAULT_K_RRF).unwrap();
        assert_eq!(fused[0].id, "a");
    }

    #[test]
    fn empty_inputs_produce_empty_output() {
        let fused = fuse(&[], &[]);
        assert!(fused.is_empty());
    }

    #[test]
    fn ties_break_by_ascending_id() {
        let vector_hits = vec![
            RankedHit { id: "z".into(), rank: 1 },
            RankedHit { id: "a".into(), rank: 1 },
        ];
        let fused = fuse(&vector_hits, &[]);
        assert_eq!(fused[0].id, "a");
        assert_eq!(fused[1].id, "z");
    }
}
