//! Weighted Reciprocal Rank Fusion over two ranked id lists.
//!
//! ```text
//! score(id) = keyword_weight / (rrf_k + lexical_rank)
//!           + vector_weight  / (rrf_k + vector_rank)
//! ```
//!
//! Ranks are 1-based. A list that does not contain `id` contributes
//! nothing, so appearing in both lists always beats appearing in one at the
//! same rank. Only positions are used; the raw BM25 and cosine scores live
//! on different scales and are never mixed.

use std::collections::HashMap;

/// Fusion parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    /// Weight of the lexical ranking.
    pub keyword_weight: f32,
    /// Weight of the vector ranking.
    pub vector_weight: f32,
    /// Higher values smooth out rank differences.
    pub rrf_k: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            keyword_weight: 0.5,
            vector_weight: 0.5,
            rrf_k: 60.0,
        }
    }
}

/// One fused entry with the 1-based rank it held in each input list.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    /// Chunk id.
    pub id: String,
    /// Weighted RRF score.
    pub score: f32,
    /// Rank in the lexical list, if present there.
    pub lexical_rank: Option<usize>,
    /// Rank in the vector list, if present there.
    pub vector_rank: Option<usize>,
}

/// Fuse `lexical` and `vector` (both best-first) into at most `limit`
/// entries ordered by descending score.
///
/// Ties keep first-seen order: the lexical list is walked before the vector
/// list. With an empty `vector` list the lexical order is returned
/// unchanged.
pub fn reciprocal_rank_fusion<L, V>(
    lexical: &[L],
    vector: &[V],
    weights: FusionWeights,
    limit: usize,
) -> Vec<FusedHit>
where
    L: AsRef<str>,
    V: AsRef<str>,
{
    let mut order: Vec<FusedHit> = Vec::with_capacity(lexical.len() + vector.len());
    let mut positions: HashMap<&str, usize> = HashMap::new();

    for (idx, id) in lexical.iter().enumerate() {
        let id = id.as_ref();
        if positions.contains_key(id) {
            continue;
        }
        let rank = idx + 1;
        positions.insert(id, order.len());
        order.push(FusedHit {
            id: id.to_string(),
            score: weights.keyword_weight / (weights.rrf_k + rank as f32),
            lexical_rank: Some(rank),
            vector_rank: None,
        });
    }

    for (idx, id) in vector.iter().enumerate() {
        let id = id.as_ref();
        let rank = idx + 1;
        let contribution = weights.vector_weight / (weights.rrf_k + rank as f32);
        match positions.get(id) {
            Some(&pos) => {
                let hit = &mut order[pos];
                if hit.vector_rank.is_none() {
                    hit.vector_rank = Some(rank);
                    hit.score += contribution;
                }
            }
            None => {
                positions.insert(id, order.len());
                order.push(FusedHit {
                    id: id.to_string(),
                    score: contribution,
                    lexical_rank: None,
                    vector_rank: Some(rank),
                });
            }
        }
    }

    // Stable sort keeps first-seen order among equal scores.
    order.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order.truncate(limit);
    order
}
