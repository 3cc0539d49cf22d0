use candle_core::Tensor;
use rayon::prelude::*;

use crate::error::Result;

/// A passage with its MaxSim score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedPassage {
    pub passage_id: u64,
    pub score: f32,
}

/// Score candidate passages against a query with ColBERT MaxSim.
///
/// For each candidate:
/// 1. Compute similarity matrix: query_emb @ passage_emb^T
/// 2. Take row-wise max (best matching passage token per query token)
/// 3. Sum the maxes to get the MaxSim score
///
/// Candidates are scored in parallel. Returns them sorted by score
/// descending, ties broken by passage id.
pub fn rerank(
    query_embedding: &Tensor,
    candidates: &[(u64, &Tensor)],
) -> Result<Vec<RankedPassage>> {
    let mut ranked: Vec<RankedPassage> = candidates
        .par_iter()
        .map(|&(passage_id, embedding)| {
            Ok(RankedPassage {
                passage_id,
                score: maxsim(query_embedding, embedding)?,
            })
        })
        .collect::<Result<_>>()?;

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.passage_id.cmp(&b.passage_id))
    });

    Ok(ranked)
}

/// MaxSim between a `[Q, D]` query and a `[T, D]` passage embedding.
///
/// MaxSim = sum over query tokens of max(query_token . passage_token)
fn maxsim(query_embedding: &Tensor, passage_embedding: &Tensor) -> Result<f32> {
    let sim_matrix = query_embedding.matmul(&passage_embedding.t()?)?;
    let row_maxes = sim_matrix.max(1)?;
    Ok(row_maxes.sum_all()?.to_scalar::<f32>()?)
}
