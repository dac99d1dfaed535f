//! Hybrid retrieval: embedding and keyword candidates merged by reciprocal-rank
//! fusion, optionally reordered by a cross-encoder rerank model.

use std::collections::HashMap;
use std::sync::Arc;

use docent_llm::LlmProvider;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::ChunkStore;
use crate::types::{ChunkId, RankedResult, ScoredChunk};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankerConfig {
    /// Each signal contributes `k * candidate_multiplier` candidates.
    pub candidate_multiplier: usize,
    pub rank_constant: f64,
    /// When false, ranking uses embedding similarity alone.
    pub keyword_enabled: bool,
    /// Fused candidates passed to the reranker, when one is set.
    pub rerank_depth: usize,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            candidate_multiplier: 4,
            rank_constant: 60.0,
            keyword_enabled: true,
            rerank_depth: 20,
        }
    }
}

/// Fuse ranked id lists: each id scores `sum(1 / (rank_constant + rank))`
/// over the lists containing it, with 1-based ranks. Output is sorted by
/// descending score, ties by ascending id, and truncated to `k`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn reciprocal_rank_fusion(
    lists: &[Vec<ChunkId>],
    rank_constant: f64,
    k: usize,
) -> Vec<(ChunkId, f64)> {
    let mut scores: HashMap<&ChunkId, f64> = HashMap::new();
    for list in lists {
        for (rank, id) in list.iter().enumerate() {
            *scores.entry(id).or_default() += 1.0 / (rank_constant + (rank + 1) as f64);
        }
    }
    let mut fused: Vec<(ChunkId, f64)> = scores
        .into_iter()
        .map(|(id, score)| (id.clone(), score))
        .collect();
    fused.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    fused.truncate(k);
    fused
}

pub struct HybridRanker<P> {
    store: Arc<ChunkStore>,
    provider: Arc<P>,
    reranker: Option<Arc<P>>,
    config: RankerConfig,
}

impl<P: LlmProvider> HybridRanker<P> {
    #[must_use]
    pub fn new(store: Arc<ChunkStore>, provider: Arc<P>, config: RankerConfig) -> Self {
        Self {
            store,
            provider,
            reranker: None,
            config,
        }
    }

    /// Reorder the top `rerank_depth` fused candidates by `reranker` scores.
    #[must_use]
    pub fn with_reranker(mut self, reranker: Arc<P>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// Up to `k` chunks relevant to `query`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query cannot be embedded or its vector does not
    /// match the index dimension.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<RankedResult> {
        if k == 0 || self.store.is_empty() {
            return Ok(Vec::new());
        }
        let depth = match self.reranker {
            Some(_) => k.max(self.config.rerank_depth),
            None => k,
        };
        let candidates = depth.saturating_mul(self.config.candidate_multiplier.max(1));

        let query_vector = self.provider.embed(query).await?;
        let semantic: Vec<ChunkId> = self
            .store
            .embedding_index()
            .search(&query_vector, candidates)?
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        let mut lists = vec![semantic];
        if self.config.keyword_enabled {
            lists.push(
                self.store
                    .keyword_index()
                    .search(query, candidates)
                    .await?
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect(),
            );
        }

        // Fuse every candidate: a chunk removed by a concurrent refresh, or
        // not yet loaded into memory, is skipped without shrinking the result.
        let fused = reciprocal_rank_fusion(&lists, self.config.rank_constant, usize::MAX);
        let mut results: RankedResult = fused
            .into_iter()
            .filter_map(|(id, score)| {
                self.store
                    .get(&id)
                    .map(|chunk| ScoredChunk { chunk, score })
            })
            .take(depth)
            .collect();

        if let Some(reranker) = &self.reranker {
            self.rerank(reranker, query, &mut results).await;
        }
        results.truncate(k);

        tracing::debug!(
            k,
            candidates,
            returned = results.len(),
            keyword = self.config.keyword_enabled,
            reranked = self.reranker.is_some(),
            "retrieval finished"
        );
        Ok(results)
    }

    /// Replace fused scores with rerank scores and re-sort, ties by
    /// ascending id. On failure the fused order is kept.
    async fn rerank(&self, reranker: &P, query: &str, results: &mut RankedResult) {
        if results.is_empty() {
            return;
        }
        let texts: Vec<String> = results.iter().map(|s| s.chunk.text.clone()).collect();
        let scores = match reranker.rerank(query, &texts).await {
            Ok(scores) if scores.len() == results.len() => scores,
            Ok(scores) => {
                tracing::warn!(
                    expected = results.len(),
                    got = scores.len(),
                    "reranker returned the wrong number of scores, keeping fused order"
                );
                return;
            }
            Err(e) => {
                tracing::warn!("rerank failed, keeping fused order: {e}");
                return;
            }
        };
        for (scored, score) in results.iter_mut().zip(scores) {
            scored.score = f64::from(score);
        }
        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
    }
}
