//! Ensemble reranking
//!
//! Produces the final relevance score for each fused candidate:
//!
//! ```text
//! final = w_dense * dense_norm + w_lex * lex_norm + w_ce * ce_score
//! ```
//!
//! Dense and lexical components are min-max normalised within the current
//! candidate set; missing components count as zero. Weights are normalised
//! to sum to one. When the cross-encoder is disabled its weight drops to
//! zero and the model is never contacted.

mod ollama;

pub use ollama::OllamaCrossEncoder;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

#[derive(Error, Debug)]
pub enum RerankError {
    #[error("Cross-encoder request failed: {0}")]
    RequestError(String),

    #[error("Cross-encoder returned {got} scores for {expected} texts")]
    ScoreCountMismatch { expected: usize, got: usize },
}

/// External cross-encoder scoring a (query, text) batch into [0, 1]
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, RerankError>;
}

/// A fused candidate entering the reranker
#[derive(Debug, Clone)]
pub struct RerankCandidate {
    pub chunk_id: String,
    pub text: String,
    /// Best dense similarity across expansions, penalised for cross-tier
    /// misses; `None` when the chunk only surfaced lexically
    pub dense_score: Option<f32>,
    /// BM25 score; `None` when the chunk only surfaced densely
    pub lex_score: Option<f32>,
}

/// A reranked candidate with its ensemble score
#[derive(Debug, Clone)]
pub struct RerankedItem {
    pub chunk_id: String,
    pub score: f32,
}

pub struct EnsembleReranker {
    w_dense: f32,
    w_lex: f32,
    w_ce: f32,
    cross_encoder: Option<Arc<dyn CrossEncoder>>,
    ce_timeout: Duration,
}

impl EnsembleReranker {
    /// Build the reranker, normalising weights to sum to one. Passing no
    /// cross-encoder forces `w_ce` to zero before normalisation.
    pub fn new(
        w_dense: f32,
        w_lex: f32,
        w_ce: f32,
        cross_encoder: Option<Arc<dyn CrossEncoder>>,
        ce_timeout: Duration,
    ) -> Self {
        let w_ce = if cross_encoder.is_some() { w_ce } else { 0.0 };
        let sum = w_dense + w_lex + w_ce;

        let (w_dense, w_lex, w_ce) = if sum > 0.0 {
            (w_dense / sum, w_lex / sum, w_ce / sum)
        } else {
            (1.0, 0.0, 0.0)
        };

        Self {
            w_dense,
            w_lex,
            w_ce,
            cross_encoder,
            ce_timeout,
        }
    }

    pub fn weights(&self) -> (f32, f32, f32) {
        (self.w_dense, self.w_lex, self.w_ce)
    }

    /// Score and rank candidates, returning the top `top_k` by ensemble
    /// score descending
    pub async fn rerank(
        &self,
        query: &str,
        candidates: &[RerankCandidate],
        top_k: usize,
    ) -> Vec<RerankedItem> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let dense_norm = min_max_normalise(candidates.iter().map(|c| c.dense_score));
        let lex_norm = min_max_normalise(candidates.iter().map(|c| c.lex_score));
        let ce_scores = self.cross_encoder_scores(query, candidates).await;

        let mut ranked: Vec<RerankedItem> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let score = self.w_dense * dense_norm[i]
                    + self.w_lex * lex_norm[i]
                    + self.w_ce * ce_scores[i];
                RerankedItem {
                    chunk_id: c.chunk_id.clone(),
                    score: score.clamp(0.0, 1.0),
                }
            })
            .collect();

        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(top_k);
        ranked
    }

    /// Cross-encoder component; zeros when disabled, on error or on timeout
    /// (the fused ordering then carries the result)
    async fn cross_encoder_scores(&self, query: &str, candidates: &[RerankCandidate]) -> Vec<f32> {
        let zeros = vec![0.0; candidates.len()];

        let Some(encoder) = &self.cross_encoder else {
            return zeros;
        };
        if self.w_ce == 0.0 {
            return zeros;
        }

        let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        match timeout(self.ce_timeout, encoder.score(query, &texts)).await {
            Ok(Ok(scores)) if scores.len() == candidates.len() => {
                scores.into_iter().map(|s| s.clamp(0.0, 1.0)).collect()
            }
            Ok(Ok(scores)) => {
                tracing::warn!(
                    expected = candidates.len(),
                    got = scores.len(),
                    "Cross-encoder score count mismatch, ignoring"
                );
                zeros
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Cross-encoder failed, falling back to fused order");
                zeros
            }
            Err(_) => {
                tracing::warn!("Cross-encoder timed out, falling back to fused order");
                zeros
            }
        }
    }
}

/// Min-max normalise present scores within the candidate set; missing scores
/// become zero. A degenerate set (all present scores equal) normalises to
/// one.
fn min_max_normalise(scores: impl Iterator<Item = Option<f32>>) -> Vec<f32> {
    let scores: Vec<Option<f32>> = scores.collect();

    let present: Vec<f32> = scores.iter().filter_map(|s| *s).collect();
    if present.is_empty() {
        return vec![0.0; scores.len()];
    }

    let min = present.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = present.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;

    scores
        .into_iter()
        .map(|s| match s {
            None => 0.0,
            Some(v) if range > 0.0 => (v - min) / range,
            Some(_) => 1.0,
        })
        .collect()
}
