//! Retrieval orchestration: shared types, rank fusion and the nine-stage
//! pipeline

mod fusion;
mod pipeline;

pub use fusion::{
    reciprocal_rank_fusion, remove_near_duplicates, FusionCandidate, FusionConfig, FusionSource,
    RankedList,
};
pub use pipeline::{PipelineConfig, RetrievalPipeline};

use crate::analysis::{Intent, QueryPlan};
use crate::store::Chunk;
use serde::{Deserialize, Serialize};

/// Which channel produced a score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalSource {
    Dense,
    Lexical,
    Fused,
    Reranked,
}

/// Transient per-request candidate flowing between stages
#[derive(Debug, Clone)]
pub struct RetrievedItem {
    pub chunk_id: String,
    /// Score under `source` semantics (similarity, BM25 or RRF)
    pub score: f32,
    pub source: RetrievalSource,
    /// Best rank this chunk reached in any dense list (1-based)
    pub dense_rank: Option<usize>,
    /// Rank in the BM25 list (1-based)
    pub lexical_rank: Option<usize>,
    /// Best dense similarity, already penalised for cross-tier misses
    pub dense_score: Option<f32>,
    pub lexical_score: Option<f32>,
    /// Whether the chunk's procedure appeared among the parent hits
    pub cross_tier_match: bool,
}

/// A chunk retained in the final result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// Final ensemble score in [0, 1]
    pub score: f32,
    pub source: RetrievalSource,
    pub cross_tier_match: bool,
}

/// How the result was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    ExactCodeMatch,
    Hybrid,
}

/// Bookkeeping attached to every result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub request_id: String,
    pub search_type: SearchType,
    pub num_parent_chunks: usize,
    pub num_child_chunks: usize,
    /// Channels that failed while the pipeline still produced a result
    pub failed_channels: Vec<String>,
    /// Fatal condition label, e.g. "no-retrieval-channels"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final product of the nine-stage pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunks: Vec<ScoredChunk>,
    /// Assembled context block handed to the generator
    pub context: String,
    /// Mean reranked score of the retained chunks, clamped to [0, 1]
    pub confidence: f32,
    pub intent: Intent,
    pub plan: QueryPlan,
    /// Some retrieval channel failed; the result still stands
    pub degraded: bool,
    pub metadata: ResultMetadata,
}

impl RetrievalResult {
    /// True when no passage survived retrieval
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
