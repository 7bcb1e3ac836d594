//! The nine-stage retrieval orchestrator
//!
//! Stage 0  cache probe (embed once, reused downstream)
//! Stage 1  query analysis
//! Stage 2  exact-code fast path
//! Stage 3  dense parent retrieval per expansion
//! Stage 4  dense child retrieval with soft cross-tier penalty
//! Stage 5  BM25 augmentation on the raw question
//! Stage 6  reciprocal rank fusion + near-duplicate removal
//! Stage 7  ensemble reranking
//! Stage 8  context assembly
//! Stage 9  cache store
//!
//! Stages 3-4 and 5 fan out concurrently. Every external call carries its
//! own timeout; channel failures degrade the result instead of aborting it,
//! and only the loss of both channels yields the no-channel outcome.

use crate::analysis::{QueryAnalyser, QueryPlan};
use crate::cache::{CacheStats, SemanticCache};
use crate::config::Config;
use crate::context::ContextAssembler;
use crate::embedding::EmbeddingProvider;
use crate::error::{Result, ThutucError};
use crate::rerank::{EnsembleReranker, RerankCandidate};
use crate::retrieval::{
    reciprocal_rank_fusion, remove_near_duplicates, FusionCandidate, FusionConfig, FusionSource,
    RankedList, ResultMetadata, RetrievalResult, RetrievalSource, RetrievedItem, ScoredChunk,
    SearchType,
};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::store::{Bm25Index, Bm25Stats, ChunkStore, ChunkTier};
use crate::vector::{SearchFilter, VectorSearch};
use ahash::{AHashMap, AHashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::Instrument;

/// Fatal label recorded when both retrieval channels produced nothing
const NO_CHANNELS_ERROR: &str = "no-retrieval-channels";

/// Pipeline tunables derived from the application config
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub top_k_parent: usize,
    pub top_k_child: usize,
    pub rrf_k: f32,
    pub bm25_rrf_boost: f32,
    pub cross_tier_penalty: f32,
    pub near_dup_jaccard: f32,
    pub rerank_max_candidates: usize,
    pub rerank_cap: usize,
    pub cache_enabled: bool,
    pub embed_timeout: Duration,
    pub vector_timeout: Duration,
    pub request_timeout: Duration,
}

impl From<&Config> for PipelineConfig {
    fn from(config: &Config) -> Self {
        Self {
            top_k_parent: config.retrieval.top_k_parent,
            top_k_child: config.retrieval.top_k_child,
            rrf_k: config.retrieval.rrf_k,
            bm25_rrf_boost: config.retrieval.bm25_rrf_boost,
            cross_tier_penalty: config.retrieval.cross_tier_penalty,
            near_dup_jaccard: config.retrieval.near_dup_jaccard,
            rerank_max_candidates: config.retrieval.rerank_max_candidates,
            rerank_cap: config.retrieval.rerank_cap,
            cache_enabled: config.cache.enabled,
            embed_timeout: Duration::from_secs(config.embedding.timeout_secs),
            vector_timeout: Duration::from_secs(config.vector.timeout_secs),
            request_timeout: config.request_deadline(),
        }
    }
}

/// Outcome of the dense fan-out (stages 3-4)
struct DenseOutcome {
    parent_lists: Vec<RankedList>,
    child_lists: Vec<RankedList>,
    /// Unique parent chunk ids that surfaced
    parent_chunks: usize,
    /// Every call on the channel failed
    failed: bool,
}

pub struct RetrievalPipeline {
    store: Arc<ChunkStore>,
    bm25: Arc<Bm25Index>,
    vectors: Arc<dyn VectorSearch>,
    embedder: Arc<dyn EmbeddingProvider>,
    analyser: QueryAnalyser,
    reranker: EnsembleReranker,
    cache: Arc<SemanticCache<RetrievalResult>>,
    assembler: ContextAssembler,
    config: PipelineConfig,
    stats: Arc<PipelineStats>,
    full_config: Config,
}

impl RetrievalPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ChunkStore>,
        bm25: Arc<Bm25Index>,
        vectors: Arc<dyn VectorSearch>,
        embedder: Arc<dyn EmbeddingProvider>,
        analyser: QueryAnalyser,
        reranker: EnsembleReranker,
        cache: Arc<SemanticCache<RetrievalResult>>,
        full_config: Config,
    ) -> Self {
        let assembler = ContextAssembler::new(store.clone(), full_config.context.max_chunk_tokens);
        let config = PipelineConfig::from(&full_config);

        Self {
            store,
            bm25,
            vectors,
            embedder,
            analyser,
            reranker,
            cache,
            assembler,
            config,
            stats: Arc::new(PipelineStats::new()),
            full_config,
        }
    }

    /// Entry point: run the nine stages under the overall request deadline.
    /// Dropping the returned future cancels in-flight collaborator calls; a
    /// cancelled or timed-out request never reaches the cache store.
    pub async fn retrieve(&self, session_id: &str, question: &str) -> Result<RetrievalResult> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("retrieve", session_id, request_id = %request_id);

        let deadline = self.config.request_timeout;
        match timeout(
            deadline,
            self.retrieve_inner(question, &request_id).instrument(span),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(session_id, "Request deadline exceeded");
                Err(ThutucError::Timeout {
                    secs: deadline.as_secs(),
                })
            }
        }
    }

    async fn retrieve_inner(&self, question: &str, request_id: &str) -> Result<RetrievalResult> {
        self.stats.record_query();

        // Stage 0: embed the question once; the vector is reused for the
        // cache probe, dense retrieval and the cache store
        let query_vector = match timeout(self.config.embed_timeout, self.embedder.embed(question))
            .await
        {
            Ok(Ok(vector)) => Some(vector),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Question embedding failed");
                None
            }
            Err(_) => {
                tracing::warn!("Question embedding timed out");
                None
            }
        };

        if self.config.cache_enabled {
            if let Some(vector) = &query_vector {
                if let Some(cached) = self.cache.get(question, vector) {
                    tracing::info!("Cache hit");
                    self.stats.record_cache_hit();
                    return Ok(cached);
                }
            }
        }

        // Stage 1: query analysis
        let plan = self.analyser.analyse(question).await;
        tracing::info!(
            intent = plan.intent.as_str(),
            expansions = plan.expansions.len(),
            "Query analysed"
        );

        // Stage 2: exact-code fast path
        if let Some(code) = plan.detected_procedure_code.clone() {
            match timeout(
                self.config.vector_timeout,
                self.vectors.scroll(&SearchFilter::by_procedure(code.clone())),
            )
            .await
            {
                Ok(Ok(hits)) if !hits.is_empty() => {
                    tracing::info!(code = %code, chunks = hits.len(), "Exact code match");
                    self.stats.record_exact_code();
                    let chunk_ids: Vec<String> = hits.into_iter().map(|h| h.chunk_id).collect();
                    let result = self.exact_code_result(&plan, &chunk_ids, request_id);
                    self.store_in_cache(question, &query_vector, &result);
                    return Ok(result);
                }
                Ok(Ok(_)) => {
                    tracing::debug!(code = %code, "No chunks for code, falling back to hybrid search");
                }
                Ok(Err(e)) => {
                    tracing::warn!(code = %code, error = %e, "Exact code lookup failed, falling back");
                }
                Err(_) => {
                    tracing::warn!(code = %code, "Exact code lookup timed out, falling back");
                }
            }
        }

        // Stages 3-4 and 5 fan out; BM25 is in-memory and non-blocking but
        // joins the dense future so neither waits on the other
        let (dense, lexical_list) = tokio::join!(
            self.dense_channel(&plan, query_vector.as_deref()),
            self.lexical_channel(&plan.raw_question),
        );

        let lexical_empty = lexical_list.items.is_empty();

        // Stage 6: fusion
        let mut lists = Vec::with_capacity(dense.parent_lists.len() + dense.child_lists.len() + 1);
        lists.extend(dense.parent_lists);
        lists.extend(dense.child_lists);
        lists.push(lexical_list);

        let fusion_config = FusionConfig {
            rrf_k: self.config.rrf_k,
            bm25_boost: self.config.bm25_rrf_boost,
        };
        let fused = reciprocal_rank_fusion(&lists, &fusion_config);
        let fused = remove_near_duplicates(
            fused,
            |chunk_id| self.store.get(chunk_id).ok().map(|c| c.content.as_str()),
            self.config.near_dup_jaccard,
        );
        tracing::debug!(candidates = fused.len(), "Fusion complete");

        if fused.is_empty() {
            // Both channels came back empty: either everything failed or the
            // corpus has nothing for this question
            tracing::warn!("No retrieval channel produced candidates");
            self.stats.record_no_channels();
            return Ok(self.no_channels_result(&plan, request_id, dense.failed, lexical_empty));
        }

        // Degraded means the dense channel failed while BM25 carried the
        // result; an empty BM25 answer on a healthy index is not a failure
        let degraded = dense.failed;
        if degraded {
            self.stats.record_degraded();
        }

        // Stage 7: reranking
        let candidates = fused
            .iter()
            .take(self.config.rerank_max_candidates.min(50))
            .collect::<Vec<_>>();
        let reranked = self.rerank_stage(&plan, &candidates).await;

        // Stage 8: context assembly
        let assembled = self
            .assembler
            .assemble(&reranked, &plan.context_config, degraded);

        let mut failed_channels = Vec::new();
        if dense.failed {
            failed_channels.push("dense".to_string());
        }

        let result = RetrievalResult {
            chunks: assembled.chunks,
            context: assembled.context,
            confidence: assembled.confidence,
            intent: plan.intent,
            plan: plan.clone(),
            degraded,
            metadata: ResultMetadata {
                request_id: request_id.to_string(),
                search_type: SearchType::Hybrid,
                num_parent_chunks: dense.parent_chunks,
                num_child_chunks: reranked.len(),
                failed_channels,
                error: None,
            },
        };

        tracing::info!(
            confidence = result.confidence,
            chunks = result.chunks.len(),
            degraded,
            "Retrieval complete"
        );

        // Stage 9: cache store
        self.store_in_cache(question, &query_vector, &result);

        Ok(result)
    }

    /// Stages 3-4: per-expansion dense retrieval with the soft cross-tier
    /// penalty
    async fn dense_channel(&self, plan: &QueryPlan, query_vector: Option<&[f32]>) -> DenseOutcome {
        let mut failed_calls = 0usize;

        // Embed each expansion, reusing the stage-0 vector for the raw
        // question
        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(plan.expansions.len());
        for expansion in &plan.expansions {
            if expansion == &plan.raw_question {
                if let Some(vector) = query_vector {
                    vectors.push(vector.to_vec());
                    continue;
                }
            }
            match timeout(self.config.embed_timeout, self.embedder.embed(expansion)).await {
                Ok(Ok(vector)) => vectors.push(vector),
                Ok(Err(e)) => {
                    tracing::warn!(expansion = %expansion, error = %e, "Expansion embedding failed");
                    failed_calls += 1;
                }
                Err(_) => {
                    tracing::warn!(expansion = %expansion, "Expansion embedding timed out");
                    failed_calls += 1;
                }
            }
        }

        // Stage 3: parent retrieval
        let parent_filter = SearchFilter::by_tier(ChunkTier::Parent);
        let mut parent_lists: Vec<RankedList> = Vec::new();
        let mut parent_procedures: AHashSet<String> = AHashSet::new();
        let mut parent_chunk_ids: AHashSet<String> = AHashSet::new();

        for vector in &vectors {
            match timeout(
                self.config.vector_timeout,
                self.vectors
                    .search(vector, self.config.top_k_parent, Some(&parent_filter)),
            )
            .await
            {
                Ok(Ok(hits)) => {
                    let mut items = Vec::with_capacity(hits.len());
                    for hit in hits {
                        if let Ok(chunk) = self.store.get(&hit.chunk_id) {
                            parent_procedures.insert(chunk.procedure_id.clone());
                        }
                        parent_chunk_ids.insert(hit.chunk_id.clone());
                        items.push(FusionCandidate::new(hit.chunk_id, hit.score));
                    }
                    parent_lists.push(RankedList {
                        source: FusionSource::Dense,
                        items,
                    });
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Parent search failed");
                    failed_calls += 1;
                }
                Err(_) => {
                    tracing::warn!("Parent search timed out");
                    failed_calls += 1;
                }
            }
        }

        // Stage 4: child retrieval, soft-restricted to the parent set
        let chunk_types = plan.intent.chunk_type_filter();
        let mut child_lists: Vec<RankedList> = Vec::new();

        for vector in &vectors {
            let hits = match self.child_search(vector, chunk_types).await {
                Some(hits) => hits,
                None => {
                    failed_calls += 1;
                    continue;
                }
            };

            let mut items: Vec<FusionCandidate> = hits
                .into_iter()
                .map(|hit| {
                    let in_parent_set = self
                        .store
                        .get(&hit.chunk_id)
                        .map(|c| parent_procedures.contains(&c.procedure_id))
                        .unwrap_or(false);
                    if in_parent_set {
                        FusionCandidate::new(hit.chunk_id, hit.score)
                    } else {
                        FusionCandidate::penalised(
                            hit.chunk_id,
                            hit.score * self.config.cross_tier_penalty,
                            self.config.cross_tier_penalty,
                        )
                    }
                })
                .collect();

            // The penalty demotes out-of-set candidates within the list
            items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

            child_lists.push(RankedList {
                source: FusionSource::Dense,
                items,
            });
        }

        let failed = vectors.is_empty() || (parent_lists.is_empty() && child_lists.is_empty());
        if failed {
            tracing::warn!(failed_calls, "Dense channel failed");
        }

        DenseOutcome {
            parent_lists,
            child_lists,
            parent_chunks: parent_chunk_ids.len(),
            failed,
        }
    }

    /// One child search, retrying without the chunk-type filter when the
    /// typed search comes back empty
    async fn child_search(
        &self,
        vector: &[f32],
        chunk_types: Option<&'static [crate::store::ChunkType]>,
    ) -> Option<Vec<crate::vector::VectorHit>> {
        let mut filter = SearchFilter::by_tier(ChunkTier::Child);
        if let Some(types) = chunk_types {
            filter = filter.with_chunk_types(types.to_vec());
        }

        let first = timeout(
            self.config.vector_timeout,
            self.vectors
                .search(vector, self.config.top_k_child, Some(&filter)),
        )
        .await;

        match first {
            Ok(Ok(hits)) if hits.is_empty() && chunk_types.is_some() => {
                // Nothing under the typed filter; widen to every child chunk
                let widened = SearchFilter::by_tier(ChunkTier::Child);
                match timeout(
                    self.config.vector_timeout,
                    self.vectors
                        .search(vector, self.config.top_k_child, Some(&widened)),
                )
                .await
                {
                    Ok(Ok(hits)) => Some(hits),
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "Widened child search failed");
                        None
                    }
                    Err(_) => {
                        tracing::warn!("Widened child search timed out");
                        None
                    }
                }
            }
            Ok(Ok(hits)) => Some(hits),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Child search failed");
                None
            }
            Err(_) => {
                tracing::warn!("Child search timed out");
                None
            }
        }
    }

    /// Stage 5: BM25 over the raw question
    async fn lexical_channel(&self, question: &str) -> RankedList {
        let results = self.bm25.search(question, self.config.top_k_child);
        RankedList {
            source: FusionSource::Lexical,
            items: results
                .into_iter()
                .map(|(chunk_id, score)| FusionCandidate::new(chunk_id, score))
                .collect(),
        }
    }

    /// Stage 7: ensemble reranking of the fused top-N
    async fn rerank_stage(
        &self,
        plan: &QueryPlan,
        candidates: &[&RetrievedItem],
    ) -> Vec<ScoredChunk> {
        let rerank_candidates: Vec<RerankCandidate> = candidates
            .iter()
            .filter_map(|item| {
                let chunk = self.store.get(&item.chunk_id).ok()?;
                Some(RerankCandidate {
                    chunk_id: item.chunk_id.clone(),
                    text: chunk.content.clone(),
                    dense_score: item.dense_score,
                    lex_score: item.lexical_score,
                })
            })
            .collect();

        let budget = &plan.context_config;
        let top_k = (budget.chunks * (1 + budget.max_descendants)).min(self.config.rerank_cap);

        let reranked = self
            .reranker
            .rerank(&plan.raw_question, &rerank_candidates, top_k)
            .await;

        let cross_tier: AHashMap<&str, bool> = candidates
            .iter()
            .map(|item| (item.chunk_id.as_str(), item.cross_tier_match))
            .collect();

        reranked
            .into_iter()
            .filter_map(|item| {
                let chunk = self.store.get(&item.chunk_id).ok()?.clone();
                Some(ScoredChunk {
                    cross_tier_match: cross_tier
                        .get(item.chunk_id.as_str())
                        .copied()
                        .unwrap_or(false),
                    chunk,
                    score: item.score,
                    source: RetrievalSource::Reranked,
                })
            })
            .collect()
    }

    /// Stage 2 product: every chunk of the procedure at full confidence,
    /// context assembled under the intent budget
    fn exact_code_result(
        &self,
        plan: &QueryPlan,
        chunk_ids: &[String],
        request_id: &str,
    ) -> RetrievalResult {
        let all: Vec<ScoredChunk> = chunk_ids
            .iter()
            .filter_map(|chunk_id| {
                let chunk = self.store.get(chunk_id).ok()?.clone();
                Some(ScoredChunk {
                    chunk,
                    score: 1.0,
                    source: RetrievalSource::Dense,
                    cross_tier_match: true,
                })
            })
            .collect();

        let num_parent_chunks = all
            .iter()
            .filter(|c| c.chunk.tier == ChunkTier::Parent)
            .count();
        let num_child_chunks = all.len() - num_parent_chunks;

        let assembled = self.assembler.assemble(&all, &plan.context_config, false);

        RetrievalResult {
            chunks: all,
            context: assembled.context,
            confidence: 1.0,
            intent: plan.intent,
            plan: plan.clone(),
            degraded: false,
            metadata: ResultMetadata {
                request_id: request_id.to_string(),
                search_type: SearchType::ExactCodeMatch,
                num_parent_chunks,
                num_child_chunks,
                failed_channels: Vec::new(),
                error: None,
            },
        }
    }

    /// Both channels empty: an empty result the generator turns into a
    /// grounded "no information" answer. Never cached.
    fn no_channels_result(
        &self,
        plan: &QueryPlan,
        request_id: &str,
        dense_failed: bool,
        lexical_empty: bool,
    ) -> RetrievalResult {
        let mut failed_channels = Vec::new();
        if dense_failed {
            failed_channels.push("dense".to_string());
        }
        if lexical_empty {
            failed_channels.push("lexical".to_string());
        }

        RetrievalResult {
            chunks: Vec::new(),
            context: String::new(),
            confidence: 0.0,
            intent: plan.intent,
            plan: plan.clone(),
            degraded: true,
            metadata: ResultMetadata {
                request_id: request_id.to_string(),
                search_type: SearchType::Hybrid,
                num_parent_chunks: 0,
                num_child_chunks: 0,
                failed_channels,
                error: Some(NO_CHANNELS_ERROR.to_string()),
            },
        }
    }

    /// Stage 9: cache successful results only
    fn store_in_cache(
        &self,
        question: &str,
        query_vector: &Option<Vec<f32>>,
        result: &RetrievalResult,
    ) {
        if !self.config.cache_enabled || result.metadata.error.is_some() {
            return;
        }
        if let Some(vector) = query_vector {
            self.cache.put(question, vector.clone(), result.clone());
            tracing::debug!("Result cached");
        }
    }

    // Surface exposed to the generator and the HTTP layer

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cache_clear(&self) {
        self.cache.clear();
    }

    pub fn cache_clear_expired(&self) -> usize {
        self.cache.clear_expired()
    }

    pub fn lexical_stats(&self) -> Bm25Stats {
        self.bm25.stats()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Snapshot of every tunable
    pub fn config(&self) -> &Config {
        &self.full_config
    }
}
