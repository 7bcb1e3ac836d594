//! Startup wiring
//!
//! Constructs the lifecycle objects — chunk store, BM25 index, vector store,
//! collaborator clients, cache — and hands them to the orchestrator. The
//! function blocks until both the store and the BM25 index are ready, so the
//! first query never races the build.

use crate::analysis::QueryAnalyser;
use crate::cache::SemanticCache;
use crate::config::Config;
use crate::embedding::{EmbeddingProvider, OllamaEmbedder};
use crate::error::Result;
use crate::llm::OllamaLlmClient;
use crate::rerank::{CrossEncoder, EnsembleReranker, OllamaCrossEncoder};
use crate::retrieval::RetrievalPipeline;
use crate::store::{Bm25Index, Chunk, ChunkStore};
use crate::vector::{EmbeddingRecord, HnswVectorStore};
use std::sync::Arc;
use std::time::Duration;

/// Build the retrieval pipeline from a validated configuration
pub fn build_pipeline(config: Config) -> Result<RetrievalPipeline> {
    let store = Arc::new(ChunkStore::load(&config.storage.chunks_file)?);
    let bm25 = Arc::new(Bm25Index::build(&store, config.bm25.k1, config.bm25.b));

    let vectors = Arc::new(HnswVectorStore::open(
        &config.storage.vector_dir,
        &store,
        config.embedding.dimension,
        config.vector.hnsw_ef_construction,
        config.vector.hnsw_m,
    )?);

    let embedder = Arc::new(OllamaEmbedder::new(&config.embedding));
    let llm = Arc::new(OllamaLlmClient::new(&config.llm));
    let analyser = QueryAnalyser::new(llm, Duration::from_secs(config.llm.timeout_secs))?;

    let cross_encoder: Option<Arc<dyn CrossEncoder>> = if config.rerank.use_cross_encoder {
        Some(Arc::new(OllamaCrossEncoder::new(
            config.embedding.base_url.clone(),
            config.rerank.model.clone(),
            config.rerank.timeout_secs,
        )))
    } else {
        None
    };

    let reranker = EnsembleReranker::new(
        config.rerank.w_dense,
        config.rerank.w_lex,
        config.rerank.w_ce,
        cross_encoder,
        Duration::from_secs(config.rerank.timeout_secs),
    );

    let cache = Arc::new(SemanticCache::new(
        config.cache.max_size,
        config.cache_ttl(),
        config.cache.similarity_threshold,
    ));

    Ok(RetrievalPipeline::new(
        store, bm25, vectors, embedder, analyser, reranker, cache, config,
    ))
}

/// Offline indexing: embed every chunk and write the vector directory.
/// Child chunks are embedded with their parent context prepended so they
/// stand alone at query time.
pub async fn index_corpus(config: &Config, batch_size: usize) -> Result<usize> {
    let store = ChunkStore::load(&config.storage.chunks_file)?;
    let embedder = OllamaEmbedder::new(&config.embedding);

    let chunks: Vec<&Chunk> = store.iter().collect();
    let mut records: Vec<EmbeddingRecord> = Vec::with_capacity(chunks.len());

    for batch in chunks.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|c| embeddable_text(c)).collect();
        let embeddings = embedder
            .embed_batch(&texts)
            .await
            .map_err(|e| anyhow::anyhow!("Embedding batch failed: {}", e))?;

        for (chunk, vector) in batch.iter().zip(embeddings) {
            records.push(EmbeddingRecord {
                chunk_id: chunk.chunk_id.clone(),
                vector,
            });
        }

        tracing::info!(indexed = records.len(), total = chunks.len(), "Indexing progress");
    }

    HnswVectorStore::write_records(&config.storage.vector_dir, &records)?;
    tracing::info!(
        vectors = records.len(),
        dir = ?config.storage.vector_dir,
        "Vector store written"
    );

    Ok(records.len())
}

/// Content as embedded: child chunks carry the first slice of their parent
fn embeddable_text(chunk: &Chunk) -> String {
    match &chunk.parent_context {
        Some(parent_context) => format!("{}\n\n{}", parent_context, chunk.content),
        None => chunk.content.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_fixtures::child;
    use crate::store::ChunkType;

    #[test]
    fn test_embeddable_text_with_parent_context() {
        let mut c = child("1.000001", ChunkType::Documents, 0, "Nội dung chi tiết");
        c.parent_context = Some("Tổng quan thủ tục".to_string());
        let text = embeddable_text(&c);
        assert!(text.starts_with("Tổng quan thủ tục"));
        assert!(text.ends_with("Nội dung chi tiết"));
    }

    #[test]
    fn test_embeddable_text_without_parent_context() {
        let c = child("1.000001", ChunkType::Documents, 0, "Nội dung chi tiết");
        assert_eq!(embeddable_text(&c), "Nội dung chi tiết");
    }
}
