//! Vector store adapter
//!
//! k-nearest-neighbour search over precomputed embeddings with metadata
//! filtering over `tier`, `chunk_type` and `procedure_id`. Embeddings are
//! populated offline into a local directory owned by the adapter; nothing is
//! written at query time.
//!
//! The HNSW library has no native payload filters, so the adapter keeps its
//! own payload table and filters candidates itself, over-fetching from the
//! index until the requested `k` survives the filter.

use crate::store::{ChunkStore, ChunkTier, ChunkType};
use ahash::AHashMap;
use async_trait::async_trait;
use hnsw_rs::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VectorStoreError {
    #[error("Vector store initialization failed: {0}")]
    InitializationError(String),

    #[error("Search failed: {0}")]
    SearchError(String),

    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Conjunction of metadata predicates applied to candidates
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub tier: Option<ChunkTier>,
    pub chunk_types: Option<Vec<ChunkType>>,
    pub procedure_ids: Option<Vec<String>>,
}

impl SearchFilter {
    pub fn by_tier(tier: ChunkTier) -> Self {
        Self {
            tier: Some(tier),
            ..Default::default()
        }
    }

    pub fn by_procedure(procedure_id: impl Into<String>) -> Self {
        Self {
            procedure_ids: Some(vec![procedure_id.into()]),
            ..Default::default()
        }
    }

    pub fn with_chunk_types(mut self, chunk_types: Vec<ChunkType>) -> Self {
        self.chunk_types = Some(chunk_types);
        self
    }

    fn matches(&self, payload: &Payload) -> bool {
        if let Some(tier) = self.tier {
            if payload.tier != tier {
                return false;
            }
        }
        if let Some(types) = &self.chunk_types {
            if !types.contains(&payload.chunk_type) {
                return false;
            }
        }
        if let Some(procedures) = &self.procedure_ids {
            if !procedures.iter().any(|p| p == &payload.procedure_id) {
                return false;
            }
        }
        true
    }
}

/// A search hit addressed by chunk id
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    /// Cosine similarity (0.0 to 1.0, higher is more similar)
    pub score: f32,
}

/// Vector search seam consumed by the orchestrator
#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// k-nearest-neighbour search with optional metadata filter
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<VectorHit>, VectorStoreError>;

    /// Return every chunk matching the filter (exact-code fast path), parents
    /// first, then children by chunk id
    async fn scroll(&self, filter: &SearchFilter) -> Result<Vec<VectorHit>, VectorStoreError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Metadata held per indexed vector, mirroring the chunk store
#[derive(Debug, Clone)]
struct Payload {
    chunk_id: String,
    procedure_id: String,
    tier: ChunkTier,
    chunk_type: ChunkType,
}

/// One persisted embedding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub chunk_id: String,
    pub vector: Vec<f32>,
}

const EMBEDDINGS_FILE: &str = "embeddings.json";

/// HNSW-backed vector store with payload filtering
pub struct HnswVectorStore {
    index: Hnsw<'static, f32, DistCosine>,
    payloads: Vec<Payload>,
    by_chunk_id: AHashMap<String, usize>,
    dimension: usize,
}

impl HnswVectorStore {
    /// Open the vector directory and build the in-memory index
    ///
    /// Every embedding must reference a chunk present in the store; the
    /// payload table is derived from the chunk store at load time.
    pub fn open(
        dir: &Path,
        store: &ChunkStore,
        dimension: usize,
        ef_construction: usize,
        m: usize,
    ) -> Result<Self, VectorStoreError> {
        let path = dir.join(EMBEDDINGS_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            VectorStoreError::InitializationError(format!(
                "Cannot read embeddings file {:?}: {}",
                path, e
            ))
        })?;
        let records: Vec<EmbeddingRecord> = serde_json::from_str(&content)
            .map_err(|e| VectorStoreError::SerializationError(e.to_string()))?;

        Self::from_records(records, store, dimension, ef_construction, m)
    }

    /// Build the index from in-memory records (tests, offline indexing)
    pub fn from_records(
        records: Vec<EmbeddingRecord>,
        store: &ChunkStore,
        dimension: usize,
        ef_construction: usize,
        m: usize,
    ) -> Result<Self, VectorStoreError> {
        let index = Hnsw::<f32, DistCosine>::new(
            m,
            dimension,
            ef_construction,
            200, // max_nb_connection
            DistCosine,
        );

        let mut payloads = Vec::with_capacity(records.len());
        let mut by_chunk_id = AHashMap::with_capacity(records.len());

        for record in records {
            if record.vector.len() != dimension {
                return Err(VectorStoreError::InvalidDimension {
                    expected: dimension,
                    actual: record.vector.len(),
                });
            }

            let chunk = store.get(&record.chunk_id).map_err(|_| {
                VectorStoreError::InitializationError(format!(
                    "Embedding references unknown chunk {}",
                    record.chunk_id
                ))
            })?;

            let internal_id = payloads.len();
            index.insert((&record.vector, internal_id));
            by_chunk_id.insert(record.chunk_id.clone(), internal_id);
            payloads.push(Payload {
                chunk_id: record.chunk_id,
                procedure_id: chunk.procedure_id.clone(),
                tier: chunk.tier,
                chunk_type: chunk.chunk_type,
            });
        }

        tracing::info!(vectors = payloads.len(), dimension, "Vector store ready");

        Ok(Self {
            index,
            payloads,
            by_chunk_id,
            dimension,
        })
    }

    /// Persist embedding records into the adapter's directory (offline
    /// indexing only)
    pub fn write_records(dir: &Path, records: &[EmbeddingRecord]) -> Result<(), VectorStoreError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(EMBEDDINGS_FILE);
        let content = serde_json::to_string(records)
            .map_err(|e| VectorStoreError::SerializationError(e.to_string()))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.by_chunk_id.contains_key(chunk_id)
    }
}

#[async_trait]
impl VectorSearch for HnswVectorStore {
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<VectorHit>, VectorStoreError> {
        if vector.len() != self.dimension {
            return Err(VectorStoreError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if k == 0 || self.payloads.is_empty() {
            return Ok(Vec::new());
        }

        // With a filter, over-fetch and widen until k candidates survive or
        // the whole index has been considered
        let mut fetch = if filter.is_some() {
            (k * 4).min(self.payloads.len())
        } else {
            k.min(self.payloads.len())
        };

        loop {
            let ef_search = fetch.max(k) * 2;
            let neighbours = self.index.search(vector, fetch, ef_search);

            let hits: Vec<VectorHit> = neighbours
                .iter()
                .filter_map(|n| {
                    let payload = self.payloads.get(n.d_id)?;
                    if let Some(f) = filter {
                        if !f.matches(payload) {
                            return None;
                        }
                    }
                    Some(VectorHit {
                        chunk_id: payload.chunk_id.clone(),
                        score: 1.0 - n.distance,
                    })
                })
                .take(k)
                .collect();

            if hits.len() >= k || fetch >= self.payloads.len() {
                return Ok(hits);
            }
            fetch = (fetch * 2).min(self.payloads.len());
        }
    }

    async fn scroll(&self, filter: &SearchFilter) -> Result<Vec<VectorHit>, VectorStoreError> {
        let mut matched: Vec<&Payload> = self
            .payloads
            .iter()
            .filter(|p| filter.matches(p))
            .collect();

        matched.sort_by(|a, b| {
            (a.tier != ChunkTier::Parent, &a.chunk_id).cmp(&(b.tier != ChunkTier::Parent, &b.chunk_id))
        });

        Ok(matched
            .into_iter()
            .map(|p| VectorHit {
                chunk_id: p.chunk_id.clone(),
                score: 1.0,
            })
            .collect())
    }

    fn len(&self) -> usize {
        self.payloads.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_fixtures::{child, parent};

    fn axis_vector(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    fn sample() -> (ChunkStore, HnswVectorStore) {
        let store = ChunkStore::from_chunks(vec![
            parent("1.000001", "Tổng quan đăng ký kết hôn"),
            child("1.000001", ChunkType::Documents, 0, "Giấy tờ kết hôn"),
            parent("1.000002", "Tổng quan đăng ký kinh doanh"),
            child("1.000002", ChunkType::FeesTiming, 0, "Lệ phí kinh doanh"),
        ])
        .unwrap();

        let records = vec![
            EmbeddingRecord {
                chunk_id: "1.000001_parent_overview".to_string(),
                vector: axis_vector(8, 0),
            },
            EmbeddingRecord {
                chunk_id: "1.000001_child_documents_0".to_string(),
                vector: axis_vector(8, 1),
            },
            EmbeddingRecord {
                chunk_id: "1.000002_parent_overview".to_string(),
                vector: axis_vector(8, 2),
            },
            EmbeddingRecord {
                chunk_id: "1.000002_child_fees_timing_0".to_string(),
                vector: axis_vector(8, 3),
            },
        ];

        let vectors = HnswVectorStore::from_records(records, &store, 8, 200, 16).unwrap();
        (store, vectors)
    }

    #[tokio::test]
    async fn test_search_nearest() {
        let (_store, vectors) = sample();

        let hits = vectors.search(&axis_vector(8, 1), 1, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "1.000001_child_documents_0");
        assert!(hits[0].score > 0.9);
    }

    #[tokio::test]
    async fn test_search_tier_filter() {
        let (_store, vectors) = sample();

        let filter = SearchFilter::by_tier(ChunkTier::Parent);
        let hits = vectors
            .search(&axis_vector(8, 1), 4, Some(&filter))
            .await
            .unwrap();

        assert!(!hits.is_empty());
        assert!(hits
            .iter()
            .all(|h| h.chunk_id.ends_with("_parent_overview")));
    }

    #[tokio::test]
    async fn test_search_chunk_type_filter() {
        let (_store, vectors) = sample();

        let filter =
            SearchFilter::by_tier(ChunkTier::Child).with_chunk_types(vec![ChunkType::FeesTiming]);
        let hits = vectors
            .search(&axis_vector(8, 3), 4, Some(&filter))
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "1.000002_child_fees_timing_0");
    }

    #[tokio::test]
    async fn test_scroll_by_procedure() {
        let (_store, vectors) = sample();

        let hits = vectors
            .scroll(&SearchFilter::by_procedure("1.000001"))
            .await
            .unwrap();

        assert_eq!(hits.len(), 2);
        // Parent sorts first
        assert_eq!(hits[0].chunk_id, "1.000001_parent_overview");
        assert!(hits.iter().all(|h| h.score == 1.0));
    }

    #[tokio::test]
    async fn test_dimension_check() {
        let (_store, vectors) = sample();
        let result = vectors.search(&[1.0, 0.0], 1, None).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_chunk_rejected() {
        let store = ChunkStore::from_chunks(vec![parent("1.000001", "A")]).unwrap();
        let records = vec![EmbeddingRecord {
            chunk_id: "missing".to_string(),
            vector: vec![0.0; 8],
        }];
        assert!(HnswVectorStore::from_records(records, &store, 8, 200, 16).is_err());
    }
}
