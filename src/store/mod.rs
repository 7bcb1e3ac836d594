//! Chunk model and the immutable chunk store
//!
//! The store is loaded once at startup from a single JSON file and is
//! read-only afterwards. It validates the hierarchy invariants at load time
//! and keeps chunks addressable by id and by procedure.

use crate::error::{Result, ThutucError};
use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub mod bm25;

pub use bm25::{Bm25Index, Bm25Stats};

/// Hierarchy tier of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkTier {
    /// Procedure overview, one per procedure
    Parent,
    /// One semantic section of a procedure
    Child,
}

/// Semantic section carried by a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Overview,
    Documents,
    Requirements,
    Process,
    Legal,
    FeesTiming,
    Agencies,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Overview => "overview",
            ChunkType::Documents => "documents",
            ChunkType::Requirements => "requirements",
            ChunkType::Process => "process",
            ChunkType::Legal => "legal",
            ChunkType::FeesTiming => "fees_timing",
            ChunkType::Agencies => "agencies",
        }
    }
}

/// Descriptive metadata attached to every chunk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Procedure name, e.g. "Đăng ký kết hôn"
    #[serde(default)]
    pub procedure_name: String,

    /// Procedure code, e.g. "1.013124"
    #[serde(default)]
    pub procedure_code: String,

    /// Administrative domain, e.g. "Hộ tịch"
    #[serde(default)]
    pub domain: String,

    /// Breadcrumb within the source portal
    #[serde(default)]
    pub breadcrumb: String,

    /// Importance score assigned at chunking time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<f32>,
}

/// An immutable unit of retrievable text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Globally unique, stable across runs
    pub chunk_id: String,

    /// Groups chunks of the same procedure
    pub procedure_id: String,

    pub tier: ChunkTier,

    pub chunk_type: ChunkType,

    /// Id of the parent overview, present on child chunks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_chunk_id: Option<String>,

    pub content: String,

    /// Token count from the chunking tokeniser, strictly positive
    pub token_count: usize,

    #[serde(default)]
    pub metadata: ChunkMetadata,

    /// First ~200 characters of the parent, injected into child chunks to
    /// improve standalone embeddability
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_context: Option<String>,
}

/// Immutable chunk store with id and procedure indexes
pub struct ChunkStore {
    chunks: Vec<Chunk>,
    by_id: AHashMap<String, usize>,
    by_procedure: AHashMap<String, Vec<usize>>,
}

impl ChunkStore {
    /// Load the store from a JSON file and validate its invariants
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ThutucError::Io {
            source: e,
            context: format!("Failed to read chunk file: {:?}", path),
        })?;

        let chunks: Vec<Chunk> = serde_json::from_str(&content).map_err(|e| ThutucError::Json {
            source: e,
            context: format!("Failed to parse chunk file: {:?}", path),
        })?;

        let store = Self::from_chunks(chunks)?;
        tracing::info!(
            chunks = store.len(),
            procedures = store.by_procedure.len(),
            "Chunk store loaded"
        );
        Ok(store)
    }

    /// Build the store from an in-memory chunk list (tests, offline tools)
    pub fn from_chunks(chunks: Vec<Chunk>) -> Result<Self> {
        let mut by_id = AHashMap::with_capacity(chunks.len());
        let mut by_procedure: AHashMap<String, Vec<usize>> = AHashMap::new();

        for (idx, chunk) in chunks.iter().enumerate() {
            if chunk.content.is_empty() {
                return Err(ThutucError::StoreInvariant(format!(
                    "chunk {} has empty content",
                    chunk.chunk_id
                )));
            }
            if chunk.token_count == 0 {
                return Err(ThutucError::StoreInvariant(format!(
                    "chunk {} has zero token_count",
                    chunk.chunk_id
                )));
            }
            match chunk.tier {
                ChunkTier::Parent if chunk.chunk_type != ChunkType::Overview => {
                    return Err(ThutucError::StoreInvariant(format!(
                        "parent chunk {} must carry the overview type",
                        chunk.chunk_id
                    )));
                }
                ChunkTier::Child if chunk.chunk_type == ChunkType::Overview => {
                    return Err(ThutucError::StoreInvariant(format!(
                        "child chunk {} cannot carry the overview type",
                        chunk.chunk_id
                    )));
                }
                _ => {}
            }

            if by_id.insert(chunk.chunk_id.clone(), idx).is_some() {
                return Err(ThutucError::StoreInvariant(format!(
                    "duplicate chunk_id {}",
                    chunk.chunk_id
                )));
            }
            by_procedure
                .entry(chunk.procedure_id.clone())
                .or_default()
                .push(idx);
        }

        // Every child must reference a parent that exists, and every
        // procedure must carry exactly one parent overview
        let parent_ids: AHashSet<&str> = chunks
            .iter()
            .filter(|c| c.tier == ChunkTier::Parent)
            .map(|c| c.chunk_id.as_str())
            .collect();

        for chunk in &chunks {
            if chunk.tier == ChunkTier::Child {
                match &chunk.parent_chunk_id {
                    Some(pid) if parent_ids.contains(pid.as_str()) => {}
                    Some(pid) => {
                        return Err(ThutucError::StoreInvariant(format!(
                            "child chunk {} references missing parent {}",
                            chunk.chunk_id, pid
                        )));
                    }
                    None => {
                        return Err(ThutucError::StoreInvariant(format!(
                            "child chunk {} has no parent reference",
                            chunk.chunk_id
                        )));
                    }
                }
            }
        }

        for (procedure_id, indices) in &by_procedure {
            let parents = indices
                .iter()
                .filter(|&&i| chunks[i].tier == ChunkTier::Parent)
                .count();
            if parents != 1 {
                return Err(ThutucError::StoreInvariant(format!(
                    "procedure {} has {} parent overviews, expected exactly 1",
                    procedure_id, parents
                )));
            }
        }

        // Stable ordering per procedure: parent first, then children by
        // chunk_type, then by id for split sections
        for indices in by_procedure.values_mut() {
            indices.sort_by(|&a, &b| {
                let (ca, cb) = (&chunks[a], &chunks[b]);
                (ca.tier != ChunkTier::Parent, ca.chunk_type, &ca.chunk_id).cmp(&(
                    cb.tier != ChunkTier::Parent,
                    cb.chunk_type,
                    &cb.chunk_id,
                ))
            });
        }

        Ok(Self {
            chunks,
            by_id,
            by_procedure,
        })
    }

    /// Look up a chunk by id
    pub fn get(&self, chunk_id: &str) -> Result<&Chunk> {
        self.by_id
            .get(chunk_id)
            .map(|&idx| &self.chunks[idx])
            .ok_or_else(|| ThutucError::NotFound(format!("chunk {}", chunk_id)))
    }

    /// All chunks of a procedure: parent first, then children in stable
    /// chunk_type order
    pub fn by_procedure(&self, procedure_id: &str) -> Result<Vec<&Chunk>> {
        self.by_procedure
            .get(procedure_id)
            .map(|indices| indices.iter().map(|&i| &self.chunks[i]).collect())
            .ok_or_else(|| ThutucError::NotFound(format!("procedure {}", procedure_id)))
    }

    /// The parent overview chunk of a procedure
    pub fn parent_of(&self, procedure_id: &str) -> Option<&Chunk> {
        self.by_procedure
            .get(procedure_id)?
            .iter()
            .map(|&i| &self.chunks[i])
            .find(|c| c.tier == ChunkTier::Parent)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn num_procedures(&self) -> usize {
        self.by_procedure.len()
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    pub fn parent(procedure_id: &str, content: &str) -> Chunk {
        Chunk {
            chunk_id: format!("{}_parent_overview", procedure_id),
            procedure_id: procedure_id.to_string(),
            tier: ChunkTier::Parent,
            chunk_type: ChunkType::Overview,
            parent_chunk_id: None,
            content: content.to_string(),
            token_count: content.split_whitespace().count().max(1),
            metadata: ChunkMetadata {
                procedure_name: format!("Thủ tục {}", procedure_id),
                procedure_code: procedure_id.to_string(),
                domain: "Hộ tịch".to_string(),
                ..Default::default()
            },
            parent_context: None,
        }
    }

    pub fn child(procedure_id: &str, chunk_type: ChunkType, seq: usize, content: &str) -> Chunk {
        Chunk {
            chunk_id: format!("{}_child_{}_{}", procedure_id, chunk_type.as_str(), seq),
            procedure_id: procedure_id.to_string(),
            tier: ChunkTier::Child,
            chunk_type,
            parent_chunk_id: Some(format!("{}_parent_overview", procedure_id)),
            content: content.to_string(),
            token_count: content.split_whitespace().count().max(1),
            metadata: ChunkMetadata {
                procedure_name: format!("Thủ tục {}", procedure_id),
                procedure_code: procedure_id.to_string(),
                domain: "Hộ tịch".to_string(),
                ..Default::default()
            },
            parent_context: None,
        }
    }
}
