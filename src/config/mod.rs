//! Configuration management for the retrieval core
//!
//! Every tunable of the pipeline lives here with its default, loadable from a
//! TOML file and overridable through `THUTUC_SECTION__KEY` environment
//! variables. The loaded configuration is validated before use.

use crate::error::{Result, ThutucError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod validator;

pub use validator::ConfigValidator;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub bm25: Bm25Config,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub context: ContextSettings,
}

/// Paths to the persistent state: the chunk file and the vector directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON file holding every chunk, loaded once at startup
    pub chunks_file: PathBuf,
    /// Directory owned by the vector store adapter (populated offline)
    pub vector_dir: PathBuf,
}

/// Embedding collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub base_url: String,
    /// Model name; changing it invalidates the vector store
    pub model: String,
    /// Embedding dimension (1024 for bge-m3)
    pub dimension: usize,
    pub timeout_secs: u64,
}

/// LLM collaborator configuration (query analysis only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
}

/// Okapi BM25 parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bm25Config {
    /// Term saturation parameter
    pub k1: f32,
    /// Length normalization parameter
    pub b: f32,
}

/// HNSW vector index parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    pub hnsw_ef_construction: usize,
    pub hnsw_m: usize,
    pub hnsw_ef_search: usize,
    pub timeout_secs: u64,
}

/// Pipeline-level retrieval tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Parent chunks fetched per expansion (stage 3)
    pub top_k_parent: usize,
    /// Child chunks fetched per expansion and via BM25 (stages 4-5)
    pub top_k_child: usize,
    /// RRF constant
    pub rrf_k: f32,
    /// Multiplier applied to BM25 contributions during fusion
    pub bm25_rrf_boost: f32,
    /// Score multiplier for child candidates outside the parent set
    pub cross_tier_penalty: f32,
    /// Jaccard similarity above which fused candidates are near-duplicates
    pub near_dup_jaccard: f32,
    /// Candidates passed to the reranker (stage 7)
    pub rerank_max_candidates: usize,
    /// Hard cap on reranked results
    pub rerank_cap: usize,
    /// Overall request deadline
    pub request_timeout_secs: u64,
}

/// Ensemble reranker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    /// Call the external cross-encoder; when false its weight is
    /// redistributed and the model is never contacted
    pub use_cross_encoder: bool,
    pub model: String,
    pub w_dense: f32,
    pub w_lex: f32,
    pub w_ce: f32,
    pub timeout_secs: u64,
}

/// Semantic cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_size: usize,
    pub ttl_hours: f64,
    /// Minimum cosine similarity for a semantic hit
    pub similarity_threshold: f32,
}

/// Context assembly limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSettings {
    /// Individual chunks longer than this are head/tail truncated
    pub max_chunk_tokens: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chunks_file: PathBuf::from("data/chunks/all_chunks.json"),
            vector_dir: PathBuf::from("data/vectors"),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "bge-m3".to_string(),
            dimension: 1024,
            timeout_secs: 10,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "qwen3:8b".to_string(),
            temperature: 0.3,
            timeout_secs: 60,
        }
    }
}

impl Default for Bm25Config {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            hnsw_ef_construction: 200,
            hnsw_m: 16,
            hnsw_ef_search: 100,
            timeout_secs: 5,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k_parent: 5,
            top_k_child: 100,
            rrf_k: 60.0,
            bm25_rrf_boost: 1.2,
            cross_tier_penalty: 0.8,
            near_dup_jaccard: 0.95,
            rerank_max_candidates: 50,
            rerank_cap: 20,
            request_timeout_secs: 180,
        }
    }
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            use_cross_encoder: false,
            model: "bge-reranker-v2-m3".to_string(),
            w_dense: 0.55,
            w_lex: 0.35,
            w_ce: 0.10,
            timeout_secs: 15,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 100,
            ttl_hours: 24.0,
            similarity_threshold: 0.92,
        }
    }
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_chunk_tokens: 1200,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            bm25: Bm25Config::default(),
            vector: VectorConfig::default(),
            retrieval: RetrievalConfig::default(),
            rerank: RerankConfig::default(),
            cache: CacheConfig::default(),
            context: ContextSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ThutucError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| ThutucError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();
        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ThutucError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: THUTUC_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(config_key) = key.strip_prefix("THUTUC_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(path: &str, value: &str) -> Result<T> {
            value.parse().map_err(|_| ThutucError::InvalidConfigValue {
                path: path.to_string(),
                message: format!("Cannot parse '{}'", value),
            })
        }

        match path {
            "EMBEDDING__BASE_URL" => self.embedding.base_url = value.to_string(),
            "EMBEDDING__MODEL" => self.embedding.model = value.to_string(),
            "LLM__BASE_URL" => self.llm.base_url = value.to_string(),
            "LLM__MODEL" => self.llm.model = value.to_string(),
            "BM25__K1" => self.bm25.k1 = parse(path, value)?,
            "BM25__B" => self.bm25.b = parse(path, value)?,
            "CACHE__ENABLED" => self.cache.enabled = parse(path, value)?,
            "CACHE__MAX_SIZE" => self.cache.max_size = parse(path, value)?,
            "CACHE__TTL_HOURS" => self.cache.ttl_hours = parse(path, value)?,
            "RERANK__USE_CROSS_ENCODER" => self.rerank.use_cross_encoder = parse(path, value)?,
            "RETRIEVAL__CROSS_TIER_PENALTY" => {
                self.retrieval.cross_tier_penalty = parse(path, value)?
            }
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| ThutucError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("thutuc").join("config.toml"))
    }

    /// Overall request deadline as a `Duration`
    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.retrieval.request_timeout_secs)
    }

    /// Cache TTL as a `Duration`
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.cache.ttl_hours * 3600.0)
    }
}
