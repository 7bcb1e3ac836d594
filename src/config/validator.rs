use crate::config::Config;
use crate::error::{Result, ThutucError, ValidationError};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_storage(config, &mut errors);
        Self::validate_embedding(config, &mut errors);
        Self::validate_llm(config, &mut errors);
        Self::validate_bm25(config, &mut errors);
        Self::validate_vector(config, &mut errors);
        Self::validate_retrieval(config, &mut errors);
        Self::validate_rerank(config, &mut errors);
        Self::validate_cache(config, &mut errors);
        Self::validate_context(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ThutucError::ConfigValidation { errors })
        }
    }

    fn validate_storage(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.storage.chunks_file.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.chunks_file",
                "Chunks file path cannot be empty",
            ));
        }

        if config.storage.vector_dir.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.vector_dir",
                "Vector directory path cannot be empty",
            ));
        }
    }

    fn validate_embedding(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.embedding.model.is_empty() {
            errors.push(ValidationError::new(
                "embedding.model",
                "Model name cannot be empty",
            ));
        }

        if config.embedding.dimension == 0 {
            errors.push(ValidationError::new(
                "embedding.dimension",
                "Embedding dimension must be greater than 0",
            ));
        }

        if config.embedding.timeout_secs == 0 {
            errors.push(ValidationError::new(
                "embedding.timeout_secs",
                "Embedder timeout must be greater than 0",
            ));
        }
    }

    fn validate_llm(config: &Config, errors: &mut Vec<ValidationError>) {
        let temp = config.llm.temperature;
        if !(0.0..=2.0).contains(&temp) {
            errors.push(ValidationError::new(
                "llm.temperature",
                format!("Temperature must be between 0.0 and 2.0, got {}", temp),
            ));
        }

        if config.llm.model.is_empty() {
            errors.push(ValidationError::new(
                "llm.model",
                "Model name cannot be empty",
            ));
        }
    }

    fn validate_bm25(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.bm25.k1 <= 0.0 {
            errors.push(ValidationError::new(
                "bm25.k1",
                format!("k1 must be positive, got {}", config.bm25.k1),
            ));
        }

        if !(0.0..=1.0).contains(&config.bm25.b) {
            errors.push(ValidationError::new(
                "bm25.b",
                format!("b must be in [0, 1], got {}", config.bm25.b),
            ));
        }
    }

    fn validate_vector(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.vector.hnsw_ef_construction == 0 {
            errors.push(ValidationError::new(
                "vector.hnsw_ef_construction",
                "HNSW ef_construction must be greater than 0",
            ));
        }

        if config.vector.hnsw_m == 0 {
            errors.push(ValidationError::new(
                "vector.hnsw_m",
                "HNSW M must be greater than 0",
            ));
        }

        if config.vector.hnsw_ef_search == 0 {
            errors.push(ValidationError::new(
                "vector.hnsw_ef_search",
                "HNSW ef_search must be greater than 0",
            ));
        }
    }

    fn validate_retrieval(config: &Config, errors: &mut Vec<ValidationError>) {
        let r = &config.retrieval;

        if r.top_k_parent == 0 {
            errors.push(ValidationError::new(
                "retrieval.top_k_parent",
                "top_k_parent must be greater than 0",
            ));
        }

        if r.top_k_child == 0 {
            errors.push(ValidationError::new(
                "retrieval.top_k_child",
                "top_k_child must be greater than 0",
            ));
        }

        if r.rrf_k <= 0.0 {
            errors.push(ValidationError::new(
                "retrieval.rrf_k",
                format!("RRF k must be positive, got {}", r.rrf_k),
            ));
        }

        if !(0.0..=1.0).contains(&r.cross_tier_penalty) {
            errors.push(ValidationError::new(
                "retrieval.cross_tier_penalty",
                format!("Penalty must be in [0, 1], got {}", r.cross_tier_penalty),
            ));
        }

        if !(0.0..=1.0).contains(&r.near_dup_jaccard) {
            errors.push(ValidationError::new(
                "retrieval.near_dup_jaccard",
                format!("Jaccard threshold must be in [0, 1], got {}", r.near_dup_jaccard),
            ));
        }

        if r.request_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "retrieval.request_timeout_secs",
                "Request deadline must be greater than 0",
            ));
        }
    }

    fn validate_rerank(config: &Config, errors: &mut Vec<ValidationError>) {
        let r = &config.rerank;

        // Weights need not sum to 1 (the reranker normalises) but each must
        // be non-negative and at least one positive
        for (path, w) in [
            ("rerank.w_dense", r.w_dense),
            ("rerank.w_lex", r.w_lex),
            ("rerank.w_ce", r.w_ce),
        ] {
            if w < 0.0 {
                errors.push(ValidationError::new(
                    path,
                    format!("Weight must be non-negative, got {}", w),
                ));
            }
        }

        if r.w_dense + r.w_lex + r.w_ce <= 0.0 {
            errors.push(ValidationError::new(
                "rerank",
                "At least one ensemble weight must be positive",
            ));
        }

        if r.use_cross_encoder && r.model.is_empty() {
            errors.push(ValidationError::new(
                "rerank.model",
                "Cross-encoder model cannot be empty when enabled",
            ));
        }
    }

    fn validate_cache(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.cache.max_size == 0 {
            errors.push(ValidationError::new(
                "cache.max_size",
                "Cache max size must be greater than 0",
            ));
        }

        if config.cache.ttl_hours <= 0.0 {
            errors.push(ValidationError::new(
                "cache.ttl_hours",
                format!("TTL must be positive, got {}", config.cache.ttl_hours),
            ));
        }

        let sim = config.cache.similarity_threshold;
        if !(0.0..=1.0).contains(&sim) {
            errors.push(ValidationError::new(
                "cache.similarity_threshold",
                format!("Similarity threshold must be in [0, 1], got {}", sim),
            ));
        }
    }

    fn validate_context(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.context.max_chunk_tokens == 0 {
            errors.push(ValidationError::new(
                "context.max_chunk_tokens",
                "max_chunk_tokens must be greater than 0",
            ));
        }
    }
}
