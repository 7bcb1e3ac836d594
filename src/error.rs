use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the thutuc retrieval core
#[derive(Error, Debug)]
pub enum ThutucError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Invalid configuration value
    #[error("Invalid configuration value at {path}: {message}")]
    InvalidConfigValue { path: String, message: String },

    /// Chunk or procedure not found in the store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Chunk store failed its load-time invariants
    #[error("Chunk store invariant violated: {0}")]
    StoreInvariant(String),

    /// Overall request deadline exceeded
    #[error("Request deadline exceeded after {secs}s")]
    Timeout { secs: u64 },

    /// Request was cancelled by the caller
    #[error("Request cancelled")]
    Cancelled,

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// Vector store adapter errors
    #[error("Vector store error: {0}")]
    Vector(#[from] crate::vector::VectorStoreError),

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type for thutuc operations
pub type Result<T> = std::result::Result<T, ThutucError>;
