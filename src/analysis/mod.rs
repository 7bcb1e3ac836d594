//! Query analysis types: intents, context budgets and the query plan
//!
//! The intent set is closed; the chunk-type filter and the context budget
//! are lookup tables over it, so no string matching happens on hot paths.

mod analyser;

pub use analyser::QueryAnalyser;

use crate::store::ChunkType;
use serde::{Deserialize, Serialize};

/// Closed set of question intents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Documents,
    Requirements,
    Process,
    Legal,
    Timeline,
    Fees,
    Location,
    Overview,
}

impl Intent {
    pub const ALL: [Intent; 8] = [
        Intent::Documents,
        Intent::Requirements,
        Intent::Process,
        Intent::Legal,
        Intent::Timeline,
        Intent::Fees,
        Intent::Location,
        Intent::Overview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Documents => "documents",
            Intent::Requirements => "requirements",
            Intent::Process => "process",
            Intent::Legal => "legal",
            Intent::Timeline => "timeline",
            Intent::Fees => "fees",
            Intent::Location => "location",
            Intent::Overview => "overview",
        }
    }

    pub fn parse(s: &str) -> Option<Intent> {
        match s.trim().to_lowercase().as_str() {
            "documents" => Some(Intent::Documents),
            "requirements" => Some(Intent::Requirements),
            "process" => Some(Intent::Process),
            "legal" => Some(Intent::Legal),
            "timeline" => Some(Intent::Timeline),
            "fees" => Some(Intent::Fees),
            "location" => Some(Intent::Location),
            "overview" => Some(Intent::Overview),
            _ => None,
        }
    }

    /// Chunk-type filter applied during dense child retrieval; `None` means
    /// no filter (overview)
    pub fn chunk_type_filter(&self) -> Option<&'static [ChunkType]> {
        match self {
            Intent::Documents => Some(&[ChunkType::Documents]),
            Intent::Requirements => Some(&[ChunkType::Requirements]),
            Intent::Process => Some(&[ChunkType::Process]),
            Intent::Legal => Some(&[ChunkType::Legal]),
            Intent::Timeline => Some(&[ChunkType::FeesTiming]),
            Intent::Fees => Some(&[ChunkType::FeesTiming]),
            Intent::Location => Some(&[ChunkType::Agencies]),
            Intent::Overview => None,
        }
    }
}

/// Per-intent context assembly budget
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Top procedures kept in the context
    pub chunks: usize,
    /// Child chunks kept per procedure
    pub max_descendants: usize,
    /// Chunks pulled from other surfaced procedures
    pub max_siblings: usize,
    /// Prepend the parent overview of each kept procedure
    pub include_parents: bool,
    /// Whether the generator should produce structured JSON output
    pub enable_structured_output: bool,
}

/// Budget table per intent
pub fn context_config_for(intent: Intent) -> ContextConfig {
    match intent {
        Intent::Documents => ContextConfig {
            chunks: 2,
            max_descendants: 5,
            max_siblings: 2,
            include_parents: true,
            enable_structured_output: true,
        },
        Intent::Fees => ContextConfig {
            chunks: 2,
            max_descendants: 3,
            max_siblings: 1,
            include_parents: true,
            enable_structured_output: true,
        },
        Intent::Process => ContextConfig {
            chunks: 2,
            max_descendants: 40,
            max_siblings: 5,
            include_parents: true,
            enable_structured_output: true,
        },
        Intent::Legal => ContextConfig {
            chunks: 3,
            max_descendants: 4,
            max_siblings: 3,
            include_parents: true,
            enable_structured_output: true,
        },
        Intent::Timeline => ContextConfig {
            chunks: 3,
            max_descendants: 4,
            max_siblings: 3,
            include_parents: true,
            enable_structured_output: true,
        },
        Intent::Requirements => ContextConfig {
            chunks: 2,
            max_descendants: 2,
            max_siblings: 3,
            include_parents: true,
            enable_structured_output: true,
        },
        Intent::Location => ContextConfig {
            chunks: 2,
            max_descendants: 3,
            max_siblings: 1,
            include_parents: true,
            enable_structured_output: true,
        },
        Intent::Overview => ContextConfig {
            chunks: 3,
            max_descendants: 5,
            max_siblings: 2,
            include_parents: true,
            enable_structured_output: false,
        },
    }
}

/// Per-request query plan produced by the analyser
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlan {
    pub raw_question: String,
    pub intent: Intent,
    pub intent_confidence: f32,
    /// Paraphrases and synonym variants, at most five, first entry is the
    /// (possibly rewritten) question itself
    pub expansions: Vec<String>,
    /// Procedure code detected in the question, e.g. "1.013124"
    pub detected_procedure_code: Option<String>,
    pub context_config: ContextConfig,
}
