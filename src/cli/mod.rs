//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "thutuc",
    version,
    about = "Retrieval core for Vietnamese administrative-procedure Q&A",
    long_about = "Loads a hierarchically chunked corpus of administrative procedures, builds \
                  the BM25 and vector indexes, and answers questions through a nine-stage \
                  hybrid retrieval pipeline with semantic caching."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/thutuc/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Embed every chunk and write the vector store directory (offline)
    Index {
        /// Embedding batch size
        #[arg(short, long, default_value = "32")]
        batch_size: usize,
    },

    /// Answer a question through the retrieval pipeline
    Query {
        /// Question text (Vietnamese)
        question: String,

        /// Session identifier
        #[arg(short, long, default_value = "cli")]
        session: String,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show index, cache and configuration statistics
    Stats,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
