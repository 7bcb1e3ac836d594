use thutuc::cli::{Cli, Commands, ConfigAction};
use thutuc::config::Config;
use thutuc::error::{Result, ThutucError};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Index { batch_size } => cmd_index(cli.config, batch_size).await,
        Commands::Query {
            question,
            session,
            json,
        } => cmd_query(cli.config, &question, &session, json).await,
        Commands::Stats => cmd_stats(cli.config).await,
        Commands::Config { action } => cmd_config(cli.config, action),
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "thutuc=debug" } else { "thutuc=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt().with_env_filter(filter).with_target(false).init();
}

async fn cmd_index(config_path: Option<std::path::PathBuf>, batch_size: usize) -> Result<()> {
    let config = load_config(config_path)?;

    tracing::info!(chunks_file = ?config.storage.chunks_file, "Indexing corpus");
    let indexed = thutuc::bootstrap::index_corpus(&config, batch_size).await?;

    println!("✓ Indexed {} chunks into {:?}", indexed, config.storage.vector_dir);
    Ok(())
}

async fn cmd_query(
    config_path: Option<std::path::PathBuf>,
    question: &str,
    session: &str,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let pipeline = thutuc::bootstrap::build_pipeline(config)?;

    let result = pipeline.retrieve(session, question).await?;

    if json {
        let serialized =
            serde_json::to_string_pretty(&result).map_err(|e| ThutucError::Json {
                source: e,
                context: "Failed to serialize result".to_string(),
            })?;
        println!("{}", serialized);
        return Ok(());
    }

    println!("Intent:     {}", result.intent.as_str());
    println!("Confidence: {:.2}", result.confidence);
    if result.degraded {
        println!("Degraded:   yes ({})", result.metadata.failed_channels.join(", "));
    }
    if let Some(error) = &result.metadata.error {
        println!("Error:      {}", error);
    }

    println!("\nRetrieved {} chunks:", result.chunks.len());
    for (i, scored) in result.chunks.iter().enumerate() {
        let preview: String = scored.chunk.content.chars().take(80).collect();
        println!(
            "  {}. [{:.3}] {} — {}",
            i + 1,
            scored.score,
            scored.chunk.chunk_id,
            preview
        );
    }

    println!("\n--- Context ---\n{}", result.context);
    Ok(())
}

async fn cmd_stats(config_path: Option<std::path::PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let pipeline = thutuc::bootstrap::build_pipeline(config)?;

    let bm25 = pipeline.lexical_stats();
    println!("BM25 index");
    println!("  documents:      {}", bm25.num_docs);
    println!("  vocabulary:     {}", bm25.vocab_size);
    println!("  avg doc length: {:.1}", bm25.avg_doc_length);
    println!("  k1: {}  b: {}", bm25.k1, bm25.b);

    let cache = pipeline.cache_stats();
    println!("\nSemantic cache");
    println!("  size:     {}/{}", cache.size, cache.max_size);
    println!("  hit rate: {:.1}%", cache.hit_rate * 100.0);

    let config_json =
        serde_json::to_string_pretty(pipeline.config()).map_err(|e| ThutucError::Json {
            source: e,
            context: "Failed to serialize config".to_string(),
        })?;
    println!("\nConfiguration\n{}", config_json);
    Ok(())
}

fn cmd_config(config_path: Option<std::path::PathBuf>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(config_path)?;
            let json = serde_json::to_string_pretty(&config).map_err(|e| ThutucError::Json {
                source: e,
                context: "Failed to serialize config".to_string(),
            })?;
            println!("{}", json);
        }
        ConfigAction::Init { force } => {
            let path = Config::default_path()?;

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| ThutucError::Io {
                    source: e,
                    context: format!("Failed to create config directory: {:?}", parent),
                })?;
            }

            let config = Config::default();
            config.save(&path)?;
            println!("✓ Configuration initialized at: {}", path.display());
        }
        ConfigAction::Validate { file } => {
            let path = match file {
                Some(path) => path,
                None => Config::default_path()?,
            };
            Config::load(&path)?;
            println!("✓ Configuration is valid");
        }
    }

    Ok(())
}

fn load_config(config_path: Option<std::path::PathBuf>) -> Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if !path.exists() {
        tracing::warn!(
            "Config file not found, using defaults. Run 'thutuc config init' to create one."
        );
        let mut config = Config::default();
        config.apply_env_overrides();
        return Ok(config);
    }

    Config::load(&path)
}
