use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use docqa_core::{
    load_config, EngineConfig, IndexSettings, IngestRequest, MetadataFilter, MetadataValue,
    RagEngine, RetrievalRequest,
};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "docqa", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML config file; built-in defaults are used when absent.
    #[arg(long, env = "DOCQA_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Keep the index in this JSON Lines snapshot file.
    #[arg(long, env = "DOCQA_SNAPSHOT", global = true, conflicts_with = "qdrant_url")]
    snapshot: Option<PathBuf>,

    /// Use a Qdrant collection at this base URL instead of a local index.
    #[arg(long, env = "DOCQA_QDRANT_URL", global = true)]
    qdrant_url: Option<String>,

    /// Qdrant collection name.
    #[arg(long, env = "DOCQA_QDRANT_COLLECTION", default_value = "docqa_chunks", global = true)]
    qdrant_collection: String,

    /// Chunk window size in tokens.
    #[arg(long, env = "DOCQA_CHUNK_SIZE", global = true)]
    chunk_size: Option<usize>,

    /// Tokens shared between consecutive chunks.
    #[arg(long, env = "DOCQA_CHUNK_OVERLAP", global = true)]
    chunk_overlap: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest one file, or every supported file under a folder.
    Ingest {
        /// File or folder (.txt, .md, .pdf).
        #[arg(long)]
        path: PathBuf,
        /// Extra metadata for a single file, as key=value. Repeatable.
        /// Integer, float, and true/false values are typed; quote to keep text.
        #[arg(long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, MetadataValue)>,
    },
    /// Remove a document and all of its chunks.
    Remove {
        #[arg(long)]
        document_id: String,
    },
    /// Retrieve chunks and print the assembled context with citations.
    Query {
        #[arg(long)]
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        score_threshold: Option<f32>,
        #[arg(long)]
        max_context_tokens: Option<usize>,
        /// Metadata equality filter, as key=value. Repeatable.
        /// Values are typed like `--meta` values.
        #[arg(long = "filter", value_parser = parse_key_value)]
        filters: Vec<(String, MetadataValue)>,
    },
    /// Print index and ingestion counters.
    Stats,
}

fn parse_key_value(raw: &str) -> Result<(String, MetadataValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in `{raw}`"));
    }
    Ok((key.trim().to_string(), parse_metadata_value(value)))
}

/// Reads a literal the way stored metadata is typed, so `page=3` matches an
/// integer page number. Surrounding double quotes force text.
fn parse_metadata_value(raw: &str) -> MetadataValue {
    if let Some(text) = raw
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        return MetadataValue::Text(text.to_string());
    }
    if let Ok(integer) = raw.parse::<i64>() {
        return MetadataValue::Integer(integer);
    }
    match raw {
        "true" => return MetadataValue::Bool(true),
        "false" => return MetadataValue::Bool(false),
        _ => {}
    }
    match raw.parse::<f64>() {
        Ok(float) if float.is_finite() => MetadataValue::Float(float),
        _ => MetadataValue::Text(raw.to_string()),
    }
}

fn resolve_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    if let Some(path) = &cli.snapshot {
        config.index = IndexSettings::Snapshot { path: path.clone() };
    }
    if let Some(url) = &cli.qdrant_url {
        config.index = IndexSettings::Qdrant {
            url: url.clone(),
            collection: cli.qdrant_collection.clone(),
        };
    }
    if let Some(chunk_size) = cli.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(chunk_overlap) = cli.chunk_overlap {
        config.chunk_overlap = chunk_overlap;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    let engine = RagEngine::from_config(config)
        .await
        .context("starting engine")?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "docqa boot"
    );

    let result = run(&engine, cli.command).await;
    engine.shutdown().await;
    result
}

async fn run(engine: &RagEngine, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Ingest { path, metadata } => {
            if path.is_dir() {
                if !metadata.is_empty() {
                    warn!("--meta is ignored for folder ingestion");
                }
                let report = engine.ingest_folder(&path).await?;
                for outcome in &report.completed {
                    let status = if outcome.unchanged { "unchanged" } else { "indexed" };
                    println!(
                        "{status} document_id={} chunks={} source={}",
                        outcome.document_id, outcome.chunk_count, outcome.source_uri
                    );
                }
                for skipped in &report.skipped {
                    println!("failed source={} reason={}", skipped.source_uri, skipped.reason);
                }
                println!(
                    "{} documents ({} unchanged), {} chunks, {} failed at {}",
                    report.completed.len(),
                    report.unchanged(),
                    report.chunk_count(),
                    report.skipped.len(),
                    Utc::now().to_rfc3339()
                );
            } else {
                let request = metadata.into_iter().fold(
                    IngestRequest::new(path.to_string_lossy()),
                    |request, (key, value)| request.with_metadata(key, value),
                );
                let outcome = engine.ingest_source(request).await?;
                let status = if outcome.unchanged { "unchanged" } else { "indexed" };
                println!(
                    "{status} document_id={} chunks={} source={}",
                    outcome.document_id, outcome.chunk_count, outcome.source_uri
                );
            }
        }
        Command::Remove { document_id } => {
            let removed = engine.remove_document(&document_id).await?;
            println!("removed document_id={document_id} chunks={removed}");
        }
        Command::Query {
            query,
            top_k,
            score_threshold,
            max_context_tokens,
            filters,
        } => {
            let config = engine.config();
            let mut request = RetrievalRequest::new(
                query,
                top_k.unwrap_or(config.top_k),
                score_threshold.unwrap_or(config.score_threshold),
            );
            if !filters.is_empty() {
                let filter = filters
                    .into_iter()
                    .fold(MetadataFilter::new(), |filter, (key, value)| filter.with(key, value));
                request = request.with_filter(filter);
            }

            let session = engine
                .query_with(request, max_context_tokens.unwrap_or(config.max_context_tokens))
                .await?;

            println!("query: {}", session.query_text);
            if session.retrieved.is_empty() {
                println!("no matching chunks");
                return Ok(());
            }
            for result in &session.retrieved {
                println!(
                    "#{} score={:.4} chunk={} document_id={} seq={}",
                    result.rank, result.score, result.chunk_id, result.document_id, result.sequence_index
                );
                if let Some(source) = result.source_uri() {
                    println!("  source={source}");
                }
            }
            println!("\ncontext:\n{}", session.assembled_context);
            for (marker, citation) in &session.citations {
                println!(
                    "{marker} chunk={} document_id={} source={}",
                    citation.chunk_id,
                    citation.document_id,
                    citation.source_uri.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Stats => {
            let stats = engine.stats().await?;
            println!(
                "backend={} index_entries={} documents={} chunks={} failed={}",
                stats.backend, stats.index_entries, stats.documents, stats.chunks, stats.failed
            );
        }
    }

    Ok(())
}
