//! # Libris CLI (`libris`)
//!
//! The `libris` binary is the primary interface for Libris. It provides
//! commands for database initialization, document ingestion, querying,
//! configuration inspection, dead-letter inspection, and starting the
//! HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! libris --config ./config/libris.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `libris init` | Create the SQLite database and run schema migrations |
//! | `libris ingest <file>` | Register and ingest a text document |
//! | `libris query "<question>"` | Run the full retrieval + generation pipeline |
//! | `libris config show` | Print the RAG configuration defaults |
//! | `libris config reset` | Print the documented default configuration |
//! | `libris dlq` | List dead-lettered ingestion jobs |
//! | `libris serve` | Start the HTTP API server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use libris::config::{load_config, Config};
use libris::config_store::{ConfigStore, RagConfig};
use libris::embedding::create_provider;
use libris::generator::create_generator;
use libris::models::QueryRequest;
use libris::pipeline::QueryPipeline;
use libris::server::{self, AppState};
use libris::{db, ingest, migrate};

/// Libris CLI — a hybrid lexical + vector retrieval pipeline with
/// grounded, cited answer generation.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/libris.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "libris",
    about = "Libris — hybrid document retrieval with grounded answer generation",
    version,
    long_about = "Libris ingests text documents into paired lexical (FTS5) and vector indices, \
    answers questions by fusing both result lists with Reciprocal Rank Fusion, and generates \
    structured, cited answers gated on retrieval quality and model confidence."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/libris.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (documents, chunks, chunks_fts, chunk_vectors, dead_letters).
    /// This command is idempotent — running it multiple times is safe.
    Init,

    /// Ingest a text document.
    ///
    /// Reads the file, registers a document row, chunks and (if an
    /// embedding provider is configured) embeds the text, and writes
    /// both indices atomically. Failed jobs are retried and finally
    /// dead-lettered.
    Ingest {
        /// Path to a UTF-8 text file. Form-feed characters are treated
        /// as page breaks.
        file: PathBuf,

        /// Document title; defaults to the file name.
        #[arg(long)]
        title: Option<String>,

        /// Document author.
        #[arg(long, default_value = "unknown")]
        author: String,

        /// Treat every occurrence of this string as a page break, in
        /// addition to form-feed characters already in the file.
        #[arg(long)]
        page_break: Option<String>,
    },

    /// Ask a question against the indexed documents.
    ///
    /// Runs dual retrieval, rank fusion, the retrieval gate, sanitized
    /// context formatting, generation, and the confidence gate. Prints
    /// the answer or fallback message as JSON.
    Query {
        /// The question to answer.
        query: String,

        /// Restrict retrieval to a single document id.
        #[arg(long)]
        scope: Option<i64>,

        /// Number of fused chunks to hand to the generator.
        #[arg(long)]
        top_k: Option<i64>,
    },

    /// Inspect the RAG configuration.
    ///
    /// The live configuration is process state of the HTTP server; this
    /// command prints the documented defaults a fresh process starts
    /// with. Use `PUT /config` against a running server to tune it.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// List dead-lettered ingestion jobs.
    Dlq,

    /// Start the HTTP API server.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// query, config, and dead-letter endpoints.
    Serve,
}

/// Configuration subcommands.
#[derive(Subcommand)]
enum ConfigAction {
    /// Print the startup configuration values.
    Show,
    /// Print the documented defaults (what reset restores).
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Config { action } = &cli.command {
        let defaults = RagConfig::default();
        match action {
            ConfigAction::Show | ConfigAction::Reset => {
                println!("{}", serde_json::to_string_pretty(&defaults)?);
            }
        }
        return Ok(());
    }

    let cfg = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            file,
            title,
            author,
            page_break,
        } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;

            let mut text = std::fs::read_to_string(&file)?;
            if let Some(marker) = page_break.filter(|m| !m.is_empty()) {
                text = text.replace(&marker, "\u{0C}");
            }
            let title = title.unwrap_or_else(|| {
                file.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "untitled".to_string())
            });
            let storage_ref = file.to_string_lossy().into_owned();

            let embedder = if cfg.embedding.is_enabled() {
                Some(create_provider(&cfg.embedding)?)
            } else {
                None
            };

            let document_id =
                ingest::create_document(&pool, &title, &author, &storage_ref).await?;
            let stats = ingest::ingest_with_retries(
                &pool,
                &cfg,
                document_id,
                &storage_ref,
                &text,
                embedder.as_deref(),
            )
            .await?;

            println!(
                "Ingested document {} ({}): {} chunks, {} vectors, {} outline entries",
                stats.document_id, title, stats.chunks, stats.vectors, stats.outline_entries
            );
        }
        Commands::Query { query, scope, top_k } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;

            let pipeline = build_pipeline(&cfg, pool)?;
            let request = QueryRequest {
                query,
                scope_id: scope,
                top_k,
            };
            let response = pipeline.answer(&request).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Dlq => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;

            let letters = ingest::list_dead_letters(&pool).await?;
            if letters.is_empty() {
                println!("No dead-lettered jobs.");
            } else {
                for letter in letters {
                    println!(
                        "#{} document={} ref={} retries={} at={}: {}",
                        letter.id,
                        letter.document_id,
                        letter.storage_ref,
                        letter.retry_count,
                        letter.created_at,
                        letter.error_message
                    );
                }
            }
        }
        Commands::Serve => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;

            let config_store = Arc::new(ConfigStore::new());
            let pipeline = build_pipeline_with_store(&cfg, pool.clone(), config_store.clone())?;
            let state = Arc::new(AppState {
                pool,
                config_store,
                pipeline,
            });
            server::serve(state, &cfg.server.bind).await?;
        }
        Commands::Config { .. } => unreachable!("handled above"),
    }

    Ok(())
}

fn build_pipeline(cfg: &Config, pool: sqlx::SqlitePool) -> anyhow::Result<QueryPipeline> {
    build_pipeline_with_store(cfg, pool, Arc::new(ConfigStore::new()))
}

fn build_pipeline_with_store(
    cfg: &Config,
    pool: sqlx::SqlitePool,
    config_store: Arc<ConfigStore>,
) -> anyhow::Result<QueryPipeline> {
    let embedder = if cfg.embedding.is_enabled() {
        Some(create_provider(&cfg.embedding)?)
    } else {
        None
    };
    let generator = if cfg.generation.is_enabled() {
        Some(create_generator(&cfg.generation)?)
    } else {
        None
    };

    Ok(QueryPipeline::new(
        pool,
        config_store,
        embedder,
        generator,
        Duration::from_secs(cfg.generation.timeout_secs),
    ))
}
