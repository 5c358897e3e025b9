//! # Pulpmill CLI
//!
//! The `pulpmill` binary manages the document-ingestion pipeline: database
//! initialization, document registration, the worker pool, and lifecycle
//! inspection.
//!
//! ## Usage
//!
//! ```bash
//! pulpmill --config ./config/pulpmill.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pulpmill init` | Create the SQLite database and run schema migrations |
//! | `pulpmill add <file>` | Register an uploaded file and schedule ingestion |
//! | `pulpmill worker` | Run the worker pool until interrupted |
//! | `pulpmill ingest <id>` | Run one ingestion task inline and print its outcome |
//! | `pulpmill status <id>` | Show a document's chunking lifecycle state |
//! | `pulpmill reprocess <id>` | Reset a failed document and schedule another run |

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use pulpmill::blobstore::{self, FsBlobStore};
use pulpmill::queue::TaskQueue;
use pulpmill::{config, db, ingest, migrate, store, trigger, worker};

/// Pulpmill — an asynchronous document-ingestion pipeline.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/pulpmill.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "pulpmill",
    about = "Pulpmill — an asynchronous document-ingestion pipeline",
    version,
    long_about = "Pulpmill ingests uploaded documents: files are streamed from blob storage, \
    parsed into plain text, split into ordered chunks, and persisted together with a \
    lifecycle status transition. Work is delivered through an at-least-once task queue \
    and processed by a pool of idempotent workers."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/pulpmill.toml")]
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
    /// (documents, chunks, ingest_queue). Idempotent — running it
    /// multiple times is safe.
    Init,

    /// Register an uploaded file as a new document.
    ///
    /// Stages the file into the blob store, creates the document record,
    /// and schedules exactly one ingestion task once the creating
    /// transaction commits. Requires the filesystem storage backend.
    Add {
        /// Path to the file to upload.
        file: PathBuf,

        /// Display name for the document. Defaults to the file name.
        #[arg(long)]
        name: Option<String>,

        /// Owner reference to attach to the document.
        #[arg(long)]
        owner: Option<String>,
    },

    /// Run one ingestion task inline and print its outcome.
    ///
    /// Bypasses the queue; useful for operating on a single document and
    /// for scripting. The outcome is one of: ok, already_done, missing,
    /// error.
    Ingest {
        /// Document id.
        id: String,
    },

    /// Run the worker pool until interrupted.
    ///
    /// Workers long-poll the task queue, process deliveries to
    /// completion, and ack afterwards. Stop with Ctrl-C; in-flight tasks
    /// are drained first.
    Worker,

    /// Show a document's chunking lifecycle state.
    Status {
        /// Document id.
        id: String,
    },

    /// Reset a failed document and schedule another ingestion run.
    ///
    /// The explicit operator path out of the `error` state. Existing
    /// chunks are kept; a re-run skips already-present chunk indices.
    Reprocess {
        /// Document id.
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pulpmill=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }

        Commands::Add { file, name, owner } => {
            if cfg.storage.backend != "filesystem" {
                anyhow::bail!(
                    "add requires the filesystem storage backend; stage objects in the bucket directly and register them out of band"
                );
            }
            let root = cfg
                .storage
                .root
                .clone()
                .context("storage.root is not set")?;
            let file_name = file
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.to_string())
                .unwrap_or_else(|| "upload".to_string());
            let name = name.unwrap_or_else(|| file_name.clone());

            let pool = db::connect(&cfg).await?;
            let queue = TaskQueue::new(pool.clone(), cfg.queue.clone());
            let blobs = FsBlobStore::new(root);

            let key = format!("{}/{}", uuid::Uuid::new_v4(), file_name);
            blobs.put(&key, &file).await?;

            let id =
                trigger::create_document(&pool, &queue, &name, Some(&key), owner.as_deref())
                    .await?;
            pool.close().await;

            println!("created document {}", id);
            println!("scheduled ingestion");
        }

        Commands::Ingest { id } => {
            let pool = db::connect(&cfg).await?;
            let blobs = blobstore::from_config(&cfg.storage)?;
            let outcome = ingest::run_ingestion(&pool, blobs.as_ref(), &cfg, &id).await;
            pool.close().await;
            println!("{}", outcome.as_str());
        }

        Commands::Worker => {
            let pool = db::connect(&cfg).await?;
            let blobs: Arc<dyn blobstore::BlobStore> = Arc::from(blobstore::from_config(&cfg.storage)?);
            worker::run_worker(pool, blobs, Arc::new(cfg)).await?;
        }

        Commands::Status { id } => {
            let pool = db::connect(&cfg).await?;
            let doc = match store::get_document(&pool, &id).await? {
                Some(doc) => doc,
                None => {
                    pool.close().await;
                    eprintln!("Error: document not found: {}", id);
                    std::process::exit(1);
                }
            };
            let chunks = store::chunk_count(&pool, &id).await?;
            pool.close().await;

            println!("document:      {}", doc.id);
            println!("name:          {}", doc.name);
            println!(
                "file_key:      {}",
                doc.file_key.as_deref().unwrap_or("(none)")
            );
            println!("status:        {}", doc.chunking_status.as_str());
            println!("chunking_done: {}", doc.chunking_done());
            println!("chunks:        {}", chunks);
            println!("retry_count:   {}", doc.retry_count);
            println!(
                "last_error:    {}",
                doc.last_error.as_deref().unwrap_or("-")
            );
        }

        Commands::Reprocess { id } => {
            let pool = db::connect(&cfg).await?;
            let queue = TaskQueue::new(pool.clone(), cfg.queue.clone());
            if !store::reset_for_reprocess(&pool, &id).await? {
                pool.close().await;
                eprintln!("Error: document not found: {}", id);
                std::process::exit(1);
            }
            trigger::schedule_ingestion(&queue, &id).await?;
            pool.close().await;
            println!("reprocess scheduled for {}", id);
        }
    }

    Ok(())
}
