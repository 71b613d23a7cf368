//! Operational CLI.
//!
//! Exit codes: 0 success, 2 usage error (clap's default), 3 upstream
//! unavailable, 4 fatal configuration mismatch.

use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::docstore::{DocumentStore, PostgresStore};
use crate::error::{AppError, AppResult};
use crate::vectorstore::{QdrantStore, VectorStore};

pub const EXIT_UPSTREAM: i32 = 3;
pub const EXIT_CONFIG: i32 = 4;

#[derive(Debug, Parser)]
#[command(name = "repodex-backend", version, about = "Repository code search and RAG backend")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP server with the embedding pipeline (default).
    Serve,
    /// Queue every chunk of a repository for re-embedding.
    Reembed {
        /// Repository id
        repository_id: Uuid,
    },
    /// Print per-repository embedding progress.
    EmbeddingStatus,
    /// Drop and re-create the vector collection, then queue all chunks for
    /// re-embedding.
    RebuildCollection,
}

pub fn exit_code_for(err: &AppError) -> i32 {
    match err {
        AppError::ConfigInvalid(_) => EXIT_CONFIG,
        AppError::UpstreamUnavailable(_) | AppError::RateLimited(_) | AppError::Database(_) => {
            EXIT_UPSTREAM
        }
        _ => 1,
    }
}

pub async fn run_admin(command: &Command, config: &AppConfig) -> AppResult<()> {
    let store = PostgresStore::connect(config).await?;
    store.ensure_schema().await?;

    match command {
        Command::Serve => unreachable!("serve is handled by main"),
        Command::Reembed { repository_id } => {
            store.get_repository(*repository_id).await?;
            let queued = store.reset_chunks(Some(*repository_id)).await?;
            println!("queued {queued} chunks of {repository_id} for re-embedding");
        }
        Command::EmbeddingStatus => {
            let rows = store.embedding_progress_all().await?;
            if rows.is_empty() {
                println!("no chunks indexed");
            }
            for progress in rows {
                println!(
                    "{}  total={} pending={} processing={} completed={} failed={}  {:.1}% {:?}",
                    progress.repository_id,
                    progress.total,
                    progress.pending,
                    progress.processing,
                    progress.completed,
                    progress.failed,
                    progress.percent(),
                    progress.derived_status(),
                );
            }
        }
        Command::RebuildCollection => {
            let vectors = QdrantStore::new(config)?;
            vectors.recreate_collection().await?;
            let queued = store.reset_chunks(None).await?;
            println!(
                "collection '{}' re-created (dimension {}), {queued} chunks queued for re-embedding",
                config.vectorstore_collection, config.vector_dimension
            );
        }
    }
    Ok(())
}
