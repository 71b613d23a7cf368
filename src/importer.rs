//! Repository import orchestrator.
//!
//! `start_import` atomically moves a repository into `importing` and returns;
//! the actual walk/fetch/chunk/persist work runs as a process-owned
//! background task. All failures are captured to the repository's status;
//! nothing escapes to the foreground.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use rayon::prelude::*;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::chunker::Chunker;
use crate::config::AppConfig;
use crate::docstore::DocumentStore;
use crate::error::{AppError, AppResult};
use crate::github::{SourceForge, TreeEntry};
use crate::identity::IdentityProvider;
use crate::models::{AnalyticsEvent, NewChunk, RepoStatus, Repository};

/// Concurrent in-flight file fetches per batch.
const FETCH_CONCURRENCY: usize = 8;

/// Transient per-file retries before the file is skipped and recorded.
const FILE_RETRIES: usize = 3;

/// Total wall-clock budget spent backing off on provider rate limits before
/// the import run fails.
const RATE_LIMIT_BUDGET: Duration = Duration::from_secs(600);

pub struct Importer {
    store: Arc<dyn DocumentStore>,
    forge: Arc<dyn SourceForge>,
    identity: Arc<dyn IdentityProvider>,
    chunker: Arc<Chunker>,
    batch_size: usize,
    max_file_size: u64,
    /// Wakes the embedding pipeline once new pending chunks landed.
    pipeline_wake: Arc<Notify>,
    /// In-process guard against double-spawning a run for the same repo; the
    /// store-side CAS remains the source of truth across processes.
    running: DashMap<Uuid, ()>,
}

impl Importer {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn DocumentStore>,
        forge: Arc<dyn SourceForge>,
        identity: Arc<dyn IdentityProvider>,
        chunker: Arc<Chunker>,
        pipeline_wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            forge,
            identity,
            chunker,
            batch_size: config.github_batch_size.max(1),
            max_file_size: config.github_max_file_size,
            pipeline_wake,
            running: DashMap::new(),
        }
    }

    /// Transition the repository to `importing` and spawn the background
    /// run. Returns immediately; progress is observable by polling.
    pub async fn start_import(self: &Arc<Self>, repo_id: Uuid, owner_id: Uuid) -> AppResult<()> {
        let repo = self.store.get_repository_for_owner(repo_id, owner_id).await?;

        if !self.store.try_begin_import(repo_id).await? {
            return Err(AppError::Validation(format!(
                "repository {repo_id} is already importing"
            )));
        }
        if self.running.insert(repo_id, ()).is_some() {
            // Store CAS succeeded but a local task is still winding down;
            // treat as already running.
            return Err(AppError::Validation(format!(
                "repository {repo_id} is already importing"
            )));
        }

        let importer = Arc::clone(self);
        tokio::spawn(async move {
            importer.run_import(repo).await;
            importer.running.remove(&repo_id);
        });
        Ok(())
    }

    async fn run_import(&self, repo: Repository) {
        let repo_id = repo.id;
        match self.run_import_inner(&repo).await {
            Ok(summary) => {
                tracing::info!(
                    repository = %repo_id,
                    files = summary.files_imported,
                    chunks = summary.chunks_inserted,
                    skipped = summary.files_skipped,
                    commit = %summary.commit,
                    "import complete"
                );
                let _ = self
                    .store
                    .record_event(&AnalyticsEvent::new(
                        repo.owner_id,
                        "import_completed",
                        serde_json::json!({
                            "repository_id": repo_id,
                            "files": summary.files_imported,
                            "chunks": summary.chunks_inserted,
                            "skipped": summary.files_skipped,
                        }),
                    ))
                    .await;
                // New pending chunks are waiting; poke the pipeline.
                self.pipeline_wake.notify_one();
            }
            Err(e) => {
                tracing::error!(repository = %repo_id, error = %e, "import failed");
                let message = e.to_string();
                if let Err(patch_err) = self
                    .store
                    .finish_import(repo_id, RepoStatus::Error, Some(&message), None)
                    .await
                {
                    tracing::error!(
                        repository = %repo_id,
                        error = %patch_err,
                        "failed to record import error"
                    );
                }
            }
        }
    }

    async fn run_import_inner(&self, repo: &Repository) -> AppResult<ImportSummary> {
        let token = self.identity.forge_token(repo.owner_id).await?;

        let head = self
            .forge
            .branch_head(&token, &repo.gh_full_name, &repo.default_branch)
            .await?;

        let tree = self
            .forge
            .list_tree(&token, &repo.gh_full_name, &head)
            .await?;

        // Skip excluded/oversized paths before fetching anything.
        let eligible: Vec<TreeEntry> = tree
            .into_iter()
            .filter(|e| e.size <= self.max_file_size)
            .filter(|e| !self.chunker.should_skip_path(&e.path))
            .collect();

        let files_total = eligible.len();
        self.store
            .patch_import_progress(repo.id, 5, Some(&format!("{files_total} files to import")))
            .await?;

        let mut summary = ImportSummary {
            commit: head.clone(),
            ..ImportSummary::default()
        };
        let mut languages: HashMap<String, i64> = HashMap::new();
        let mut files_done = 0usize;
        let mut rate_limit_spent = Duration::ZERO;

        for batch in eligible.chunks(self.batch_size) {
            let fetched = loop {
                match self.fetch_batch(&token, &repo.gh_full_name, &head, batch).await {
                    Ok(fetched) => break fetched,
                    Err(AppError::RateLimited(_)) => {
                        let delay = crate::embedding::backoff_delay(
                            (rate_limit_spent.as_secs() / 30 + 1) as u32,
                        );
                        rate_limit_spent += delay;
                        if rate_limit_spent > RATE_LIMIT_BUDGET {
                            return Err(AppError::RateLimited(
                                "source forge rate limit budget exhausted".into(),
                            ));
                        }
                        tracing::warn!(
                            repository = %repo.id,
                            delay_ms = delay.as_millis() as u64,
                            "source forge rate limited, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => return Err(e),
                }
            };

            summary.files_skipped += batch.len() - fetched.len();

            // CPU-bound chunking of the fetched batch.
            let chunker = Arc::clone(&self.chunker);
            let chunked: Vec<(String, usize, Vec<NewChunk>)> =
                tokio::task::spawn_blocking(move || {
                    fetched
                        .par_iter()
                        .map(|(path, bytes)| {
                            let line_count = bytes.iter().filter(|b| **b == b'\n').count() + 1;
                            (path.clone(), line_count, chunker.chunk_file(path, bytes))
                        })
                        .collect()
                })
                .await
                .map_err(|e| AppError::Internal(format!("chunking task: {e}")))?;

            let mut batch_chunks: Vec<NewChunk> = Vec::new();
            for (path, line_count, chunks) in chunked {
                if chunks.is_empty() {
                    summary.files_skipped += 1;
                    continue;
                }
                let language = chunks[0].language.clone();
                *languages.entry(language).or_insert(0) += line_count as i64;
                summary.lines_imported += line_count as i64;
                summary.files_imported += 1;
                tracing::debug!(repository = %repo.id, file = %path, chunks = chunks.len(), "chunked file");
                batch_chunks.extend(chunks);
            }

            summary.chunks_inserted += self
                .store
                .insert_chunks_ignoring_duplicates(repo.id, &batch_chunks)
                .await?;

            files_done += batch.len();
            let progress = 5 + ((90 * files_done) as f64 / files_total.max(1) as f64) as i32;
            self.store
                .patch_import_progress(
                    repo.id,
                    progress.min(95),
                    Some(&format!("{files_done}/{files_total} files")),
                )
                .await?;
        }

        if summary.files_imported == 0 && files_total > 0 {
            return Err(AppError::UpstreamUnavailable(
                "no files could be imported".into(),
            ));
        }

        self.store
            .update_repository_counters(
                repo.id,
                summary.files_imported as i64,
                summary.lines_imported,
                &languages,
            )
            .await?;
        self.store
            .finish_import(repo.id, RepoStatus::Ready, None, Some(&head))
            .await?;

        Ok(summary)
    }

    /// Fetch one batch with bounded concurrency, preserving tree order.
    /// Transient per-file failures retry a few times, then the file is
    /// skipped; the import still succeeds if anything was imported. Rate
    /// limiting aborts the batch so the caller can back off as a whole.
    async fn fetch_batch(
        &self,
        token: &str,
        full_name: &str,
        reference: &str,
        batch: &[TreeEntry],
    ) -> AppResult<Vec<(String, Vec<u8>)>> {
        let results: Vec<(String, AppResult<Vec<u8>>)> = stream::iter(batch.iter().cloned())
            .map(|entry| {
                let forge = Arc::clone(&self.forge);
                let token = token.to_string();
                let full_name = full_name.to_string();
                let reference = reference.to_string();
                let path = entry.path.clone();
                async move {
                    let mut last_err: Option<AppError> = None;
                    for _ in 0..FILE_RETRIES {
                        match forge.fetch_file(&token, &full_name, &path, &reference).await {
                            Ok(bytes) => return (path, Ok(bytes)),
                            Err(e @ AppError::RateLimited(_)) => return (path, Err(e)),
                            Err(e) if e.is_retriable() => last_err = Some(e),
                            Err(e) => return (path, Err(e)),
                        }
                    }
                    (
                        path,
                        Err(last_err.unwrap_or_else(|| {
                            AppError::Internal("fetch retries exhausted".into())
                        })),
                    )
                }
            })
            .buffered(FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut fetched = Vec::with_capacity(batch.len());
        let mut rate_limited = false;
        for (path, result) in results {
            match result {
                Ok(bytes) => fetched.push((path, bytes)),
                Err(AppError::RateLimited(m)) => {
                    rate_limited = true;
                    tracing::warn!(file = %path, "rate limited: {m}");
                }
                Err(e) => {
                    // Skip this file; the rest of the batch proceeds.
                    tracing::warn!(file = %path, error = %e, "skipping file after fetch failure");
                }
            }
        }

        if rate_limited {
            return Err(AppError::RateLimited("source forge".into()));
        }
        Ok(fetched)
    }
}

#[derive(Debug, Default)]
pub struct ImportSummary {
    pub commit: String,
    pub files_imported: usize,
    pub files_skipped: usize,
    pub lines_imported: i64,
    pub chunks_inserted: u64,
}
