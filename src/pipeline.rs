//! Durable embedding pipeline.
//!
//! The queue is the document store itself: any chunk whose embedding_status
//! is `pending` (or `processing` with an expired lease) is work. A discovery
//! loop claims batches via CAS, stamps leases, and feeds a bounded channel; a
//! fixed worker pool embeds, upserts vectors, and CAS-transitions the
//! outcome. Crash recovery is lease expiry plus idempotent upserts, nothing
//! else.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::docstore::DocumentStore;
use crate::embedding::EmbeddingProvider;
use crate::error::{AppError, AppResult};
use crate::models::CodeChunk;
use crate::vectorstore::{VectorPayload, VectorPoint, VectorStore};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub lease_ttl: std::time::Duration,
    pub idle_poll_interval: std::time::Duration,
    pub shutdown_grace: std::time::Duration,
}

impl PipelineConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            workers: config.embedding_workers,
            batch_size: config.embedding_batch_size,
            max_attempts: config.embedding_max_attempts,
            lease_ttl: config.lease_ttl,
            idle_poll_interval: config.idle_poll_interval,
            shutdown_grace: config.shutdown_grace,
        }
    }
}

/// Per-repository mutexes serializing vector-store writes against
/// repository deletion. Workers hold the lock around an upsert; deletion
/// holds it around the filter-delete.
#[derive(Default, Clone)]
pub struct RepoLocks {
    locks: Arc<DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, repository_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(repository_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .value()
            .clone()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineHealth {
    pub running: bool,
    /// Seconds since the discovery loop last completed a pass; None before
    /// the first pass.
    pub last_tick_age_secs: Option<i64>,
    /// Set when an invariant violation stopped the pipeline.
    pub fatal_error: Option<String>,
}

struct PipelineInner {
    store: Arc<dyn DocumentStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: PipelineConfig,
    wake: Arc<Notify>,
    repo_locks: RepoLocks,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    last_tick_unix: AtomicI64,
    fatal: Mutex<Option<String>>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct EmbeddingPipeline {
    inner: Arc<PipelineInner>,
}

impl EmbeddingPipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn DocumentStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        wake: Arc<Notify>,
        repo_locks: RepoLocks,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(PipelineInner {
                store,
                vectors,
                embedder,
                config,
                wake,
                repo_locks,
                running: AtomicBool::new(false),
                shutdown_tx,
                last_tick_unix: AtomicI64::new(0),
                fatal: Mutex::new(None),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Idempotent: spawns the discovery loop and worker pool when not
    /// already running, otherwise a no-op.
    pub fn start(&self) {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("embedding pipeline already running");
            return;
        }
        let _ = self.inner.shutdown_tx.send(false);
        *self.inner.fatal.lock() = None;

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            run_supervisor(inner).await;
        });
        *self.inner.supervisor.lock() = Some(handle);
        tracing::info!(
            workers = self.inner.config.workers,
            batch_size = self.inner.config.batch_size,
            "embedding pipeline started"
        );
    }

    /// Drain and stop: the discovery loop stops sampling, in-flight batches
    /// get `shutdown_grace` to finish, and whatever is still leased stays in
    /// `processing` for reclaim on the next start.
    pub async fn stop(&self) {
        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(true);
        let handle = self.inner.supervisor.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(self.inner.config.shutdown_grace, handle)
                .await
                .is_err()
            {
                tracing::warn!(
                    "embedding pipeline drain exceeded grace; leased chunks will be reclaimed"
                );
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);
        tracing::info!("embedding pipeline stopped");
    }

    pub fn health(&self) -> PipelineHealth {
        let tick = self.inner.last_tick_unix.load(Ordering::Relaxed);
        PipelineHealth {
            running: self.inner.running.load(Ordering::SeqCst),
            last_tick_age_secs: (tick > 0)
                .then(|| (chrono::Utc::now().timestamp() - tick).max(0)),
            fatal_error: self.inner.fatal.lock().clone(),
        }
    }
}

async fn run_supervisor(inner: Arc<PipelineInner>) {
    // Channel capacity of workers*2 keeps discovery from racing far ahead of
    // the pool (backpressure).
    let (tx, rx) = mpsc::channel::<Vec<CodeChunk>>(inner.config.workers * 2);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let mut workers = JoinSet::new();
    for worker_id in 0..inner.config.workers {
        let inner = Arc::clone(&inner);
        let rx = Arc::clone(&rx);
        workers.spawn(async move {
            run_worker(worker_id, inner, rx).await;
        });
    }

    run_discovery(&inner, tx).await;

    // tx dropped: workers drain the channel and exit.
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "embedding worker panicked");
        }
    }
    inner.running.store(false, Ordering::SeqCst);
}

async fn run_discovery(inner: &Arc<PipelineInner>, tx: mpsc::Sender<Vec<CodeChunk>>) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    let claim_limit = (inner.config.batch_size * inner.config.workers) as i64;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        if inner.fatal.lock().is_some() {
            break;
        }

        let claimed = match inner
            .store
            .claim_pending_chunks(claim_limit, inner.config.lease_ttl)
            .await
        {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::warn!(error = %e, "failed to sample pending chunks");
                Vec::new()
            }
        };
        inner
            .last_tick_unix
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);

        if claimed.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(inner.config.idle_poll_interval) => {}
                _ = inner.wake.notified() => {
                    tracing::debug!("pipeline woken for new work");
                }
                _ = shutdown_rx.changed() => {}
            }
            continue;
        }

        tracing::debug!(chunks = claimed.len(), "claimed chunk batch set");

        // Split into per-repository batches, then interleave round-robin so
        // every repository lands one batch before any lands a second.
        for batch in interleave_batches(claimed, inner.config.batch_size) {
            tokio::select! {
                sent = tx.send(batch) => {
                    if sent.is_err() {
                        return;
                    }
                }
                _ = shutdown_rx.changed() => {
                    return;
                }
            }
        }
    }
}

/// Group chunks per repository into batches of `batch_size` and interleave
/// the groups round-robin, preserving the claim order within each group.
fn interleave_batches(chunks: Vec<CodeChunk>, batch_size: usize) -> Vec<Vec<CodeChunk>> {
    let mut order: Vec<Uuid> = Vec::new();
    let mut by_repo: HashMap<Uuid, Vec<Vec<CodeChunk>>> = HashMap::new();

    for chunk in chunks {
        let repo = chunk.repository_id;
        let batches = by_repo.entry(repo).or_insert_with(|| {
            order.push(repo);
            vec![Vec::with_capacity(batch_size)]
        });
        if batches.last().map(|b| b.len() >= batch_size).unwrap_or(false) {
            batches.push(Vec::with_capacity(batch_size));
        }
        if let Some(last) = batches.last_mut() {
            last.push(chunk);
        }
    }

    let mut out = Vec::new();
    let mut round = 0usize;
    loop {
        let mut emitted = false;
        for repo in &order {
            if let Some(batches) = by_repo.get_mut(repo) {
                if round < batches.len() {
                    out.push(std::mem::take(&mut batches[round]));
                    emitted = true;
                }
            }
        }
        if !emitted {
            break;
        }
        round += 1;
    }
    out
}

async fn run_worker(
    worker_id: usize,
    inner: Arc<PipelineInner>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<CodeChunk>>>>,
) {
    loop {
        let batch = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(batch) = batch else {
            break;
        };
        if batch.is_empty() {
            continue;
        }

        let ids: Vec<Uuid> = batch.iter().map(|c| c.id).collect();
        match embed_and_upsert(&inner, &batch).await {
            Ok(()) => {
                // Upsert landed first; only now do chunks become completed,
                // so a completed chunk always has a point.
                match inner.store.complete_chunks(&ids).await {
                    Ok(updated) => {
                        tracing::debug!(worker_id, chunks = updated, "batch embedded");
                    }
                    Err(e) => {
                        tracing::error!(worker_id, error = %e, "failed to mark chunks completed");
                    }
                }
            }
            Err(e) if is_fatal(&e) => {
                tracing::error!(worker_id, error = %e, "fatal pipeline error, stopping");
                *inner.fatal.lock() = Some(e.to_string());
                let _ = inner.store.release_chunks(&ids, &e.to_string()).await;
                inner.wake.notify_one();
                break;
            }
            Err(e) => {
                // The whole batch shares one remote outcome: revert together.
                let reason = e.to_string();
                let mut retry_ids = Vec::new();
                let mut dead_ids = Vec::new();
                for chunk in &batch {
                    if (chunk.attempts + 1) as u32 >= inner.config.max_attempts {
                        dead_ids.push(chunk.id);
                    } else {
                        retry_ids.push(chunk.id);
                    }
                }
                if !retry_ids.is_empty() {
                    if let Err(release_err) = inner.store.release_chunks(&retry_ids, &reason).await
                    {
                        tracing::error!(worker_id, error = %release_err, "failed to release chunks");
                    }
                }
                if !dead_ids.is_empty() {
                    tracing::warn!(worker_id, chunks = dead_ids.len(), reason = %reason,
                        "chunks exhausted embedding attempts");
                    if let Err(fail_err) = inner.store.fail_chunks(&dead_ids, &reason).await {
                        tracing::error!(worker_id, error = %fail_err, "failed to fail chunks");
                    }
                }
            }
        }
    }
    tracing::debug!(worker_id, "embedding worker exited");
}

/// Invariant violations stop the pipeline; provider flakiness does not.
fn is_fatal(err: &AppError) -> bool {
    matches!(err, AppError::Internal(_) | AppError::ConfigInvalid(_))
}

async fn embed_and_upsert(inner: &Arc<PipelineInner>, batch: &[CodeChunk]) -> AppResult<()> {
    let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
    let vectors = inner.embedder.embed(&texts).await?;
    if vectors.len() != batch.len() {
        return Err(AppError::Internal(format!(
            "embedder returned {} vectors for {} chunks",
            vectors.len(),
            batch.len()
        )));
    }

    let points: Vec<VectorPoint> = batch
        .iter()
        .zip(vectors)
        .map(|(chunk, vector)| VectorPoint {
            id: chunk.id,
            vector,
            payload: VectorPayload {
                repository_id: chunk.repository_id,
                file_path: chunk.file_path.clone(),
                language: chunk.language.clone(),
                start_line: chunk.start_line,
                end_line: chunk.end_line,
            },
        })
        .collect();

    // Batches are single-repository; exclude a concurrent deletion of the
    // same repository's points.
    let lock = inner.repo_locks.lock_for(batch[0].repository_id);
    let _guard = lock.lock().await;
    inner.vectors.upsert_points(&points).await
}
