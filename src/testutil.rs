//! In-memory trait doubles for hermetic tests.
//!
//! `MemoryStore` mirrors the Postgres adapter's CAS semantics closely enough
//! to exercise the pipeline's transition safety, lease reclaim and fairness
//! without a database. Only compiled for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::docstore::{DocumentStore, LexicalHit, LexicalPage, SearchFilter};
use crate::embedding::EmbeddingProvider;
use crate::error::{AppError, AppResult};
use crate::github::{SourceForge, TreeEntry};
use crate::llm::{ChatCompletion, ChatModel};
use crate::models::{
    AnalyticsEvent, ChatMessage, ChatSession, CodeChunk, EmbeddingProgress, EmbeddingStatus,
    NewChunk, RepoStatus, Repository,
};
use crate::vectorstore::{ScoredPoint, VectorPoint, VectorStore};

// ---------------------------------------------------------------------------
// Document store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryStoreInner {
    repositories: HashMap<Uuid, Repository>,
    chunks: HashMap<Uuid, CodeChunk>,
    sessions: HashMap<Uuid, ChatSession>,
    forge_tokens: HashMap<Uuid, String>,
    events: Vec<AnalyticsEvent>,
    insert_seq: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_forge_token(&self, user_id: Uuid, token: &str) {
        self.inner
            .lock()
            .forge_tokens
            .insert(user_id, token.to_string());
    }

    pub fn chunk(&self, id: Uuid) -> Option<CodeChunk> {
        self.inner.lock().chunks.get(&id).cloned()
    }

    pub fn all_chunks(&self) -> Vec<CodeChunk> {
        let mut chunks: Vec<_> = self.inner.lock().chunks.values().cloned().collect();
        chunks.sort_by_key(|c| (c.file_path.clone(), c.start_line));
        chunks
    }

    pub fn chunks_with_status(&self, status: EmbeddingStatus) -> Vec<CodeChunk> {
        self.all_chunks()
            .into_iter()
            .filter(|c| c.embedding_status == status)
            .collect()
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.inner.lock().events.clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_repository(&self, repo: &Repository) -> AppResult<()> {
        self.inner.lock().repositories.insert(repo.id, repo.clone());
        Ok(())
    }

    async fn get_repository(&self, id: Uuid) -> AppResult<Repository> {
        self.inner
            .lock()
            .repositories
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("repository {id}")))
    }

    async fn get_repository_for_owner(&self, id: Uuid, owner_id: Uuid) -> AppResult<Repository> {
        let repo = self.get_repository(id).await?;
        if repo.owner_id != owner_id {
            return Err(AppError::Forbidden(format!("repository {id}")));
        }
        Ok(repo)
    }

    async fn list_repositories_by_owner(&self, owner_id: Uuid) -> AppResult<Vec<Repository>> {
        let mut repos: Vec<_> = self
            .inner
            .lock()
            .repositories
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect();
        repos.sort_by_key(|r| r.created_at);
        Ok(repos)
    }

    async fn list_repository_ids_by_owner(&self, owner_id: Uuid) -> AppResult<Vec<Uuid>> {
        Ok(self
            .list_repositories_by_owner(owner_id)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect())
    }

    async fn try_begin_import(&self, id: Uuid) -> AppResult<bool> {
        let mut inner = self.inner.lock();
        let repo = inner
            .repositories
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("repository {id}")))?;
        if !repo.status.can_transition_to(RepoStatus::Importing) {
            return Ok(false);
        }
        repo.status = RepoStatus::Importing;
        repo.import_progress = 0;
        repo.status_message = None;
        repo.updated_at = Utc::now();
        Ok(true)
    }

    async fn patch_import_progress(
        &self,
        id: Uuid,
        progress: i32,
        message: Option<&str>,
    ) -> AppResult<()> {
        let mut inner = self.inner.lock();
        if let Some(repo) = inner.repositories.get_mut(&id) {
            if repo.status == RepoStatus::Importing {
                repo.import_progress = repo.import_progress.max(progress.clamp(0, 100));
                if let Some(m) = message {
                    repo.status_message = Some(m.to_string());
                }
                repo.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn finish_import(
        &self,
        id: Uuid,
        status: RepoStatus,
        message: Option<&str>,
        last_commit: Option<&str>,
    ) -> AppResult<()> {
        let mut inner = self.inner.lock();
        if let Some(repo) = inner.repositories.get_mut(&id) {
            if repo.status.can_transition_to(status) {
                repo.status = status;
                if status == RepoStatus::Ready {
                    repo.import_progress = 100;
                }
                repo.status_message = message.map(str::to_string);
                if let Some(c) = last_commit {
                    repo.last_commit = Some(c.to_string());
                }
                repo.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn update_repository_counters(
        &self,
        id: Uuid,
        file_count: i64,
        line_count: i64,
        languages: &HashMap<String, i64>,
    ) -> AppResult<()> {
        let mut inner = self.inner.lock();
        if let Some(repo) = inner.repositories.get_mut(&id) {
            repo.file_count = file_count;
            repo.line_count = line_count;
            repo.languages = languages.clone();
            repo.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_repository(&self, id: Uuid) -> AppResult<()> {
        let mut inner = self.inner.lock();
        if inner.repositories.remove(&id).is_none() {
            return Err(AppError::NotFound(format!("repository {id}")));
        }
        inner.chunks.retain(|_, c| c.repository_id != id);
        inner.sessions.retain(|_, s| s.repository_id != id);
        Ok(())
    }

    async fn insert_chunks_ignoring_duplicates(
        &self,
        repository_id: Uuid,
        chunks: &[NewChunk],
    ) -> AppResult<u64> {
        let mut inner = self.inner.lock();
        let mut inserted = 0u64;
        for chunk in chunks {
            let duplicate = inner.chunks.values().any(|existing| {
                existing.repository_id == repository_id
                    && (existing.content_hash == chunk.content_hash
                        || (existing.file_path == chunk.file_path
                            && existing.start_line == chunk.start_line
                            && existing.end_line == chunk.end_line))
            });
            if duplicate {
                continue;
            }
            inner.insert_seq += 1;
            let seq = inner.insert_seq;
            let now = Utc::now() + chrono::Duration::microseconds(seq as i64);
            let id = Uuid::new_v4();
            inner.chunks.insert(
                id,
                CodeChunk {
                    id,
                    repository_id,
                    file_path: chunk.file_path.clone(),
                    file_name: chunk.file_name.clone(),
                    language: chunk.language.clone(),
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                    content: chunk.content.clone(),
                    content_hash: chunk.content_hash.clone(),
                    metadata: chunk.metadata.clone(),
                    embedding_status: EmbeddingStatus::Pending,
                    vector_ref: None,
                    attempts: 0,
                    failure_reason: None,
                    lease_deadline: None,
                    created_at: now,
                    updated_at: now,
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn find_chunks_by_ids(&self, ids: &[Uuid]) -> AppResult<Vec<CodeChunk>> {
        let inner = self.inner.lock();
        Ok(ids
            .iter()
            .filter_map(|id| inner.chunks.get(id).cloned())
            .collect())
    }

    async fn find_chunks_by_status(
        &self,
        repository_id: Option<Uuid>,
        status: EmbeddingStatus,
        limit: i64,
    ) -> AppResult<Vec<CodeChunk>> {
        let mut chunks: Vec<CodeChunk> = self
            .inner
            .lock()
            .chunks
            .values()
            .filter(|c| c.embedding_status == status)
            .filter(|c| repository_id.map(|r| c.repository_id == r).unwrap_or(true))
            .cloned()
            .collect();
        chunks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        chunks.truncate(limit.max(0) as usize);
        Ok(chunks)
    }

    async fn claim_pending_chunks(&self, limit: i64, lease: Duration) -> AppResult<Vec<CodeChunk>> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        // Rank eligible chunks per repository, then take the lowest ranks
        // first (round-robin fairness, same shape as the SQL window query).
        let mut eligible: Vec<(Uuid, DateTime<Utc>, Uuid)> = inner
            .chunks
            .values()
            .filter(|c| {
                c.embedding_status == EmbeddingStatus::Pending
                    || (c.embedding_status == EmbeddingStatus::Processing
                        && c.lease_deadline.map(|d| d < now).unwrap_or(false))
            })
            .map(|c| (c.repository_id, c.created_at, c.id))
            .collect();
        eligible.sort_by_key(|(_, created, id)| (*created, *id));

        let mut rank: HashMap<Uuid, usize> = HashMap::new();
        let mut ranked: Vec<(usize, Uuid)> = eligible
            .into_iter()
            .map(|(repo, _, id)| {
                let r = rank.entry(repo).or_insert(0);
                *r += 1;
                (*r, id)
            })
            .collect();
        ranked.sort_by_key(|(r, id)| (*r, *id));

        let picked: Vec<Uuid> = ranked
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(_, id)| id)
            .collect();

        let deadline = now + chrono::Duration::from_std(lease).unwrap_or_default();
        let mut claimed = Vec::with_capacity(picked.len());
        for id in picked {
            if let Some(chunk) = inner.chunks.get_mut(&id) {
                chunk.embedding_status = EmbeddingStatus::Processing;
                chunk.lease_deadline = Some(deadline);
                chunk.updated_at = now;
                claimed.push(chunk.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_chunks(&self, ids: &[Uuid]) -> AppResult<u64> {
        let mut inner = self.inner.lock();
        let mut updated = 0u64;
        for id in ids {
            if let Some(chunk) = inner.chunks.get_mut(id) {
                if cas_chunk(chunk, EmbeddingStatus::Processing, EmbeddingStatus::Completed) {
                    chunk.vector_ref = Some(chunk.id);
                    chunk.failure_reason = None;
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn release_chunks(&self, ids: &[Uuid], reason: &str) -> AppResult<u64> {
        let mut inner = self.inner.lock();
        let mut updated = 0u64;
        for id in ids {
            if let Some(chunk) = inner.chunks.get_mut(id) {
                if cas_chunk(chunk, EmbeddingStatus::Processing, EmbeddingStatus::Pending) {
                    chunk.attempts += 1;
                    chunk.failure_reason = Some(reason.to_string());
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn fail_chunks(&self, ids: &[Uuid], reason: &str) -> AppResult<u64> {
        let mut inner = self.inner.lock();
        let mut updated = 0u64;
        for id in ids {
            if let Some(chunk) = inner.chunks.get_mut(id) {
                if cas_chunk(chunk, EmbeddingStatus::Processing, EmbeddingStatus::Failed) {
                    chunk.attempts += 1;
                    chunk.failure_reason = Some(reason.to_string());
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn retry_failed_chunks(&self, repository_id: Uuid) -> AppResult<u64> {
        let mut inner = self.inner.lock();
        let mut updated = 0u64;
        for chunk in inner.chunks.values_mut() {
            if chunk.repository_id == repository_id
                && cas_chunk(chunk, EmbeddingStatus::Failed, EmbeddingStatus::Pending)
            {
                chunk.attempts = 0;
                chunk.failure_reason = None;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn reset_chunks(&self, repository_id: Option<Uuid>) -> AppResult<u64> {
        let mut inner = self.inner.lock();
        let mut updated = 0u64;
        for chunk in inner.chunks.values_mut() {
            if repository_id.map(|r| chunk.repository_id == r).unwrap_or(true) {
                chunk.embedding_status = EmbeddingStatus::Pending;
                chunk.attempts = 0;
                chunk.failure_reason = None;
                chunk.vector_ref = None;
                chunk.lease_deadline = None;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn embedding_progress(&self, repository_id: Uuid) -> AppResult<EmbeddingProgress> {
        let inner = self.inner.lock();
        let mut progress = EmbeddingProgress {
            repository_id,
            total: 0,
            pending: 0,
            processing: 0,
            completed: 0,
            failed: 0,
        };
        for chunk in inner.chunks.values().filter(|c| c.repository_id == repository_id) {
            progress.total += 1;
            match chunk.embedding_status {
                EmbeddingStatus::Pending => progress.pending += 1,
                EmbeddingStatus::Processing => progress.processing += 1,
                EmbeddingStatus::Completed => progress.completed += 1,
                EmbeddingStatus::Failed => progress.failed += 1,
            }
        }
        Ok(progress)
    }

    async fn embedding_progress_all(&self) -> AppResult<Vec<EmbeddingProgress>> {
        let repo_ids: Vec<Uuid> = {
            let inner = self.inner.lock();
            let mut ids: Vec<Uuid> = inner
                .chunks
                .values()
                .map(|c| c.repository_id)
                .collect::<std::collections::HashSet<_>>()
                .into_iter()
                .collect();
            ids.sort();
            ids
        };
        let mut out = Vec::with_capacity(repo_ids.len());
        for id in repo_ids {
            out.push(self.embedding_progress(id).await?);
        }
        Ok(out)
    }

    async fn lexical_search(
        &self,
        query: &str,
        filter: &SearchFilter,
        offset: i64,
        limit: i64,
    ) -> AppResult<LexicalPage> {
        let inner = self.inner.lock();
        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let mut hits: Vec<LexicalHit> = inner
            .chunks
            .values()
            .filter(|c| {
                inner
                    .repositories
                    .get(&c.repository_id)
                    .map(|r| r.owner_id == filter.owner_id)
                    .unwrap_or(false)
            })
            .filter(|c| {
                filter
                    .repository_ids
                    .as_ref()
                    .map(|ids| ids.contains(&c.repository_id))
                    .unwrap_or(true)
            })
            .filter(|c| {
                filter
                    .language
                    .as_ref()
                    .map(|l| &c.language == l)
                    .unwrap_or(true)
            })
            .filter_map(|c| {
                // Content matches dominate; file name and symbols are
                // secondary, mirroring the weighted tsvector.
                let content = c.content.to_lowercase();
                let name = c.file_name.to_lowercase();
                let symbols = c.metadata.symbols_text().to_lowercase();
                let mut score = 0f32;
                for term in &terms {
                    score += content.matches(term.as_str()).count() as f32 * 3.0;
                    score += name.matches(term.as_str()).count() as f32 * 2.0;
                    score += symbols.matches(term.as_str()).count() as f32;
                }
                (score > 0.0).then(|| LexicalHit {
                    chunk: c.clone(),
                    score,
                    highlight: None,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk.id.cmp(&b.chunk.id))
        });

        let total = hits.len() as i64;
        let items: Vec<LexicalHit> = hits
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        let has_more = offset + (items.len() as i64) < total;
        Ok(LexicalPage {
            items,
            total,
            has_more,
        })
    }

    async fn insert_session(&self, session: &ChatSession) -> AppResult<()> {
        self.inner.lock().sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session_for_owner(&self, id: Uuid, owner_id: Uuid) -> AppResult<ChatSession> {
        let inner = self.inner.lock();
        let session = inner
            .sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("session {id}")))?;
        if session.owner_id != owner_id {
            return Err(AppError::Forbidden(format!("session {id}")));
        }
        Ok(session)
    }

    async fn list_sessions_by_owner(&self, owner_id: Uuid) -> AppResult<Vec<ChatSession>> {
        let inner = self.inner.lock();
        let mut sessions: Vec<_> = inner
            .sessions
            .values()
            .filter(|s| s.owner_id == owner_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn append_message(
        &self,
        session_id: Uuid,
        expected_version: i64,
        message: &ChatMessage,
        title: Option<&str>,
    ) -> AppResult<bool> {
        let mut inner = self.inner.lock();
        let Some(session) = inner.sessions.get_mut(&session_id) else {
            return Ok(false);
        };
        if session.version != expected_version {
            return Ok(false);
        }
        session.messages.push(message.clone());
        session.version += 1;
        if session.title.is_none() {
            session.title = title.map(str::to_string);
        }
        session.updated_at = Utc::now();
        Ok(true)
    }

    async fn delete_session(&self, id: Uuid, owner_id: Uuid) -> AppResult<()> {
        let mut inner = self.inner.lock();
        let owned = inner
            .sessions
            .get(&id)
            .map(|s| s.owner_id == owner_id)
            .unwrap_or(false);
        if !owned {
            return Err(AppError::NotFound(format!("session {id}")));
        }
        inner.sessions.remove(&id);
        Ok(())
    }

    async fn get_forge_token(&self, user_id: Uuid) -> AppResult<Option<String>> {
        Ok(self.inner.lock().forge_tokens.get(&user_id).cloned())
    }

    async fn record_event(&self, event: &AnalyticsEvent) -> AppResult<()> {
        self.inner.lock().events.push(event.clone());
        Ok(())
    }
}

/// Same CAS shape as the Postgres adapter: the transition must both match
/// the chunk's current state and be legal per the FSM.
fn cas_chunk(chunk: &mut CodeChunk, from: EmbeddingStatus, to: EmbeddingStatus) -> bool {
    if chunk.embedding_status != from || !from.can_transition_to(to) {
        return false;
    }
    chunk.embedding_status = to;
    chunk.lease_deadline = None;
    chunk.updated_at = Utc::now();
    true
}

// ---------------------------------------------------------------------------
// Vector store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryVectorStore {
    points: Mutex<HashMap<Uuid, VectorPoint>>,
    pub fail_upserts: std::sync::atomic::AtomicBool,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn point_count(&self) -> usize {
        self.points.lock().len()
    }

    pub fn has_point(&self, id: Uuid) -> bool {
        self.points.lock().contains_key(&id)
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_collection(&self) -> AppResult<()> {
        Ok(())
    }

    async fn upsert_points(&self, points: &[VectorPoint]) -> AppResult<()> {
        if self.fail_upserts.load(Ordering::Relaxed) {
            return Err(AppError::UpstreamUnavailable("vector store".into()));
        }
        let mut map = self.points.lock();
        for point in points {
            map.insert(point.id, point.clone());
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        repository_ids: &[Uuid],
        limit: usize,
    ) -> AppResult<Vec<ScoredPoint>> {
        let map = self.points.lock();
        let mut scored: Vec<ScoredPoint> = map
            .values()
            .filter(|p| repository_ids.contains(&p.payload.repository_id))
            .map(|p| ScoredPoint {
                id: p.id,
                score: cosine(vector, &p.vector).clamp(0.0, 1.0),
                payload: Some(p.payload.clone()),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn delete_by_repository(&self, repository_id: Uuid) -> AppResult<()> {
        self.points
            .lock()
            .retain(|_, p| p.payload.repository_id != repository_id);
        Ok(())
    }

    async fn recreate_collection(&self) -> AppResult<()> {
        self.points.lock().clear();
        Ok(())
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 { 0.0 } else { dot / (na * nb) }
}

// ---------------------------------------------------------------------------
// Embedding provider
// ---------------------------------------------------------------------------

/// Deterministic embedder: hashes each text into a small vector. Can be told
/// to fail the first N calls, or every call.
pub struct MockEmbedder {
    pub dimension: usize,
    pub calls: AtomicUsize,
    pub fail_first: AtomicUsize,
    pub fail_always: std::sync::atomic::AtomicBool,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            calls: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(0),
            fail_always: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn embedding_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % self.dimension] += byte as f32 / 255.0;
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_always.load(Ordering::SeqCst) {
            return Err(AppError::UpstreamUnavailable("embedding provider".into()));
        }
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(AppError::UpstreamUnavailable("embedding provider".into()));
        }
        Ok(texts.iter().map(|t| self.embedding_for(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ---------------------------------------------------------------------------
// Chat model
// ---------------------------------------------------------------------------

pub struct MockChat {
    pub prompts: Mutex<Vec<(String, String)>>,
    pub reply: String,
}

impl MockChat {
    pub fn new(reply: &str) -> Self {
        Self {
            prompts: Mutex::new(Vec::new()),
            reply: reply.to_string(),
        }
    }

    pub fn last_prompt(&self) -> Option<(String, String)> {
        self.prompts.lock().last().cloned()
    }
}

#[async_trait]
impl ChatModel for MockChat {
    async fn complete(&self, system: &str, user: &str) -> AppResult<ChatCompletion> {
        self.prompts
            .lock()
            .push((system.to_string(), user.to_string()));
        Ok(ChatCompletion {
            content: self.reply.clone(),
            tokens_used: Some(42),
        })
    }
}

// ---------------------------------------------------------------------------
// Source forge
// ---------------------------------------------------------------------------

pub struct MockForge {
    pub head: String,
    pub files: BTreeMap<String, Vec<u8>>,
    pub fetch_calls: AtomicUsize,
    /// Paths that fail with UPSTREAM_UNAVAILABLE this many times before
    /// succeeding.
    pub flaky: Mutex<HashMap<String, usize>>,
}

impl MockForge {
    pub fn new(head: &str, files: &[(&str, &[u8])]) -> Self {
        Self {
            head: head.to_string(),
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_vec()))
                .collect(),
            fetch_calls: AtomicUsize::new(0),
            flaky: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SourceForge for MockForge {
    async fn branch_head(&self, _token: &str, _full: &str, _branch: &str) -> AppResult<String> {
        Ok(self.head.clone())
    }

    async fn list_tree(
        &self,
        _token: &str,
        _full: &str,
        _commit: &str,
    ) -> AppResult<Vec<TreeEntry>> {
        Ok(self
            .files
            .iter()
            .map(|(path, content)| TreeEntry {
                path: path.clone(),
                size: content.len() as u64,
                sha: format!("sha-{path}"),
            })
            .collect())
    }

    async fn fetch_file(
        &self,
        _token: &str,
        _full: &str,
        path: &str,
        _reference: &str,
    ) -> AppResult<Vec<u8>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut flaky = self.flaky.lock();
            if let Some(remaining) = flaky.get_mut(path) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(AppError::UpstreamUnavailable(format!("flaky {path}")));
                }
            }
        }
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| AppError::NotFound(path.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Convenience builders
// ---------------------------------------------------------------------------

pub fn repository(owner_id: Uuid) -> Repository {
    Repository::new(owner_id, "api".into(), "acme".into(), "api".into())
}

pub async fn seed_pending_chunks(
    store: &MemoryStore,
    repository_id: Uuid,
    count: usize,
) -> Vec<Uuid> {
    let chunks: Vec<NewChunk> = (0..count)
        .map(|i| {
            let content = format!("fn chunk_{i}() {{}}");
            NewChunk {
                file_path: format!("src/file_{i}.rs"),
                file_name: format!("file_{i}.rs"),
                language: "rust".into(),
                start_line: 1,
                end_line: 10,
                content: content.clone(),
                content_hash: crate::chunker::hash_content(&content),
                metadata: Default::default(),
            }
        })
        .collect();
    store
        .insert_chunks_ignoring_duplicates(repository_id, &chunks)
        .await
        .unwrap();
    store
        .all_chunks()
        .into_iter()
        .filter(|c| c.repository_id == repository_id)
        .map(|c| c.id)
        .collect()
}
