//! Document store adapter.
//!
//! The `DocumentStore` trait is the narrow contract the core consumes;
//! `PostgresStore` implements it on sqlx. State transitions for chunks and
//! repositories are conditional single-row updates (CAS on the current
//! status), never cross-document transactions, so the embedding pipeline and
//! the importer can share the store without coordination beyond row locking.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::models::{
    AnalyticsEvent, ChatMessage, ChatSession, ChunkMetadata, CodeChunk, EmbeddingProgress,
    EmbeddingStatus, NewChunk, RepoStatus, Repository,
};

/// Filter shared by the lexical search path; owner scoping is enforced here,
/// inside the store, not only at the API layer.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub owner_id: Uuid,
    pub repository_ids: Option<Vec<Uuid>>,
    pub language: Option<String>,
    pub file_extension: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub chunk: CodeChunk,
    /// ts_rank scalar, non-negative, unbounded above.
    pub score: f32,
    pub highlight: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LexicalPage {
    pub items: Vec<LexicalHit>,
    pub total: i64,
    pub has_more: bool,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    // Repositories
    async fn insert_repository(&self, repo: &Repository) -> AppResult<()>;
    async fn get_repository(&self, id: Uuid) -> AppResult<Repository>;
    /// NOT_FOUND for unknown ids, FORBIDDEN when owned by someone else.
    async fn get_repository_for_owner(&self, id: Uuid, owner_id: Uuid) -> AppResult<Repository>;
    async fn list_repositories_by_owner(&self, owner_id: Uuid) -> AppResult<Vec<Repository>>;
    async fn list_repository_ids_by_owner(&self, owner_id: Uuid) -> AppResult<Vec<Uuid>>;
    /// CAS pending/ready/error -> importing with progress reset.
    /// Returns false when the repository is already importing.
    async fn try_begin_import(&self, id: Uuid) -> AppResult<bool>;
    /// Progress within one import attempt is monotonically non-decreasing.
    async fn patch_import_progress(
        &self,
        id: Uuid,
        progress: i32,
        message: Option<&str>,
    ) -> AppResult<()>;
    async fn finish_import(
        &self,
        id: Uuid,
        status: RepoStatus,
        message: Option<&str>,
        last_commit: Option<&str>,
    ) -> AppResult<()>;
    async fn update_repository_counters(
        &self,
        id: Uuid,
        file_count: i64,
        line_count: i64,
        languages: &HashMap<String, i64>,
    ) -> AppResult<()>;
    async fn delete_repository(&self, id: Uuid) -> AppResult<()>;

    // Chunks
    /// Inserts treating (repository, content_hash) and span uniqueness
    /// violations as success; returns the number actually inserted.
    async fn insert_chunks_ignoring_duplicates(
        &self,
        repository_id: Uuid,
        chunks: &[NewChunk],
    ) -> AppResult<u64>;
    async fn find_chunks_by_ids(&self, ids: &[Uuid]) -> AppResult<Vec<CodeChunk>>;
    async fn find_chunks_by_status(
        &self,
        repository_id: Option<Uuid>,
        status: EmbeddingStatus,
        limit: i64,
    ) -> AppResult<Vec<CodeChunk>>;
    /// Fairly sample pending chunks (round-robin across repositories) plus
    /// chunks whose processing lease expired, CAS them to processing and
    /// stamp a fresh lease. The returned rows are owned by the caller until
    /// the lease runs out.
    async fn claim_pending_chunks(&self, limit: i64, lease: Duration) -> AppResult<Vec<CodeChunk>>;
    /// CAS processing -> completed; stores vector_ref = chunk id.
    async fn complete_chunks(&self, ids: &[Uuid]) -> AppResult<u64>;
    /// CAS processing -> pending with attempts+1, for a later retry.
    async fn release_chunks(&self, ids: &[Uuid], reason: &str) -> AppResult<u64>;
    /// CAS processing -> failed with a terminal reason.
    async fn fail_chunks(&self, ids: &[Uuid], reason: &str) -> AppResult<u64>;
    /// Admin retry: failed -> pending with attempts reset.
    async fn retry_failed_chunks(&self, repository_id: Uuid) -> AppResult<u64>;
    /// Admin re-embed: every chunk of the repository back to pending.
    async fn reset_chunks(&self, repository_id: Option<Uuid>) -> AppResult<u64>;
    async fn embedding_progress(&self, repository_id: Uuid) -> AppResult<EmbeddingProgress>;
    async fn embedding_progress_all(&self) -> AppResult<Vec<EmbeddingProgress>>;

    // Lexical search
    async fn lexical_search(
        &self,
        query: &str,
        filter: &SearchFilter,
        offset: i64,
        limit: i64,
    ) -> AppResult<LexicalPage>;

    // Chat sessions
    async fn insert_session(&self, session: &ChatSession) -> AppResult<()>;
    async fn get_session_for_owner(&self, id: Uuid, owner_id: Uuid) -> AppResult<ChatSession>;
    async fn list_sessions_by_owner(&self, owner_id: Uuid) -> AppResult<Vec<ChatSession>>;
    /// CAS append on `version`; returns false when the session moved on.
    async fn append_message(
        &self,
        session_id: Uuid,
        expected_version: i64,
        message: &ChatMessage,
        title: Option<&str>,
    ) -> AppResult<bool>;
    async fn delete_session(&self, id: Uuid, owner_id: Uuid) -> AppResult<()>;

    // Identity side-table (populated by the out-of-scope OAuth component)
    async fn get_forge_token(&self, user_id: Uuid) -> AppResult<Option<String>>;

    // Analytics (fire-and-forget; callers swallow errors)
    async fn record_event(&self, event: &AnalyticsEvent) -> AppResult<()>;
}

// ---------------------------------------------------------------------------
// PostgreSQL implementation
// ---------------------------------------------------------------------------

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(config: &AppConfig) -> AppResult<Self> {
        let options: PgConnectOptions = config
            .docstore_uri
            .parse::<PgConnectOptions>()
            .map_err(|e| AppError::ConfigInvalid(format!("DOCSTORE_URI unreadable: {e}")))?
            .database(&config.docstore_dbname);

        let pool = PgPoolOptions::new()
            .min_connections(config.docstore_pool_min)
            .max_connections(config.docstore_pool_max)
            .acquire_timeout(config.docstore_connect_timeout)
            .connect_with(options)
            .await
            .map_err(|e| AppError::UpstreamUnavailable(format!("document store: {e}")))?;

        Ok(Self { pool })
    }

    /// Idempotent schema setup; run once at startup.
    pub async fn ensure_schema(&self) -> AppResult<()> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn chunk_from_row(row: &PgRow) -> AppResult<CodeChunk> {
        let status_raw: String = row.try_get("embedding_status")?;
        let metadata_raw: serde_json::Value = row.try_get("metadata")?;
        let metadata: ChunkMetadata = serde_json::from_value(metadata_raw).unwrap_or_default();
        Ok(CodeChunk {
            id: row.try_get("id")?,
            repository_id: row.try_get("repository_id")?,
            file_path: row.try_get("file_path")?,
            file_name: row.try_get("file_name")?,
            language: row.try_get("language")?,
            start_line: row.try_get("start_line")?,
            end_line: row.try_get("end_line")?,
            content: row.try_get("content")?,
            content_hash: row.try_get("content_hash")?,
            metadata,
            embedding_status: EmbeddingStatus::parse(&status_raw).ok_or_else(|| {
                AppError::Internal(format!("unknown embedding_status in store: {status_raw}"))
            })?,
            vector_ref: row.try_get("vector_ref")?,
            attempts: row.try_get("attempts")?,
            failure_reason: row.try_get("failure_reason")?,
            lease_deadline: row.try_get("lease_deadline")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn repository_from_row(row: &PgRow) -> AppResult<Repository> {
        let status_raw: String = row.try_get("status")?;
        let languages_raw: serde_json::Value = row.try_get("languages")?;
        Ok(Repository {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            name: row.try_get("name")?,
            gh_owner: row.try_get("gh_owner")?,
            gh_name: row.try_get("gh_name")?,
            gh_full_name: row.try_get("gh_full_name")?,
            gh_repo_id: row.try_get("gh_repo_id")?,
            default_branch: row.try_get("default_branch")?,
            is_private: row.try_get("is_private")?,
            status: RepoStatus::parse(&status_raw).ok_or_else(|| {
                AppError::Internal(format!("unknown repository status in store: {status_raw}"))
            })?,
            import_progress: row.try_get("import_progress")?,
            status_message: row.try_get("status_message")?,
            last_commit: row.try_get("last_commit")?,
            file_count: row.try_get("file_count")?,
            line_count: row.try_get("line_count")?,
            languages: serde_json::from_value(languages_raw).unwrap_or_default(),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn session_from_row(row: &PgRow) -> AppResult<ChatSession> {
        let messages_raw: serde_json::Value = row.try_get("messages")?;
        Ok(ChatSession {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            repository_id: row.try_get("repository_id")?,
            title: row.try_get("title")?,
            messages: serde_json::from_value(messages_raw)?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn progress_from_row(row: &PgRow) -> AppResult<EmbeddingProgress> {
        Ok(EmbeddingProgress {
            repository_id: row.try_get("repository_id")?,
            total: row.try_get("total")?,
            pending: row.try_get("pending")?,
            processing: row.try_get("processing")?,
            completed: row.try_get("completed")?,
            failed: row.try_get("failed")?,
        })
    }
}

const CHUNK_COLUMNS: &str = "id, repository_id, file_path, file_name, language, start_line, \
     end_line, content, content_hash, metadata, embedding_status, vector_ref, attempts, \
     failure_reason, lease_deadline, created_at, updated_at";

/// Validate a chunk transition against the FSM before issuing the
/// conditional update; returns the (from, to) column values to bind. Keeps
/// `EmbeddingStatus::can_transition_to` the single source of truth instead
/// of state literals scattered through the SQL.
fn chunk_transition(
    from: EmbeddingStatus,
    to: EmbeddingStatus,
) -> AppResult<(&'static str, &'static str)> {
    if !from.can_transition_to(to) {
        return Err(AppError::Internal(format!(
            "illegal chunk transition {} -> {}",
            from.as_str(),
            to.as_str()
        )));
    }
    Ok((from.as_str(), to.as_str()))
}

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS repositories (
        id UUID PRIMARY KEY,
        owner_id UUID NOT NULL,
        name TEXT NOT NULL,
        gh_owner TEXT NOT NULL,
        gh_name TEXT NOT NULL,
        gh_full_name TEXT NOT NULL,
        gh_repo_id BIGINT NOT NULL DEFAULT 0,
        default_branch TEXT NOT NULL DEFAULT 'main',
        is_private BOOLEAN NOT NULL DEFAULT FALSE,
        status TEXT NOT NULL DEFAULT 'pending',
        import_progress INT NOT NULL DEFAULT 0,
        status_message TEXT,
        last_commit TEXT,
        file_count BIGINT NOT NULL DEFAULT 0,
        line_count BIGINT NOT NULL DEFAULT 0,
        languages JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS repositories_owner_idx ON repositories (owner_id)",
    r#"
    CREATE TABLE IF NOT EXISTS code_chunks (
        id UUID PRIMARY KEY,
        repository_id UUID NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
        file_path TEXT NOT NULL,
        file_name TEXT NOT NULL,
        language TEXT NOT NULL,
        start_line INT NOT NULL,
        end_line INT NOT NULL CHECK (end_line >= start_line),
        content TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        symbols_text TEXT NOT NULL DEFAULT '',
        embedding_status TEXT NOT NULL DEFAULT 'pending',
        vector_ref UUID,
        attempts INT NOT NULL DEFAULT 0,
        failure_reason TEXT,
        lease_deadline TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        search_vector tsvector GENERATED ALWAYS AS (
            setweight(to_tsvector('english', coalesce(content, '')), 'A') ||
            setweight(to_tsvector('english', coalesce(file_name, '')), 'B') ||
            setweight(to_tsvector('english', coalesce(symbols_text, '')), 'C')
        ) STORED
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS code_chunks_span_key \
     ON code_chunks (repository_id, file_path, start_line, end_line)",
    "CREATE UNIQUE INDEX IF NOT EXISTS code_chunks_hash_key \
     ON code_chunks (repository_id, content_hash)",
    "CREATE INDEX IF NOT EXISTS code_chunks_status_idx \
     ON code_chunks (embedding_status, repository_id)",
    "CREATE INDEX IF NOT EXISTS code_chunks_search_idx \
     ON code_chunks USING GIN (search_vector)",
    r#"
    CREATE TABLE IF NOT EXISTS chat_sessions (
        id UUID PRIMARY KEY,
        owner_id UUID NOT NULL,
        repository_id UUID NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
        title TEXT,
        messages JSONB NOT NULL DEFAULT '[]'::jsonb,
        version BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS chat_sessions_owner_idx ON chat_sessions (owner_id)",
    r#"
    CREATE TABLE IF NOT EXISTS analytics_events (
        id UUID PRIMARY KEY,
        owner_id UUID NOT NULL,
        kind TEXT NOT NULL,
        payload JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_credentials (
        user_id UUID PRIMARY KEY,
        forge_token TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
];

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn insert_repository(&self, repo: &Repository) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO repositories \
             (id, owner_id, name, gh_owner, gh_name, gh_full_name, gh_repo_id, default_branch, \
              is_private, status, import_progress, status_message, last_commit, file_count, \
              line_count, languages, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18)",
        )
        .bind(repo.id)
        .bind(repo.owner_id)
        .bind(&repo.name)
        .bind(&repo.gh_owner)
        .bind(&repo.gh_name)
        .bind(&repo.gh_full_name)
        .bind(repo.gh_repo_id)
        .bind(&repo.default_branch)
        .bind(repo.is_private)
        .bind(repo.status.as_str())
        .bind(repo.import_progress)
        .bind(&repo.status_message)
        .bind(&repo.last_commit)
        .bind(repo.file_count)
        .bind(repo.line_count)
        .bind(serde_json::to_value(&repo.languages)?)
        .bind(repo.created_at)
        .bind(repo.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_repository(&self, id: Uuid) -> AppResult<Repository> {
        let row = sqlx::query("SELECT * FROM repositories WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("repository {id}")))?;
        Self::repository_from_row(&row)
    }

    async fn get_repository_for_owner(&self, id: Uuid, owner_id: Uuid) -> AppResult<Repository> {
        let repo = self.get_repository(id).await?;
        if repo.owner_id != owner_id {
            return Err(AppError::Forbidden(format!("repository {id}")));
        }
        Ok(repo)
    }

    async fn list_repositories_by_owner(&self, owner_id: Uuid) -> AppResult<Vec<Repository>> {
        let rows =
            sqlx::query("SELECT * FROM repositories WHERE owner_id = $1 ORDER BY created_at DESC")
                .bind(owner_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(Self::repository_from_row).collect()
    }

    async fn list_repository_ids_by_owner(&self, owner_id: Uuid) -> AppResult<Vec<Uuid>> {
        let rows = sqlx::query("SELECT id FROM repositories WHERE owner_id = $1")
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<Uuid, _>("id").map_err(AppError::from))
            .collect()
    }

    async fn try_begin_import(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE repositories \
             SET status = $2, import_progress = 0, status_message = NULL, \
                 updated_at = now() \
             WHERE id = $1 AND status = ANY($3)",
        )
        .bind(id)
        .bind(RepoStatus::Importing.as_str())
        .bind(RepoStatus::transition_sources(RepoStatus::Importing))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn patch_import_progress(
        &self,
        id: Uuid,
        progress: i32,
        message: Option<&str>,
    ) -> AppResult<()> {
        // GREATEST keeps progress monotone even if batches report out of order.
        sqlx::query(
            "UPDATE repositories \
             SET import_progress = GREATEST(import_progress, $2), \
                 status_message = COALESCE($3, status_message), updated_at = now() \
             WHERE id = $1 AND status = $4",
        )
        .bind(id)
        .bind(progress.clamp(0, 100))
        .bind(message)
        .bind(RepoStatus::Importing.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_import(
        &self,
        id: Uuid,
        status: RepoStatus,
        message: Option<&str>,
        last_commit: Option<&str>,
    ) -> AppResult<()> {
        if !RepoStatus::Importing.can_transition_to(status) {
            return Err(AppError::Internal(format!(
                "illegal repository transition importing -> {}",
                status.as_str()
            )));
        }
        let progress = (status == RepoStatus::Ready).then_some(100);
        sqlx::query(
            "UPDATE repositories \
             SET status = $2, \
                 import_progress = COALESCE($3, import_progress), \
                 status_message = $4, \
                 last_commit = COALESCE($5, last_commit), \
                 updated_at = now() \
             WHERE id = $1 AND status = ANY($6)",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(progress)
        .bind(message)
        .bind(last_commit)
        .bind(RepoStatus::transition_sources(status))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_repository_counters(
        &self,
        id: Uuid,
        file_count: i64,
        line_count: i64,
        languages: &HashMap<String, i64>,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE repositories \
             SET file_count = $2, line_count = $3, languages = $4, updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(file_count)
        .bind(line_count)
        .bind(serde_json::to_value(languages)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_repository(&self, id: Uuid) -> AppResult<()> {
        // Chunks and sessions cascade via foreign keys.
        let result = sqlx::query("DELETE FROM repositories WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("repository {id}")));
        }
        Ok(())
    }

    async fn insert_chunks_ignoring_duplicates(
        &self,
        repository_id: Uuid,
        chunks: &[NewChunk],
    ) -> AppResult<u64> {
        let mut inserted = 0u64;
        // Bounded statement size: Postgres caps bind parameters at 65535.
        for group in chunks.chunks(500) {
            let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(
                "INSERT INTO code_chunks \
                 (id, repository_id, file_path, file_name, language, start_line, end_line, \
                  content, content_hash, metadata, symbols_text, embedding_status) ",
            );
            builder.push_values(group, |mut b, chunk| {
                b.push_bind(Uuid::new_v4())
                    .push_bind(repository_id)
                    .push_bind(&chunk.file_path)
                    .push_bind(&chunk.file_name)
                    .push_bind(&chunk.language)
                    .push_bind(chunk.start_line)
                    .push_bind(chunk.end_line)
                    .push_bind(&chunk.content)
                    .push_bind(&chunk.content_hash)
                    .push_bind(
                        serde_json::to_value(&chunk.metadata)
                            .unwrap_or_else(|_| serde_json::json!({})),
                    )
                    .push_bind(chunk.metadata.symbols_text())
                    .push_bind(EmbeddingStatus::Pending.as_str());
            });
            builder.push(" ON CONFLICT DO NOTHING");
            let result = builder.build().execute(&self.pool).await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn find_chunks_by_ids(&self, ids: &[Uuid]) -> AppResult<Vec<CodeChunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM code_chunks WHERE id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::chunk_from_row).collect()
    }

    async fn find_chunks_by_status(
        &self,
        repository_id: Option<Uuid>,
        status: EmbeddingStatus,
        limit: i64,
    ) -> AppResult<Vec<CodeChunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM code_chunks \
             WHERE embedding_status = $1 \
               AND ($2::uuid IS NULL OR repository_id = $2) \
             ORDER BY updated_at DESC LIMIT $3"
        ))
        .bind(status.as_str())
        .bind(repository_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::chunk_from_row).collect()
    }

    async fn claim_pending_chunks(&self, limit: i64, lease: Duration) -> AppResult<Vec<CodeChunk>> {
        // Round-robin by repository: rank chunks within each repository and
        // take the lowest ranks first, so one huge repository cannot starve
        // the others. Expired processing leases are reclaimed in the same
        // sweep. The UPDATE re-checks eligibility, making the transition a
        // CAS under row locking.
        let (pending, processing) =
            chunk_transition(EmbeddingStatus::Pending, EmbeddingStatus::Processing)?;
        let rows = sqlx::query(&format!(
            "WITH eligible AS ( \
                 SELECT id, ROW_NUMBER() OVER ( \
                     PARTITION BY repository_id ORDER BY created_at, id \
                 ) AS rn \
                 FROM code_chunks \
                 WHERE embedding_status = $3 \
                    OR (embedding_status = $4 AND lease_deadline < now()) \
             ), picked AS ( \
                 SELECT id FROM eligible ORDER BY rn, id LIMIT $1 \
             ) \
             UPDATE code_chunks c \
             SET embedding_status = $4, \
                 lease_deadline = now() + make_interval(secs => $2), \
                 updated_at = now() \
             FROM picked p \
             WHERE c.id = p.id \
               AND (c.embedding_status = $3 \
                    OR (c.embedding_status = $4 AND c.lease_deadline < now())) \
             RETURNING {columns}",
            columns = CHUNK_COLUMNS
                .split(", ")
                .map(|c| format!("c.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(limit)
        .bind(lease.as_secs_f64())
        .bind(pending)
        .bind(processing)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::chunk_from_row).collect()
    }

    async fn complete_chunks(&self, ids: &[Uuid]) -> AppResult<u64> {
        let (from, to) = chunk_transition(EmbeddingStatus::Processing, EmbeddingStatus::Completed)?;
        let result = sqlx::query(
            "UPDATE code_chunks \
             SET embedding_status = $2, vector_ref = id, lease_deadline = NULL, \
                 failure_reason = NULL, updated_at = now() \
             WHERE id = ANY($1) AND embedding_status = $3",
        )
        .bind(ids)
        .bind(to)
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn release_chunks(&self, ids: &[Uuid], reason: &str) -> AppResult<u64> {
        let (from, to) = chunk_transition(EmbeddingStatus::Processing, EmbeddingStatus::Pending)?;
        let result = sqlx::query(
            "UPDATE code_chunks \
             SET embedding_status = $3, attempts = attempts + 1, \
                 failure_reason = $2, lease_deadline = NULL, updated_at = now() \
             WHERE id = ANY($1) AND embedding_status = $4",
        )
        .bind(ids)
        .bind(reason)
        .bind(to)
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn fail_chunks(&self, ids: &[Uuid], reason: &str) -> AppResult<u64> {
        let (from, to) = chunk_transition(EmbeddingStatus::Processing, EmbeddingStatus::Failed)?;
        let result = sqlx::query(
            "UPDATE code_chunks \
             SET embedding_status = $3, attempts = attempts + 1, \
                 failure_reason = $2, lease_deadline = NULL, updated_at = now() \
             WHERE id = ANY($1) AND embedding_status = $4",
        )
        .bind(ids)
        .bind(reason)
        .bind(to)
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn retry_failed_chunks(&self, repository_id: Uuid) -> AppResult<u64> {
        let (from, to) = chunk_transition(EmbeddingStatus::Failed, EmbeddingStatus::Pending)?;
        let result = sqlx::query(
            "UPDATE code_chunks \
             SET embedding_status = $3, attempts = 0, failure_reason = NULL, \
                 updated_at = now() \
             WHERE repository_id = $1 AND embedding_status = $2",
        )
        .bind(repository_id)
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reset_chunks(&self, repository_id: Option<Uuid>) -> AppResult<u64> {
        // Bulk re-embed is an admin wipe of embedding state, not a CAS: it
        // applies to every chunk whatever state it is in.
        let result = sqlx::query(
            "UPDATE code_chunks \
             SET embedding_status = $2, attempts = 0, failure_reason = NULL, \
                 vector_ref = NULL, lease_deadline = NULL, updated_at = now() \
             WHERE $1::uuid IS NULL OR repository_id = $1",
        )
        .bind(repository_id)
        .bind(EmbeddingStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn embedding_progress(&self, repository_id: Uuid) -> AppResult<EmbeddingProgress> {
        let row = sqlx::query(
            "SELECT $1::uuid AS repository_id, \
                    COUNT(*) AS total, \
                    COUNT(*) FILTER (WHERE embedding_status = 'pending') AS pending, \
                    COUNT(*) FILTER (WHERE embedding_status = 'processing') AS processing, \
                    COUNT(*) FILTER (WHERE embedding_status = 'completed') AS completed, \
                    COUNT(*) FILTER (WHERE embedding_status = 'failed') AS failed \
             FROM code_chunks WHERE repository_id = $1",
        )
        .bind(repository_id)
        .fetch_one(&self.pool)
        .await?;
        Self::progress_from_row(&row)
    }

    async fn embedding_progress_all(&self) -> AppResult<Vec<EmbeddingProgress>> {
        let rows = sqlx::query(
            "SELECT repository_id, \
                    COUNT(*) AS total, \
                    COUNT(*) FILTER (WHERE embedding_status = 'pending') AS pending, \
                    COUNT(*) FILTER (WHERE embedding_status = 'processing') AS processing, \
                    COUNT(*) FILTER (WHERE embedding_status = 'completed') AS completed, \
                    COUNT(*) FILTER (WHERE embedding_status = 'failed') AS failed \
             FROM code_chunks GROUP BY repository_id ORDER BY repository_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::progress_from_row).collect()
    }

    async fn lexical_search(
        &self,
        query: &str,
        filter: &SearchFilter,
        offset: i64,
        limit: i64,
    ) -> AppResult<LexicalPage> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS}, \
                    ts_rank(search_vector, plainto_tsquery('english', $1)) AS rank, \
                    ts_headline('english', content, plainto_tsquery('english', $1), \
                                'MaxFragments=1, MaxWords=30, MinWords=5') AS headline, \
                    COUNT(*) OVER () AS total_rows \
             FROM code_chunks \
             WHERE search_vector @@ plainto_tsquery('english', $1) \
               AND repository_id IN (SELECT id FROM repositories WHERE owner_id = $2) \
               AND ($3::uuid[] IS NULL OR repository_id = ANY($3)) \
               AND ($4::text IS NULL OR language = $4) \
               AND ($5::text IS NULL OR file_path LIKE '%.' || $5) \
             ORDER BY rank DESC, id ASC \
             OFFSET $6 LIMIT $7"
        ))
        .bind(query)
        .bind(filter.owner_id)
        .bind(filter.repository_ids.as_deref())
        .bind(filter.language.as_deref())
        .bind(
            filter
                .file_extension
                .as_deref()
                .map(|e| e.trim_start_matches('.')),
        )
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let total = rows
            .first()
            .map(|r| r.try_get::<i64, _>("total_rows"))
            .transpose()?
            .unwrap_or(0);

        let items = rows
            .iter()
            .map(|row| {
                let chunk = Self::chunk_from_row(row)?;
                let score: f32 = row.try_get("rank")?;
                let highlight: Option<String> = row.try_get("headline")?;
                Ok(LexicalHit {
                    chunk,
                    score,
                    highlight,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        let has_more = offset + (items.len() as i64) < total;
        Ok(LexicalPage {
            items,
            total,
            has_more,
        })
    }

    async fn insert_session(&self, session: &ChatSession) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO chat_sessions \
             (id, owner_id, repository_id, title, messages, version, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
        )
        .bind(session.id)
        .bind(session.owner_id)
        .bind(session.repository_id)
        .bind(&session.title)
        .bind(serde_json::to_value(&session.messages)?)
        .bind(session.version)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session_for_owner(&self, id: Uuid, owner_id: Uuid) -> AppResult<ChatSession> {
        let row = sqlx::query("SELECT * FROM chat_sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {id}")))?;
        let session = Self::session_from_row(&row)?;
        if session.owner_id != owner_id {
            return Err(AppError::Forbidden(format!("session {id}")));
        }
        Ok(session)
    }

    async fn list_sessions_by_owner(&self, owner_id: Uuid) -> AppResult<Vec<ChatSession>> {
        let rows = sqlx::query(
            "SELECT * FROM chat_sessions WHERE owner_id = $1 ORDER BY updated_at DESC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::session_from_row).collect()
    }

    async fn append_message(
        &self,
        session_id: Uuid,
        expected_version: i64,
        message: &ChatMessage,
        title: Option<&str>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE chat_sessions \
             SET messages = messages || $3::jsonb, version = version + 1, \
                 title = COALESCE(title, $4), updated_at = now() \
             WHERE id = $1 AND version = $2",
        )
        .bind(session_id)
        .bind(expected_version)
        .bind(serde_json::to_value(message)?)
        .bind(title)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_session(&self, id: Uuid, owner_id: Uuid) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM chat_sessions WHERE id = $1 AND owner_id = $2")
            .bind(id)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    async fn get_forge_token(&self, user_id: Uuid) -> AppResult<Option<String>> {
        let row = sqlx::query("SELECT forge_token FROM user_credentials WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get::<String, _>("forge_token").map_err(AppError::from))
            .transpose()
    }

    async fn record_event(&self, event: &AnalyticsEvent) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO analytics_events (id, owner_id, kind, payload, created_at) \
             VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(event.id)
        .bind(event.owner_id)
        .bind(&event.kind)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Truncate a session title candidate to 80 characters on a char boundary.
pub fn derive_session_title(first_message: &str) -> String {
    let trimmed = first_message.trim();
    trimmed.chars().take(80).collect()
}
