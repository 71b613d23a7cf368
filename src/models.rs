use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a repository import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoStatus {
    Pending,
    Importing,
    Ready,
    Error,
}

impl RepoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoStatus::Pending => "pending",
            RepoStatus::Importing => "importing",
            RepoStatus::Ready => "ready",
            RepoStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(RepoStatus::Pending),
            "importing" => Some(RepoStatus::Importing),
            "ready" => Some(RepoStatus::Ready),
            "error" => Some(RepoStatus::Error),
            _ => None,
        }
    }

    pub const ALL: [RepoStatus; 4] = [
        RepoStatus::Pending,
        RepoStatus::Importing,
        RepoStatus::Ready,
        RepoStatus::Error,
    ];

    /// Allowed transitions: pending/error/ready may (re)enter importing;
    /// importing resolves to ready or error. A ready repository is demoted
    /// only by a failed re-index, which passes through importing first.
    pub fn can_transition_to(&self, next: RepoStatus) -> bool {
        matches!(
            (self, next),
            (RepoStatus::Pending, RepoStatus::Importing)
                | (RepoStatus::Error, RepoStatus::Importing)
                | (RepoStatus::Ready, RepoStatus::Importing)
                | (RepoStatus::Importing, RepoStatus::Ready)
                | (RepoStatus::Importing, RepoStatus::Error)
        )
    }

    /// States permitted to enter `next`. The document store builds its
    /// conditional updates from this, so the FSM above is the single source
    /// of truth for repository transitions.
    pub fn transition_sources(next: RepoStatus) -> Vec<&'static str> {
        Self::ALL
            .iter()
            .filter(|s| s.can_transition_to(next))
            .map(|s| s.as_str())
            .collect()
    }
}

/// Lifecycle of a single chunk's embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EmbeddingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingStatus::Pending => "pending",
            EmbeddingStatus::Processing => "processing",
            EmbeddingStatus::Completed => "completed",
            EmbeddingStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(EmbeddingStatus::Pending),
            "processing" => Some(EmbeddingStatus::Processing),
            "completed" => Some(EmbeddingStatus::Completed),
            "failed" => Some(EmbeddingStatus::Failed),
            _ => None,
        }
    }

    /// A worker may only move a chunk it holds in `processing`; admin retry
    /// moves `failed` back to `pending`.
    pub fn can_transition_to(&self, next: EmbeddingStatus) -> bool {
        matches!(
            (self, next),
            (EmbeddingStatus::Pending, EmbeddingStatus::Processing)
                | (EmbeddingStatus::Processing, EmbeddingStatus::Completed)
                | (EmbeddingStatus::Processing, EmbeddingStatus::Pending)
                | (EmbeddingStatus::Processing, EmbeddingStatus::Failed)
                | (EmbeddingStatus::Failed, EmbeddingStatus::Pending)
                | (EmbeddingStatus::Completed, EmbeddingStatus::Pending)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub gh_owner: String,
    pub gh_name: String,
    pub gh_full_name: String,
    pub gh_repo_id: i64,
    pub default_branch: String,
    pub is_private: bool,
    pub status: RepoStatus,
    pub import_progress: i32,
    pub status_message: Option<String>,
    pub last_commit: Option<String>,
    pub file_count: i64,
    pub line_count: i64,
    /// language -> total lines, accumulated at import time
    pub languages: HashMap<String, i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    pub fn new(owner_id: Uuid, name: String, gh_owner: String, gh_name: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            gh_full_name: format!("{gh_owner}/{gh_name}"),
            name,
            gh_owner,
            gh_name,
            gh_repo_id: 0,
            default_branch: "main".to_string(),
            is_private: false,
            status: RepoStatus::Pending,
            import_progress: 0,
            status_message: None,
            last_commit: None,
            file_count: 0,
            line_count: 0,
            languages: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Light, best-effort structure extracted from a chunk's text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub functions: Vec<String>,
    pub classes: Vec<String>,
    pub imports: Vec<String>,
    pub complexity: u32,
}

impl ChunkMetadata {
    /// Flattened symbol text fed to the lexical index.
    pub fn symbols_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        parts.extend(self.functions.iter().map(String::as_str));
        parts.extend(self.classes.iter().map(String::as_str));
        parts.extend(self.imports.iter().map(String::as_str));
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeChunk {
    pub id: Uuid,
    pub repository_id: Uuid,
    pub file_path: String,
    pub file_name: String,
    pub language: String,
    /// 1-based, inclusive
    pub start_line: i32,
    /// 1-based, inclusive; end_line >= start_line
    pub end_line: i32,
    pub content: String,
    /// SHA-256 hex of `content`
    pub content_hash: String,
    pub metadata: ChunkMetadata,
    pub embedding_status: EmbeddingStatus,
    /// Vector store point id once embedded (equal to `id`).
    pub vector_ref: Option<Uuid>,
    pub attempts: i32,
    pub failure_reason: Option<String>,
    pub lease_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Chunk as produced by the chunker, before persistence assigns timestamps
/// and embedding state.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub file_path: String,
    pub file_name: String,
    pub language: String,
    pub start_line: i32,
    pub end_line: i32,
    pub content: String,
    pub content_hash: String,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Chunk ids actually included in the prompt; only populated for
    /// assistant messages.
    #[serde(default)]
    pub retrieved_chunk_refs: Vec<Uuid>,
    #[serde(default)]
    pub tokens_used: Option<u32>,
}

impl ChatMessage {
    pub fn user(content: String) -> Self {
        Self {
            role: MessageRole::User,
            content,
            timestamp: Utc::now(),
            retrieved_chunk_refs: Vec::new(),
            tokens_used: None,
        }
    }

    pub fn assistant(content: String, refs: Vec<Uuid>, tokens_used: Option<u32>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content,
            timestamp: Utc::now(),
            retrieved_chunk_refs: refs,
            tokens_used,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub repository_id: Uuid,
    pub title: Option<String>,
    pub messages: Vec<ChatMessage>,
    /// Bumped on every append; appends are CAS on this value.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(owner_id: Uuid, repository_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            repository_id,
            title: None,
            messages: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Derived (never stored) embedding state of a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoEmbeddingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingProgress {
    pub repository_id: Uuid,
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl EmbeddingProgress {
    pub fn percent(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            (self.completed as f32 / self.total as f32) * 100.0
        }
    }

    pub fn derived_status(&self) -> RepoEmbeddingStatus {
        if self.total == 0 {
            RepoEmbeddingStatus::Pending
        } else if self.pending > 0 || self.processing > 0 {
            RepoEmbeddingStatus::Processing
        } else if self.failed > 0 {
            RepoEmbeddingStatus::Failed
        } else {
            RepoEmbeddingStatus::Completed
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AnalyticsEvent {
    pub fn new(owner_id: Uuid, kind: &str, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            kind: kind.to_string(),
            payload,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire shapes shared by the search engine and the routes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchItem {
    pub chunk_id: Uuid,
    pub repository_id: Uuid,
    pub file_path: String,
    pub file_name: String,
    pub language: String,
    pub start_line: i32,
    pub end_line: i32,
    pub content: String,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlight: Option<String>,
    pub metadata: ChunkMetadata,
}

impl SearchItem {
    pub fn from_chunk(chunk: &CodeChunk, score: f32, highlight: Option<String>) -> Self {
        Self {
            chunk_id: chunk.id,
            repository_id: chunk.repository_id,
            file_path: chunk.file_path.clone(),
            file_name: chunk.file_name.clone(),
            language: chunk.language.clone(),
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            content: chunk.content.clone(),
            score,
            highlight,
            metadata: chunk.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridItem {
    #[serde(flatten)]
    pub item: SearchItem,
    pub lexical_score: f32,
    pub vector_score: f32,
    pub fused_score: f32,
}
