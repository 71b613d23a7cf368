use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Maximum allowed length for search queries and chat messages (characters).
pub const MAX_QUERY_LENGTH: usize = 1000;

/// Vector dimensions the deployment may be configured with. Anything else is
/// rejected at startup; a collection created with a different dimension is a
/// fatal mismatch.
pub const SUPPORTED_VECTOR_DIMENSIONS: &[usize] = &[256, 512, 768, 1024, 2048];

/// Minimum line count for an end-of-file chunk window; shorter tails are
/// merged into the previous window.
pub const MIN_TAIL_LINES: usize = 3;

/// Maximum characters accepted per text by the embedding provider. Longer
/// chunk contents are truncated on a line boundary before being sent.
pub const EMBEDDING_MAX_INPUT_CHARS: usize = 8192;

/// Directory names that are never imported, wherever they appear in a path.
/// Covers vendored code, build output and editor state.
pub const EXCLUDED_DIRECTORIES: &[&str] = &[
    "node_modules",
    ".git",
    "target",
    "dist",
    "build",
    "out",
    ".next",
    ".nuxt",
    ".output",
    ".vite",
    ".turbo",
    ".svelte-kit",
    "__pycache__",
    ".tox",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
    "coverage",
    ".nyc_output",
    ".cache",
    "vendor",
    ".gradle",
    ".terraform",
    ".eggs",
    ".vscode",
    ".idea",
    "__generated__",
    ".cargo",
];

/// Lockfiles that are skipped by exact name.
pub const EXCLUDED_FILES: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.lock",
    "poetry.lock",
    "Pipfile.lock",
    "Gemfile.lock",
    "composer.lock",
    "go.sum",
    "flake.lock",
];

/// Generated-artifact suffixes that are skipped.
pub const EXCLUDED_SUFFIXES: &[&str] = &[".min.js", ".min.css", ".map", ".pb.go", ".generated.ts"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // Bind address
    pub server_host: String,
    pub server_port: u16,

    // Document store
    pub docstore_uri: String,
    pub docstore_dbname: String,
    pub docstore_pool_min: u32,
    pub docstore_pool_max: u32,
    pub docstore_connect_timeout: Duration,
    pub docstore_timeout: Duration,

    // Vector store
    pub vectorstore_url: String,
    pub vectorstore_api_key: Option<String>,
    pub vectorstore_collection: String,
    pub vector_dimension: usize,
    pub vectorstore_timeout: Duration,

    // Embedding provider
    pub embedding_base_url: String,
    pub embedding_api_key: String,
    pub embedding_model: String,
    pub embedding_timeout: Duration,
    pub embedding_batch_size: usize,
    pub embedding_workers: usize,
    pub embedding_max_attempts: u32,

    // Chunker
    pub chunk_size: usize,
    pub chunk_overlap: usize,

    // Chat LLM
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_request_timeout: Duration,

    // RAG budget
    pub max_prompt_length: usize,
    pub llm_context_length: usize,
    pub chat_context_chunks: usize,
    pub chat_vector_weight: f32,

    // Importer
    pub github_batch_size: usize,
    pub github_max_file_size: u64,
    pub github_file_timeout: Duration,

    // Embedding pipeline
    pub lease_ttl: Duration,
    pub idle_poll_interval: Duration,
    pub shutdown_grace: Duration,

    // Session token verification
    pub auth_secret: String,
}

impl AppConfig {
    /// Read every recognized option from the environment, apply defaults and
    /// validate. This is the only place the process reads environment
    /// variables; components receive the typed record.
    pub fn from_env() -> AppResult<Self> {
        let config = Self {
            server_host: env_or("SERVER_HOST", "0.0.0.0"),
            server_port: env_parse("SERVER_PORT", 8080)?,

            docstore_uri: env_required("DOCSTORE_URI")?,
            docstore_dbname: env_required("DOCSTORE_DBNAME")?,
            docstore_pool_min: env_parse("DOCSTORE_POOL_MIN", 5)?,
            docstore_pool_max: env_parse("DOCSTORE_POOL_MAX", 100)?,
            docstore_connect_timeout: Duration::from_secs(env_parse(
                "DOCSTORE_CONNECT_TIMEOUT",
                10,
            )?),
            docstore_timeout: Duration::from_secs(5),

            vectorstore_url: env_required("VECTORSTORE_URL")?,
            vectorstore_api_key: std::env::var("VECTORSTORE_API_KEY")
                .ok()
                .filter(|v| !v.is_empty()),
            vectorstore_collection: env_or("VECTORSTORE_COLLECTION", "codechunks"),
            vector_dimension: env_parse("VECTOR_DIMENSION", 1024)?,
            vectorstore_timeout: Duration::from_secs(5),

            embedding_base_url: env_required("EMBEDDING_BASE_URL")?,
            embedding_api_key: env_required("EMBEDDING_API_KEY")?,
            embedding_model: env_required("EMBEDDING_MODEL")?,
            embedding_timeout: Duration::from_secs(30),
            embedding_batch_size: env_parse("EMBEDDING_BATCH_SIZE", 50)?,
            embedding_workers: env_parse("EMBEDDING_WORKERS_NUM", 3)?,
            embedding_max_attempts: 5,

            chunk_size: env_parse("CHUNK_SIZE", 30)?,
            chunk_overlap: env_parse("CHUNK_OVERLAP_SIZE", 10)?,

            llm_base_url: env_required("LLM_BASE_URL")?,
            llm_api_key: env_required("LLM_API_KEY")?,
            llm_model: env_required("LLM_MODEL")?,
            llm_request_timeout: Duration::from_secs(env_parse("LLM_REQUEST_TIMEOUT", 30)?),

            max_prompt_length: env_parse("MAX_PROMPT_LENGTH", 12_000)?,
            llm_context_length: env_parse("LLM_CONTEXT_LENGTH", 32_000)?,
            chat_context_chunks: env_parse("CHAT_CONTEXT_CHUNKS", 8)?,
            chat_vector_weight: env_parse("CHAT_VECTOR_WEIGHT", 0.7f32)?,

            github_batch_size: env_parse("GITHUB_BATCH_SIZE", 50)?,
            github_max_file_size: env_parse("GITHUB_MAX_FILE_SIZE", 1024 * 1024u64)?,
            github_file_timeout: Duration::from_secs(15),

            lease_ttl: Duration::from_secs(env_parse("EMBEDDING_LEASE_TTL", 120)?),
            idle_poll_interval: Duration::from_secs(env_parse("EMBEDDING_IDLE_POLL", 5)?),
            shutdown_grace: Duration::from_secs(30),

            auth_secret: env_required("AUTH_SECRET")?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if !SUPPORTED_VECTOR_DIMENSIONS.contains(&self.vector_dimension) {
            return Err(AppError::ConfigInvalid(format!(
                "VECTOR_DIMENSION must be one of {:?}, got {}",
                SUPPORTED_VECTOR_DIMENSIONS, self.vector_dimension
            )));
        }
        if self.chunk_size == 0 {
            return Err(AppError::ConfigInvalid("CHUNK_SIZE must be > 0".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(AppError::ConfigInvalid(format!(
                "CHUNK_OVERLAP_SIZE ({}) must be smaller than CHUNK_SIZE ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.embedding_batch_size == 0 || self.embedding_workers == 0 {
            return Err(AppError::ConfigInvalid(
                "EMBEDDING_BATCH_SIZE and EMBEDDING_WORKERS_NUM must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.chat_vector_weight) {
            return Err(AppError::ConfigInvalid(format!(
                "CHAT_VECTOR_WEIGHT must be within [0, 1], got {}",
                self.chat_vector_weight
            )));
        }
        if self.docstore_pool_min > self.docstore_pool_max {
            return Err(AppError::ConfigInvalid(format!(
                "DOCSTORE_POOL_MIN ({}) exceeds DOCSTORE_POOL_MAX ({})",
                self.docstore_pool_min, self.docstore_pool_max
            )));
        }
        if self.auth_secret.len() < 16 {
            return Err(AppError::ConfigInvalid(
                "AUTH_SECRET must be at least 16 bytes".into(),
            ));
        }
        if self.max_prompt_length > self.llm_context_length {
            return Err(AppError::ConfigInvalid(format!(
                "MAX_PROMPT_LENGTH ({}) exceeds LLM_CONTEXT_LENGTH ({})",
                self.max_prompt_length, self.llm_context_length
            )));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_required(name: &str) -> AppResult<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::ConfigInvalid(format!("{name} is required")))
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> AppResult<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|_| AppError::ConfigInvalid(format!("{name} has an unreadable value: {raw}"))),
        _ => Ok(default),
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        server_host: "127.0.0.1".into(),
        server_port: 8080,
        docstore_uri: "postgres://localhost:5432".into(),
        docstore_dbname: "repodex".into(),
        docstore_pool_min: 5,
        docstore_pool_max: 100,
        docstore_connect_timeout: Duration::from_secs(10),
        docstore_timeout: Duration::from_secs(5),
        vectorstore_url: "http://localhost:6333".into(),
        vectorstore_api_key: None,
        vectorstore_collection: "codechunks".into(),
        vector_dimension: 1024,
        vectorstore_timeout: Duration::from_secs(5),
        embedding_base_url: "http://localhost:11434".into(),
        embedding_api_key: "key".into(),
        embedding_model: "test-embed".into(),
        embedding_timeout: Duration::from_secs(30),
        embedding_batch_size: 50,
        embedding_workers: 3,
        embedding_max_attempts: 5,
        chunk_size: 30,
        chunk_overlap: 10,
        llm_base_url: "http://localhost:11434".into(),
        llm_api_key: "key".into(),
        llm_model: "test-chat".into(),
        llm_request_timeout: Duration::from_secs(30),
        max_prompt_length: 12_000,
        llm_context_length: 32_000,
        chat_context_chunks: 8,
        chat_vector_weight: 0.7,
        github_batch_size: 50,
        github_max_file_size: 1024 * 1024,
        github_file_timeout: Duration::from_secs(15),
        lease_ttl: Duration::from_secs(120),
        idle_poll_interval: Duration::from_secs(5),
        shutdown_grace: Duration::from_secs(30),
        auth_secret: "0123456789abcdef0123456789abcdef".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_config_passes() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn rejects_unsupported_dimension() {
        let mut cfg = test_config();
        cfg.vector_dimension = 1000;
        assert!(matches!(cfg.validate(), Err(AppError::ConfigInvalid(_))));
    }

    #[test]
    fn rejects_overlap_not_smaller_than_chunk_size() {
        let mut cfg = test_config();
        cfg.chunk_size = 30;
        cfg.chunk_overlap = 30;
        assert!(cfg.validate().is_err());

        cfg.chunk_size = 150;
        cfg.chunk_overlap = 50;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_vector_weight() {
        let mut cfg = test_config();
        cfg.chat_vector_weight = 1.5;
        assert!(cfg.validate().is_err());
    }
}
