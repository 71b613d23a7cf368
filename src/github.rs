//! Source-forge client (GitHub REST v3).
//!
//! The importer consumes three operations: resolve the head commit of a
//! branch, list the full blob tree at that commit, and fetch one file's
//! bytes. Rate limits surface as retriable errors with the provider's
//! suggested delay when it sends one.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub path: String,
    pub size: u64,
    pub sha: String,
}

#[async_trait]
pub trait SourceForge: Send + Sync {
    async fn branch_head(&self, token: &str, full_name: &str, branch: &str) -> AppResult<String>;
    /// All blobs reachable from `commit_sha`, sorted by path so import order
    /// is deterministic.
    async fn list_tree(
        &self,
        token: &str,
        full_name: &str,
        commit_sha: &str,
    ) -> AppResult<Vec<TreeEntry>>;
    async fn fetch_file(
        &self,
        token: &str,
        full_name: &str,
        path: &str,
        reference: &str,
    ) -> AppResult<Vec<u8>>;
}

pub struct GithubClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct BranchResponse {
    commit: BranchCommit,
}

#[derive(Debug, Deserialize)]
struct BranchCommit {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<RawTreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct RawTreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: u64,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: String,
}

impl GithubClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        Self::with_base_url("https://api.github.com", config.github_file_timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> AppResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/vnd.github+json"),
        );
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("repodex-backend/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .map_err(|e| AppError::ConfigInvalid(format!("github client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        url: &str,
    ) -> AppResult<T> {
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AppError::from_transport("source forge", e))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| AppError::Internal(format!("source forge response: {e}")));
        }

        Err(match status.as_u16() {
            401 => AppError::AuthMissing("source-forge credential rejected".into()),
            403 | 429 if is_rate_limited(&response) => {
                AppError::RateLimited("source forge".into())
            }
            403 => AppError::Forbidden("source forge denied access".into()),
            404 => AppError::NotFound(format!("source forge path: {url}")),
            500..=599 => AppError::UpstreamUnavailable(format!("source forge ({status})")),
            _ => AppError::Internal(format!("source forge returned {status}")),
        })
    }
}

/// GitHub signals primary rate limiting with 403/429 plus either an
/// exhausted X-RateLimit-Remaining or a Retry-After header.
fn is_rate_limited(response: &reqwest::Response) -> bool {
    if response.headers().contains_key("retry-after") {
        return true;
    }
    response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "0")
        .unwrap_or(false)
}

#[async_trait]
impl SourceForge for GithubClient {
    async fn branch_head(&self, token: &str, full_name: &str, branch: &str) -> AppResult<String> {
        let url = format!("{}/repos/{full_name}/branches/{branch}", self.base_url);
        let parsed: BranchResponse = self.get_json(token, &url).await?;
        Ok(parsed.commit.sha)
    }

    async fn list_tree(
        &self,
        token: &str,
        full_name: &str,
        commit_sha: &str,
    ) -> AppResult<Vec<TreeEntry>> {
        let url = format!(
            "{}/repos/{full_name}/git/trees/{commit_sha}?recursive=1",
            self.base_url
        );
        let parsed: TreeResponse = self.get_json(token, &url).await?;
        if parsed.truncated {
            tracing::warn!(
                repo = full_name,
                "source forge truncated the tree listing; import covers the returned subset"
            );
        }
        let mut entries: Vec<TreeEntry> = parsed
            .tree
            .into_iter()
            .filter(|e| e.kind == "blob")
            .map(|e| TreeEntry {
                path: e.path,
                size: e.size,
                sha: e.sha,
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn fetch_file(
        &self,
        token: &str,
        full_name: &str,
        path: &str,
        reference: &str,
    ) -> AppResult<Vec<u8>> {
        let url = format!(
            "{}/repos/{full_name}/contents/{path}?ref={reference}",
            self.base_url
        );
        let parsed: ContentsResponse = self.get_json(token, &url).await?;
        if parsed.encoding != "base64" {
            return Err(AppError::Internal(format!(
                "source forge returned '{}' encoding for {path}",
                parsed.encoding
            )));
        }
        let cleaned: String = parsed
            .content
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        BASE64
            .decode(cleaned)
            .map_err(|e| AppError::Internal(format!("source forge blob for {path}: {e}")))
    }
}
