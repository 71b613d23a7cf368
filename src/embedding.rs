//! Embedding client for an OpenAI-compatible `/v1/embeddings` endpoint.
//!
//! Caller input is split into provider batches, sanitized, and embedded with
//! bounded concurrency. Transient failures (transport, 408/429/5xx) retry
//! with exponential backoff and jitter; a mismatched vector count fails the
//! whole batch as an invariant violation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::config::{AppConfig, EMBEDDING_MAX_INPUT_CHARS};
use crate::error::{AppError, AppResult};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed `texts` into vectors of `dimension()` length, in input order.
    async fn embed(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>>;
    fn dimension(&self) -> usize;
}

pub struct HttpEmbeddingClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
    batch_size: usize,
    max_attempts: u32,
    /// Caps in-flight provider calls at the worker count; extra callers block.
    permits: Arc<Semaphore>,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbeddingClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.embedding_timeout)
            .build()
            .map_err(|e| AppError::ConfigInvalid(format!("embedding client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.embedding_base_url.trim_end_matches('/').to_string(),
            api_key: config.embedding_api_key.clone(),
            model: config.embedding_model.clone(),
            dimension: config.vector_dimension,
            batch_size: config.embedding_batch_size,
            max_attempts: config.embedding_max_attempts,
            permits: Arc::new(Semaphore::new(config.embedding_workers)),
        })
    }

    async fn embed_batch(&self, batch: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.call_once(&url, batch).await;
            match result {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_retriable() && attempt < self.max_attempts => {
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "embedding batch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_once(&self, url: &str, batch: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingsRequest {
                model: &self.model,
                input: batch,
            })
            .send()
            .await
            .map_err(|e| AppError::from_transport("embedding provider", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                429 => AppError::RateLimited("embedding provider".into()),
                408 | 500..=599 => {
                    AppError::UpstreamUnavailable(format!("embedding provider ({status})"))
                }
                _ => AppError::Internal(format!("embedding provider returned {status}")),
            });
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("embedding response: {e}")))?;

        if parsed.data.len() != batch.len() {
            return Err(AppError::Internal(format!(
                "embedding provider returned {} vectors for {} inputs",
                parsed.data.len(),
                batch.len()
            )));
        }

        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);
        for datum in &data {
            if datum.embedding.len() != self.dimension {
                return Err(AppError::Internal(format!(
                    "embedding provider returned dimension {}, expected {}",
                    datum.embedding.len(),
                    self.dimension
                )));
            }
        }
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let sanitized: Vec<String> = texts.iter().map(|t| sanitize_input(t)).collect();

        let mut vectors = Vec::with_capacity(sanitized.len());
        for batch in sanitized.chunks(self.batch_size) {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| AppError::Internal("embedding semaphore closed".into()))?;
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Exponential backoff with uniform jitter: base 250ms doubling per attempt,
/// capped at 8s.
pub fn backoff_delay(attempt: u32) -> Duration {
    use rand::Rng;
    let base_ms = 250u64.saturating_mul(1u64 << attempt.min(5));
    let jitter = rand::thread_rng().gen_range(0..=base_ms / 2);
    Duration::from_millis((base_ms + jitter).min(8_000))
}

/// Providers reject empty input and cap input length; truncate on a line
/// boundary where possible.
fn sanitize_input(text: &str) -> String {
    let text = if text.trim().is_empty() { " " } else { text };
    if text.len() <= EMBEDDING_MAX_INPUT_CHARS {
        return text.to_string();
    }
    let mut cut = 0usize;
    for (idx, _) in text.match_indices('\n') {
        if idx > EMBEDDING_MAX_INPUT_CHARS {
            break;
        }
        cut = idx;
    }
    if cut == 0 {
        // Single very long line: fall back to a char-boundary cut.
        let mut end = EMBEDDING_MAX_INPUT_CHARS;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        return text[..end].to_string();
    }
    text[..cut].to_string()
}
