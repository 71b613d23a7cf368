//! Vector store adapter (Qdrant REST API).
//!
//! Points are keyed by chunk id, carrying a payload that duplicates the
//! fields filtered queries need. Upserts are idempotent by id; re-running an
//! embed-then-upsert for the same chunk leaves the collection unchanged.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPayload {
    pub repository_id: Uuid,
    pub file_path: String,
    pub language: String,
    pub start_line: i32,
    pub end_line: i32,
}

#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: VectorPayload,
}

#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: Uuid,
    /// Cosine similarity clamped to [0, 1].
    pub score: f32,
    pub payload: Option<VectorPayload>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection if absent; fail fatally when it exists with a
    /// different dimension (silent mis-sized results are worse than a crash
    /// at startup).
    async fn ensure_collection(&self) -> AppResult<()>;
    async fn upsert_points(&self, points: &[VectorPoint]) -> AppResult<()>;
    async fn search(
        &self,
        vector: &[f32],
        repository_ids: &[Uuid],
        limit: usize,
    ) -> AppResult<Vec<ScoredPoint>>;
    async fn delete_by_repository(&self, repository_id: Uuid) -> AppResult<()>;
    /// Drop and re-create the collection (operational rebuild).
    async fn recreate_collection(&self) -> AppResult<()>;
}

// ---------------------------------------------------------------------------
// Qdrant REST implementation
// ---------------------------------------------------------------------------

pub struct QdrantStore {
    http: reqwest::Client,
    base_url: String,
    collection: String,
    dimension: usize,
}

#[derive(Debug, Deserialize)]
struct CollectionInfoResponse {
    result: CollectionInfo,
}

#[derive(Debug, Deserialize)]
struct CollectionInfo {
    config: CollectionConfig,
}

#[derive(Debug, Deserialize)]
struct CollectionConfig {
    params: CollectionParams,
}

#[derive(Debug, Deserialize)]
struct CollectionParams {
    vectors: VectorParams,
}

#[derive(Debug, Deserialize)]
struct VectorParams {
    size: usize,
    distance: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    result: Vec<SearchResultPoint>,
}

#[derive(Debug, Deserialize)]
struct SearchResultPoint {
    id: Uuid,
    score: f32,
    payload: Option<VectorPayload>,
}

impl QdrantStore {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = &config.vectorstore_api_key {
            let value = reqwest::header::HeaderValue::from_str(key)
                .map_err(|_| AppError::ConfigInvalid("VECTORSTORE_API_KEY unreadable".into()))?;
            headers.insert("api-key", value);
        }
        let http = reqwest::Client::builder()
            .timeout(config.vectorstore_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| AppError::ConfigInvalid(format!("vector store client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.vectorstore_url.trim_end_matches('/').to_string(),
            collection: config.vectorstore_collection.clone(),
            dimension: config.vector_dimension,
        })
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.base_url, self.collection)
    }

    async fn create_collection(&self) -> AppResult<()> {
        let body = json!({
            "vectors": { "size": self.dimension, "distance": "Cosine" }
        });
        let response = self
            .http
            .put(self.collection_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::from_transport("vector store", e))?;
        check_status("create collection", &response)?;
        Ok(())
    }
}

/// Map non-success Qdrant statuses onto the error taxonomy without leaking
/// response bodies.
fn check_status(context: &str, response: &reqwest::Response) -> AppResult<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    Err(match status.as_u16() {
        429 => AppError::RateLimited(format!("vector store: {context}")),
        500..=599 => AppError::UpstreamUnavailable(format!("vector store: {context} ({status})")),
        _ => AppError::Internal(format!("vector store: {context} returned {status}")),
    })
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self) -> AppResult<()> {
        let response = self
            .http
            .get(self.collection_url())
            .send()
            .await
            .map_err(|e| AppError::from_transport("vector store", e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::info!(
                collection = %self.collection,
                dimension = self.dimension,
                "creating vector collection"
            );
            return self.create_collection().await;
        }
        check_status("inspect collection", &response)?;

        let info: CollectionInfoResponse = response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("vector store: collection info: {e}")))?;

        let params = info.result.config.params.vectors;
        if params.size != self.dimension {
            return Err(AppError::ConfigInvalid(format!(
                "vector collection '{}' has dimension {}, configured {}; \
                 re-index before changing VECTOR_DIMENSION",
                self.collection, params.size, self.dimension
            )));
        }
        if !params.distance.eq_ignore_ascii_case("cosine") {
            return Err(AppError::ConfigInvalid(format!(
                "vector collection '{}' uses {} distance, expected Cosine",
                self.collection, params.distance
            )));
        }
        Ok(())
    }

    async fn upsert_points(&self, points: &[VectorPoint]) -> AppResult<()> {
        if points.is_empty() {
            return Ok(());
        }
        let body = json!({
            "points": points
                .iter()
                .map(|p| {
                    json!({
                        "id": p.id,
                        "vector": p.vector,
                        "payload": p.payload,
                    })
                })
                .collect::<Vec<_>>()
        });
        let response = self
            .http
            .put(format!("{}/points?wait=true", self.collection_url()))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::from_transport("vector store", e))?;
        check_status("upsert points", &response)
    }

    async fn search(
        &self,
        vector: &[f32],
        repository_ids: &[Uuid],
        limit: usize,
    ) -> AppResult<Vec<ScoredPoint>> {
        if repository_ids.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
            "filter": {
                "must": [{
                    "key": "repository_id",
                    "match": { "any": repository_ids }
                }]
            }
        });
        let response = self
            .http
            .post(format!("{}/points/search", self.collection_url()))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::from_transport("vector store", e))?;
        check_status("search", &response)?;

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("vector store: search response: {e}")))?;

        Ok(parsed
            .result
            .into_iter()
            .map(|p| ScoredPoint {
                id: p.id,
                score: p.score.clamp(0.0, 1.0),
                payload: p.payload,
            })
            .collect())
    }

    async fn delete_by_repository(&self, repository_id: Uuid) -> AppResult<()> {
        let body = json!({
            "filter": {
                "must": [{
                    "key": "repository_id",
                    "match": { "value": repository_id }
                }]
            }
        });
        let response = self
            .http
            .post(format!("{}/points/delete?wait=true", self.collection_url()))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::from_transport("vector store", e))?;
        check_status("delete points", &response)
    }

    async fn recreate_collection(&self) -> AppResult<()> {
        let response = self
            .http
            .delete(self.collection_url())
            .send()
            .await
            .map_err(|e| AppError::from_transport("vector store", e))?;
        if response.status() != reqwest::StatusCode::NOT_FOUND {
            check_status("drop collection", &response)?;
        }
        self.create_collection().await
    }
}
