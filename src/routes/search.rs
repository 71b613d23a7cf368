use axum::{Extension, Json, extract::State};
use serde::Deserialize;
use uuid::Uuid;

use crate::docstore::SearchFilter;
use crate::error::AppResult;
use crate::models::SearchItem;
use crate::search::{HybridResponse, LexicalResponse};
use crate::server::AuthUser;
use crate::state::AppState;

const DEFAULT_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct LexicalRequest {
    pub query: String,
    #[serde(default)]
    pub repository_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub file_extension: Option<String>,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct VectorRequest {
    pub query: String,
    #[serde(default)]
    pub repository_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct HybridRequest {
    pub query: String,
    #[serde(default)]
    pub repository_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub vector_weight: Option<f32>,
}

fn filter(owner: Uuid, repository_ids: Option<Vec<Uuid>>) -> SearchFilter {
    SearchFilter {
        owner_id: owner,
        repository_ids,
        ..Default::default()
    }
}

pub async fn lexical(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(req): Json<LexicalRequest>,
) -> AppResult<Json<LexicalResponse>> {
    let mut search_filter = filter(user, req.repository_ids);
    search_filter.language = req.language;
    search_filter.file_extension = req.file_extension;
    let limit = req.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = req.offset.unwrap_or(0).max(0);
    let response = state
        .search
        .lexical(&req.query, &search_filter, offset, limit)
        .await?;
    Ok(Json(response))
}

pub async fn vector(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(req): Json<VectorRequest>,
) -> AppResult<Json<Vec<SearchItem>>> {
    let search_filter = filter(user, req.repository_ids);
    let limit = req.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT) as usize;
    let items = state.search.vector(&req.query, &search_filter, limit).await?;
    Ok(Json(items))
}

pub async fn hybrid(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(req): Json<HybridRequest>,
) -> AppResult<Json<HybridResponse>> {
    let search_filter = filter(user, req.repository_ids);
    let k = req
        .k
        .unwrap_or(state.config.chat_context_chunks)
        .clamp(1, MAX_LIMIT as usize);
    let weight = req.vector_weight.unwrap_or(state.config.chat_vector_weight);
    let response = state
        .search
        .hybrid(&req.query, &search_filter, k, weight)
        .await?;
    Ok(Json(response))
}
