use axum::{
    Extension, Json,
    extract::{Path, State},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{ChatMessage, ChatSession};
use crate::server::AuthUser;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub repository_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub content: String,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> AppResult<Json<Vec<ChatSession>>> {
    Ok(Json(state.store.list_sessions_by_owner(user).await?))
}

pub async fn create_session(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(req): Json<CreateSessionRequest>,
) -> AppResult<Json<ChatSession>> {
    let session = state.rag.create_session(user, req.repository_id).await?;
    Ok(Json(session))
}

pub async fn get_session(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ChatSession>> {
    Ok(Json(state.store.get_session_for_owner(id, user).await?))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    state.store.delete_session(id, user).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

/// Ask a question in a session; returns the grounded assistant message.
pub async fn ask(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<AskRequest>,
) -> AppResult<Json<ChatMessage>> {
    let assistant = state.rag.answer(id, user, &req.content).await?;
    Ok(Json(assistant))
}
