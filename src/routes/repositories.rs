use axum::{
    Extension, Json,
    extract::{Path, State},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::Repository;
use crate::server::AuthUser;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateRepositoryRequest {
    pub name: Option<String>,
    pub gh_owner: String,
    pub gh_name: String,
    #[serde(default)]
    pub default_branch: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> AppResult<Json<Vec<Repository>>> {
    Ok(Json(state.store.list_repositories_by_owner(user).await?))
}

/// Create the repository record and kick off its first import.
pub async fn create(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(req): Json<CreateRepositoryRequest>,
) -> AppResult<Json<Repository>> {
    let mut repo = Repository::new(
        user,
        req.name
            .unwrap_or_else(|| format!("{}/{}", req.gh_owner, req.gh_name)),
        req.gh_owner,
        req.gh_name,
    );
    if let Some(branch) = req.default_branch {
        repo.default_branch = branch;
    }
    state.store.insert_repository(&repo).await?;
    state.importer.start_import(repo.id, user).await?;
    state.store.get_repository(repo.id).await.map(Json)
}

pub async fn get(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Repository>> {
    Ok(Json(state.store.get_repository_for_owner(id, user).await?))
}

/// Re-index: allowed from ready/error (and pending); rejected while a run is
/// active.
pub async fn reimport(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    state.importer.start_import(id, user).await?;
    Ok(Json(serde_json::json!({
        "status": "import_started",
        "repository_id": id,
    })))
}

/// Delete a repository with its chunks, sessions and vector points.
pub async fn remove(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    state.store.get_repository_for_owner(id, user).await?;
    // Exclude in-flight pipeline upserts for this repository while its
    // points and rows go away.
    let lock = state.repo_locks.lock_for(id);
    let _guard = lock.lock().await;
    state.vectors.delete_by_repository(id).await?;
    state.store.delete_repository(id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

pub async fn stats(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    let repo = state.store.get_repository_for_owner(id, user).await?;
    let progress = state.store.embedding_progress(id).await?;
    Ok(Json(serde_json::json!({
        "repository_id": repo.id,
        "status": repo.status,
        "import_progress": repo.import_progress,
        "file_count": repo.file_count,
        "line_count": repo.line_count,
        "languages": repo.languages,
        "chunks": progress.total,
        "chunks_embedded": progress.completed,
    })))
}

pub async fn embedding_progress(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    state.store.get_repository_for_owner(id, user).await?;
    let progress = state.store.embedding_progress(id).await?;
    let failures: Vec<serde_json::Value> = state
        .store
        .find_chunks_by_status(Some(id), crate::models::EmbeddingStatus::Failed, 10)
        .await?
        .into_iter()
        .map(|c| {
            serde_json::json!({
                "chunk_id": c.id,
                "file_path": c.file_path,
                "reason": c.failure_reason,
                "attempts": c.attempts,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({
        "repository_id": progress.repository_id,
        "total": progress.total,
        "pending": progress.pending,
        "processing": progress.processing,
        "completed": progress.completed,
        "failed": progress.failed,
        "percent": progress.percent(),
        "status": progress.derived_status(),
        "failures": failures,
    })))
}

/// Re-queue failed chunks and wake the pipeline.
pub async fn retry_failed(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    state.store.get_repository_for_owner(id, user).await?;
    let requeued = state.store.retry_failed_chunks(id).await?;
    if requeued > 0 {
        state.pipeline_wake.notify_one();
    }
    Ok(Json(serde_json::json!({ "requeued": requeued })))
}
