use axum::{
    Router,
    extract::{Request, State},
    middleware::Next,
    response::Response,
    routing::{delete, get, post},
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::error::AppError;
use crate::routes;
use crate::state::AppState;

/// The authenticated caller, resolved by the auth middleware and read by
/// handlers via request extensions.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Uuid);

pub fn create_app(state: AppState) -> Router {
    // Health stays public for probes.
    let public_routes = Router::new().route("/health", get(routes::health::health_check));

    let protected_routes = Router::new()
        // Repositories & import
        .route("/api/repositories", get(routes::repositories::list))
        .route("/api/repositories", post(routes::repositories::create))
        .route("/api/repositories/{id}", get(routes::repositories::get))
        .route(
            "/api/repositories/{id}",
            delete(routes::repositories::remove),
        )
        .route(
            "/api/repositories/{id}/import",
            post(routes::repositories::reimport),
        )
        .route(
            "/api/repositories/{id}/stats",
            get(routes::repositories::stats),
        )
        .route(
            "/api/repositories/{id}/embedding",
            get(routes::repositories::embedding_progress),
        )
        .route(
            "/api/repositories/{id}/embedding/retry",
            post(routes::repositories::retry_failed),
        )
        // Search
        .route("/api/search/lexical", post(routes::search::lexical))
        .route("/api/search/vector", post(routes::search::vector))
        .route("/api/search/hybrid", post(routes::search::hybrid))
        // Chat
        .route("/api/sessions", get(routes::chat::list_sessions))
        .route("/api/sessions", post(routes::chat::create_session))
        .route("/api/sessions/{id}", get(routes::chat::get_session))
        .route("/api/sessions/{id}", delete(routes::chat::delete_session))
        .route("/api/sessions/{id}/messages", post(routes::chat::ask))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    public_routes
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Resolve `Authorization: Bearer <token>` through the identity adapter and
/// stash the user id in request extensions.
async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::AuthMissing("missing Authorization header".into()))?;

    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .ok_or_else(|| AppError::AuthMissing("malformed Authorization header".into()))?;

    let user_id = state.identity.resolve_user(token).await?;
    req.extensions_mut().insert(AuthUser(user_id));
    Ok(next.run(req).await)
}
