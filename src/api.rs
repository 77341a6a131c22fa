//! HTTP API endpoints.
//!
//! Read-only views over the coordinator and the stats task. Nothing here
//! mutates coordinator state.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;
use crate::ws;

/// Full application router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(healthz))
        .route("/api/session", get(session_snapshot))
        .route("/api/stats/current", get(current_stats))
        .route("/api/stats/{id}", get(stats_by_id))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /healthz
pub async fn healthz() -> &'static str {
    "ok"
}

/// Coordinator snapshot.
///
/// GET /api/session
pub async fn session_snapshot(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.snapshot().await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "Coordinator stopped").into_response(),
    }
}

/// Stats for the current session.
///
/// GET /api/stats/current
pub async fn current_stats(State(state): State<Arc<AppState>>) -> Response {
    match state.stats.current().await {
        Some(report) => Json(report).into_response(),
        None => (StatusCode::NOT_FOUND, "No session yet").into_response(),
    }
}

/// Stats for a session by id, current or archived.
///
/// GET /api/stats/{id}
pub async fn stats_by_id(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.stats.session(&id).await {
        Some(report) => Json(report).into_response(),
        None => (StatusCode::NOT_FOUND, format!("Unknown session {}", id)).into_response(),
    }
}
