// =============================================================================
// REST status API — Axum 0.7
// =============================================================================
//
// Read-only operational surface: health tree, engine stats, alert state. The
// WebSocket endpoint is mounted on the same router. CORS is permissive for
// development; tighten the origins in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::state::CollectorState;

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<CollectorState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/alerts", get(alerts))
        .route("/api/v1/alerts/resolve", post(resolve_alert))
        .route("/ws", get(crate::ws::server::ws_handler))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<Arc<CollectorState>>) -> impl IntoResponse {
    Json(state.health())
}

async fn stats(State(state): State<Arc<CollectorState>>) -> impl IntoResponse {
    let snapshot = state.engine.snapshot();
    Json(json!({
        "engine": snapshot,
        "pool": state.pool.stats(),
        "cache_entries": state.cache.len(),
        "uptime_ms": state.uptime_ms(),
    }))
}

async fn alerts(State(state): State<Arc<CollectorState>>) -> impl IntoResponse {
    Json(json!({
        "performance_score": state.monitor.current_score(),
        "active": state.monitor.active_alerts(),
        "history": state.monitor.alert_history(),
    }))
}

#[derive(Deserialize)]
struct ResolveRequest {
    rule_id: String,
}

async fn resolve_alert(
    State(state): State<Arc<CollectorState>>,
    Json(request): Json<ResolveRequest>,
) -> impl IntoResponse {
    let resolved = state.monitor.resolve_alert(&request.rule_id);
    info!(rule = %request.rule_id, resolved, "manual alert resolve");
    Json(json!({"resolved": resolved}))
}
