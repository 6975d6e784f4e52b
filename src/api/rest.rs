// =============================================================================
// REST Control Surface — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health requires no authentication;
// everything else requires the admin token checked by the `AdminToken`
// extractor. CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AdminToken;
use crate::app_state::AppState;

// =============================================================================
// Router construction
// =============================================================================

/// Build the control API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/debug", get(debug_snapshot))
        .route("/api/v1/control/start", post(control_start))
        .route("/api/v1/control/stop", post(control_stop))
        .route("/api/v1/threshold", post(set_threshold))
        .route("/api/v1/aggregation/toggle", post(toggle_aggregation))
        .route("/api/v1/test", post(inject_test))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    running: bool,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        running: state.running.load(std::sync::atomic::Ordering::Relaxed),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Debug snapshot (authenticated)
// =============================================================================

async fn debug_snapshot(
    _auth: AdminToken,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.debug_snapshot())
}

// =============================================================================
// Start / stop (authenticated)
// =============================================================================

#[derive(Serialize)]
struct ControlResponse {
    running: bool,
    changed: bool,
}

async fn control_start(
    _auth: AdminToken,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let changed = state.start();
    Json(ControlResponse {
        running: true,
        changed,
    })
}

async fn control_stop(
    _auth: AdminToken,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let changed = state.stop();
    Json(ControlResponse {
        running: false,
        changed,
    })
}

// =============================================================================
// Threshold (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct ThresholdRequest {
    value: f64,
}

async fn set_threshold(
    _auth: AdminToken,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ThresholdRequest>,
) -> impl IntoResponse {
    match state.config.update(|c| c.value_require = req.value) {
        Ok(()) => {
            info!(threshold = req.value, "threshold set via control API");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "threshold": req.value })),
            )
        }
        Err(e) => {
            warn!(value = req.value, error = %e, "threshold update rejected");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({ "error": format!("{e:#}") })),
            )
        }
    }
}

// =============================================================================
// Aggregation toggle (authenticated)
// =============================================================================

async fn toggle_aggregation(
    _auth: AdminToken,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let result = state
        .config
        .update(|c| c.trade_aggregation.enabled = !c.trade_aggregation.enabled);

    match result {
        Ok(()) => {
            let enabled = state.config.snapshot().trade_aggregation.enabled;
            info!(enabled, "aggregation toggled via control API");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "aggregation_enabled": enabled })),
            )
        }
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": format!("{e:#}") })),
        ),
    }
}

// =============================================================================
// Synthetic test trade (authenticated)
// =============================================================================

async fn inject_test(
    _auth: AdminToken,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    if state.inject_test_trade().await {
        (StatusCode::OK, Json(serde_json::json!({ "injected": true })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "injected": false })),
        )
    }
}
