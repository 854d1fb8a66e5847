use axum::{
    Json, Router,
    response::IntoResponse,
    routing::{get, post},
};

use crate::AppState;

mod webhook;

pub fn build_router() -> Router<AppState> {
    Router::new().route("/health", get(health)).route("/webhook", post(webhook::webhook))
}

/// Liveness only; dependencies are not checked.
async fn health() -> impl IntoResponse { Json(serde_json::json!({ "status": "healthy" })) }
