//! HTTP request handlers.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};

use super::{ApiResponse, AppState};
use crate::error::Result;
use crate::messenger::{MessengerStats, RequestEnvelope, Response};

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

pub async fn stats(State(state): State<AppState>) -> Json<ApiResponse<MessengerStats>> {
    Json(ApiResponse::success(state.messenger.stats()))
}

/// Run one request through the messenger without a persistent connection.
pub async fn submit_request(
    State(state): State<AppState>,
    Json(envelope): Json<RequestEnvelope>,
) -> Result<Json<Response>> {
    let response = state.messenger.handle_once(envelope).await?;
    Ok(Json(response))
}

/// Prometheus metrics endpoint.
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "metrics recorder not installed\n".to_string(),
        ),
    }
}
