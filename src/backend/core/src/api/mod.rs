//! HTTP and WebSocket surface.
//!
//! | Route | Purpose |
//! |---|---|
//! | `GET /ws?live=<bool>` | WebSocket transport, one connection per socket |
//! | `GET /health` | Liveness probe |
//! | `GET /metrics` | Prometheus exposition |
//! | `GET /api/v1/stats` | Messenger statistics |
//! | `POST /api/v1/requests` | One-shot request through the messenger |

mod handlers;
mod websocket;

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::messenger::Messenger;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub messenger: Arc<Messenger>,
    /// `None` when no Prometheus recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(messenger: Arc<Messenger>) -> Self {
        Self {
            messenger,
            metrics: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Build the router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let v1 = Router::new()
        .route("/stats", get(handlers::stats))
        .route("/requests", post(handlers::submit_request));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/ws", get(websocket::ws_handler))
        .nest("/api/v1", v1)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

/// API response wrapper.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}
