//! HTTP interface of the evaluator.
//!
//! | Route                    | Method | Result                         |
//! |--------------------------|--------|--------------------------------|
//! | `/v1/evaluate`           | POST   | 202 with the evaluation id     |
//! | `/v1/evaluate/{id}`      | GET    | 200 with the evaluation record |
//! | `/health`                | GET    | `ok`                           |
//! | `/metrics`               | GET    | Prometheus text format         |

pub mod routes;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    routing::post,
    Json, Router,
};
use tracing::info;

use crate::metrics::metrics_handler;
use crate::pipeline::EvaluationOrchestrator;

/// State shared by every handler.
pub struct AppState {
    pub orchestrator: EvaluationOrchestrator,
}

pub type SharedState = Arc<AppState>;

/// Error response rendered as `{"error": message}`.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/v1/evaluate", post(routes::start_evaluation))
        .route("/v1/evaluate/{id}", get(routes::get_evaluation))
        .route("/health", get(routes::health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serves the API on `bind_addr` until Ctrl+C.
pub async fn serve(bind_addr: &str, state: SharedState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("HTTP server shut down");
    Ok(())
}

/// Resolves on Ctrl+C. Never resolves if the handler cannot be installed.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
