//! HTTP API.
//!
//! Endpoints:
//! - `POST /query` — run the full query pipeline
//! - `GET /config` — current live RAG configuration
//! - `PUT /config` — validate and atomically replace the configuration
//! - `POST /config/reset` — restore documented defaults
//! - `GET /dlq` — dead-lettered ingestion jobs
//! - `GET /health` — liveness check
//!
//! Errors use a uniform `{"error": {"code", "message"}}` body. Rejected
//! configuration updates and malformed query requests are client errors
//! (400); everything else that fails is a 500 with the cause logged, not
//! leaked.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::config_store::{ConfigError, ConfigStore, RagConfig};
use crate::ingest::list_dead_letters;
use crate::models::{DeadLetter, QueryRequest, QueryResponse};
use crate::pipeline::QueryPipeline;

pub struct AppState {
    pub pool: SqlitePool,
    pub config_store: Arc<ConfigStore>,
    pub pipeline: QueryPipeline,
}

enum AppError {
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl ErrorBody {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody::new("bad_request", message)),
            )
                .into_response(),
            AppError::Internal(err) => {
                error!(error = %err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody::new("internal", "internal server error")),
                )
                    .into_response()
            }
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/query", post(handle_query))
        .route("/config", get(handle_config_get).put(handle_config_put))
        .route("/config/reset", post(handle_config_reset))
        .route("/dlq", get(handle_dlq))
        .route("/health", get(handle_health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: Arc<AppState>, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind, "server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn handle_query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    if request.query.trim().is_empty() {
        return Err(AppError::BadRequest("query must not be empty".to_string()));
    }
    if let Some(top_k) = request.top_k {
        if top_k < 1 {
            return Err(AppError::BadRequest("top_k must be at least 1".to_string()));
        }
    }

    let response = state.pipeline.answer(&request).await?;
    Ok(Json(response))
}

async fn handle_config_get(State(state): State<Arc<AppState>>) -> Json<RagConfig> {
    Json((*state.config_store.get()).clone())
}

async fn handle_config_put(
    State(state): State<Arc<AppState>>,
    Json(new_config): Json<RagConfig>,
) -> Result<Json<RagConfig>, AppError> {
    let applied = state.config_store.update(new_config)?;
    Ok(Json((*applied).clone()))
}

async fn handle_config_reset(State(state): State<Arc<AppState>>) -> Json<RagConfig> {
    Json((*state.config_store.reset()).clone())
}

async fn handle_dlq(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DeadLetter>>, AppError> {
    let letters = list_dead_letters(&state.pool).await?;
    Ok(Json(letters))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
