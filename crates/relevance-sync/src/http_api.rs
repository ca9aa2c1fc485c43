//! HTTP admin API
//!
//! REST endpoints for inspecting and managing relevance models.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use relevance_core::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::service::RelevanceSync;

/// Shared state for HTTP handlers
pub type AppState = Arc<RelevanceSync>;

/// Model names per tier
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelListResponse {
    pub runtime: Vec<String>,
    pub preloaded: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub loaded: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct PutModelParams {
    #[serde(default)]
    pub overwrite: bool,
}

/// Error body returned by every failing endpoint
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_invalid_input() {
            StatusCode::BAD_REQUEST
        } else if self.0.is_transport() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        if status != StatusCode::BAD_REQUEST {
            warn!(status = status.as_u16(), error = %self.0, "Admin request failed");
        }
        (status, Json(serde_json::json!({"error": self.0.to_string()}))).into_response()
    }
}

/// Create the admin API router
pub fn create_router(sync: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/models", get(list_models).delete(empty_models))
        .route("/models/reload", post(reload_models))
        .route(
            "/models/:name",
            get(get_model).put(put_model).delete(delete_model),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(sync)
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

async fn list_models(State(sync): State<AppState>) -> impl IntoResponse {
    Json(ModelListResponse {
        runtime: sync.cache().runtime().names(),
        preloaded: sync.cache().preloaded().names(),
    })
}

/// Definition of the effective model
async fn get_model(State(sync): State<AppState>, Path(name): Path<String>) -> Response {
    match sync.storage().get_model(&name) {
        Some(factory) => Json(factory.definition().clone()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("model {} not found", name)})),
        )
            .into_response(),
    }
}

async fn put_model(
    State(sync): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<PutModelParams>,
    Json(definition): Json<Value>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let success = sync
        .storage()
        .add_model(&name, &definition.to_string(), params.overwrite)
        .await?;
    Ok(Json(SuccessResponse { success }))
}

async fn delete_model(
    State(sync): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let success = sync.storage().del_model(&name).await?;
    Ok(Json(SuccessResponse { success }))
}

async fn empty_models(State(sync): State<AppState>) -> Result<Json<SuccessResponse>, ApiError> {
    let success = sync.storage().empty_all_models().await?;
    Ok(Json(SuccessResponse { success }))
}

async fn reload_models(State(sync): State<AppState>) -> Result<Json<ReloadResponse>, ApiError> {
    let models = sync.storage().load_all_models().await?;
    Ok(Json(ReloadResponse {
        loaded: models.len(),
    }))
}
