//! Pipeline endpoints

use super::{ApiResponse, ApiResult};
use crate::middleware::auth::RequireAuth;
use axum::{
    extract::{Extension, Path},
    routing::{get, post},
    Json, Router,
};
use postpilot_core::{
    AppContext, Error, PipelineOutcome, PipelineState, PipelineStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Body of `POST /api/v1/pipelines`
#[derive(Debug, Deserialize)]
pub struct StartPipelineRequest {
    pub video_ref: String,
    /// Generated when absent
    #[serde(default)]
    pub task_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartPipelineResponse {
    pub task_id: String,
    pub user_id: String,
    pub state: PipelineState,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub task_id: String,
    pub cancelled: bool,
}

pub fn pipelines_routes() -> Router {
    Router::new()
        .route(
            "/api/v1/pipelines",
            post(start_pipeline).get(list_pipelines),
        )
        .route(
            "/api/v1/pipelines/:task_id",
            get(get_pipeline).delete(cancel_pipeline),
        )
        .route("/api/v1/pipelines/:task_id/outcome", get(get_outcome))
}

async fn start_pipeline(
    RequireAuth(caller): RequireAuth,
    Extension(ctx): Extension<Arc<AppContext>>,
    Json(request): Json<StartPipelineRequest>,
) -> ApiResult<StartPipelineResponse> {
    if request.video_ref.trim().is_empty() {
        return Err(Error::Validation("video_ref must not be empty".to_string()).into());
    }
    let task_id = request
        .task_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let task_id = ctx
        .pipeline
        .start_pipeline(&task_id, &caller.user_id, &request.video_ref)
        .await?;
    info!(task_id = %task_id, user_id = %caller.user_id, "Pipeline accepted");

    Ok(Json(ApiResponse::success(StartPipelineResponse {
        task_id,
        user_id: caller.user_id,
        state: PipelineState::Upload,
    })))
}

async fn list_pipelines(
    RequireAuth(_caller): RequireAuth,
    Extension(ctx): Extension<Arc<AppContext>>,
) -> ApiResult<Vec<PipelineStatus>> {
    Ok(Json(ApiResponse::success(ctx.pipeline.active_pipelines())))
}

async fn get_pipeline(
    RequireAuth(_caller): RequireAuth,
    Extension(ctx): Extension<Arc<AppContext>>,
    Path(task_id): Path<String>,
) -> ApiResult<PipelineStatus> {
    let status = ctx.pipeline.get_pipeline_status(&task_id)?;
    Ok(Json(ApiResponse::success(status)))
}

async fn get_outcome(
    RequireAuth(_caller): RequireAuth,
    Extension(ctx): Extension<Arc<AppContext>>,
    Path(task_id): Path<String>,
) -> ApiResult<PipelineOutcome> {
    let outcome = ctx.pipeline.get_pipeline_outcome(&task_id)?;
    Ok(Json(ApiResponse::success(outcome)))
}

async fn cancel_pipeline(
    RequireAuth(caller): RequireAuth,
    Extension(ctx): Extension<Arc<AppContext>>,
    Path(task_id): Path<String>,
) -> ApiResult<CancelResponse> {
    if !ctx.pipeline.cancel_pipeline(&task_id) {
        return Err(Error::NotFound(format!("pipeline {}", task_id)).into());
    }
    info!(task_id = %task_id, user_id = %caller.user_id, "Pipeline cancel requested");
    Ok(Json(ApiResponse::success(CancelResponse {
        task_id,
        cancelled: true,
    })))
}
