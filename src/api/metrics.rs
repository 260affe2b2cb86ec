//! Orchestrator metrics endpoint

use super::{ApiResponse, ApiResult};
use crate::middleware::auth::RequireAuth;
use axum::{extract::Extension, routing::get, Json, Router};
use postpilot_core::{AppContext, SystemMetricsSnapshot};
use std::sync::Arc;

pub fn metrics_routes() -> Router {
    Router::new().route("/api/v1/metrics", get(get_metrics))
}

async fn get_metrics(
    RequireAuth(_caller): RequireAuth,
    Extension(ctx): Extension<Arc<AppContext>>,
) -> ApiResult<SystemMetricsSnapshot> {
    Ok(Json(ApiResponse::success(ctx.get_metrics())))
}
