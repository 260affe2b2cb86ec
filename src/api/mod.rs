//! REST API for Postpilot
//!
//! Provides endpoints for:
//! - Starting, inspecting and cancelling pipelines
//! - Aggregated orchestrator metrics
//! - Health checks

pub mod health;
pub mod metrics;
pub mod pipelines;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use postpilot_core::Error;
use serde::Serialize;
use tracing::error;

pub use health::health_routes;
pub use metrics::metrics_routes;
pub use pipelines::pipelines_routes;

/// Create the `/api/v1` router
pub fn api_router() -> Router {
    Router::new()
        .merge(pipelines_routes())
        .merge(metrics_routes())
}

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
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

/// Core error rendered as an `ApiResponse`
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::DuplicatePipeline(_) => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::ResourceExhaustion(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!(kind = self.0.kind(), "API request failed: {}", self.0);
        }
        (status, Json(ApiResponse::<()>::error(self.0.to_string()))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, ApiError>;
