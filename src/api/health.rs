//! Health check endpoints.
//!
//! Provides:
//! - `/health`: status + version, for load balancers
//! - `/health/detailed`: the monitor's report (services, latest system
//!   sample) plus the shutdown phase

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use postpilot_core::{AppContext, HealthReport, HealthStatus};
use serde::Serialize;
use std::sync::Arc;

use crate::middleware::auth::RequireAuth;

/// Simple health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: &'static str,
}

/// Detailed health response
#[derive(Debug, Serialize)]
pub struct DetailedHealthResponse {
    pub status: HealthStatus,
    pub version: &'static str,
    pub accepting_work: bool,
    pub shutdown_phase: String,
    pub report: HealthReport,
}

/// Simple health check. Answers 503 while shutting down so load balancers
/// stop routing new pipelines here.
async fn health_check(
    Extension(ctx): Extension<Arc<AppContext>>,
) -> (StatusCode, Json<HealthResponse>) {
    let status = if ctx.shutdown.is_accepting_work() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: ctx.health.overall_status(),
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

async fn detailed_health_check(
    RequireAuth(_caller): RequireAuth,
    Extension(ctx): Extension<Arc<AppContext>>,
) -> Json<DetailedHealthResponse> {
    let report = ctx.health.get_health_status();
    Json(DetailedHealthResponse {
        status: report.overall_status,
        version: env!("CARGO_PKG_VERSION"),
        accepting_work: ctx.shutdown.is_accepting_work(),
        shutdown_phase: ctx.shutdown.phase().to_string(),
        report,
    })
}

/// Create health routes
pub fn health_routes() -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/detailed", get(detailed_health_check))
}
