//! Server initialization and main run loop

use super::config::AppConfig;
use crate::middleware::auth::AuthSettings;
use anyhow::{Context, Result};
use axum::{routing::get, Extension, Router};
use postpilot_core::shutdown::wait_for_shutdown_signal;
use postpilot_core::AppContext;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// Build the HTTP router around a running context
pub fn build_router(ctx: Arc<AppContext>, auth: AuthSettings) -> Router {
    Router::new()
        .merge(crate::api::health_routes())
        .merge(crate::api::api_router())
        .merge(crate::websocket::websocket_router())
        .route("/", get(|| async { "Postpilot" }))
        .layer(Extension(ctx))
        .layer(Extension(Arc::new(auth)))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Run the server until SIGINT/SIGTERM, then drain pipelines and stop.
pub async fn run(config: AppConfig) -> Result<()> {
    info!(
        "Starting Postpilot orchestrator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let services = config.content_services()?;
    info!(collaborators = services.name(), "Collaborators configured");

    let ctx = Arc::new(
        AppContext::new(config.context_config(), services)
            .context("Failed to build orchestrator")?,
    );
    ctx.start().await.context("Failed to start orchestrator")?;

    if !config.server.api_token.is_empty() {
        info!("API token authentication enabled");
    }
    let app = build_router(
        Arc::clone(&ctx),
        AuthSettings::new(config.server.api_token.clone()),
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("HTTP server listening on http://{}", addr);

    // Draining inside the shutdown future lets open WebSocket pumps end
    // before axum waits on them.
    let shutdown_ctx = Arc::clone(&ctx);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown_signal().await;
            shutdown_ctx.shutdown().await;
        })
        .await
        .context("HTTP server error")?;

    info!("Postpilot shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use postpilot_core::{AppContextConfig, SimulatedContentServices};
    use std::time::Duration;
    use tower::ServiceExt;

    fn context() -> Arc<AppContext> {
        let services = Arc::new(SimulatedContentServices::new().with_schedule_delay(Duration::ZERO));
        Arc::new(AppContext::new(AppContextConfig::default(), services).unwrap())
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_pipeline(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/pipelines")
            .header("content-type", "application/json")
            .header("x-user-id", "alice")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = build_router(context(), AuthSettings::default());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_start_pipeline_and_metrics() {
        let ctx = context();
        let app = build_router(Arc::clone(&ctx), AuthSettings::default());

        let response = app
            .clone()
            .oneshot(post_pipeline(r#"{"video_ref": "clip.mp4", "task_id": "api-1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["task_id"], "api-1");
        assert_eq!(body["data"]["user_id"], "alice");

        let duplicate = app
            .clone()
            .oneshot(post_pipeline(r#"{"video_ref": "clip.mp4", "task_id": "api-1"}"#))
            .await
            .unwrap();
        // background loops are not started, so the first run is still active
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);

        let metrics = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(metrics.status(), StatusCode::OK);
        let metrics = body_json(metrics).await;
        assert_eq!(metrics["data"]["pipeline"]["total_started"], 1);
        assert_eq!(metrics["data"]["pipeline"]["active_pipelines"], 1);
    }

    #[tokio::test]
    async fn test_empty_video_ref_is_bad_request() {
        let app = build_router(context(), AuthSettings::default());
        let response = app
            .oneshot(post_pipeline(r#"{"video_ref": "  "}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["success"], false);
    }

    #[tokio::test]
    async fn test_unknown_pipeline_is_not_found() {
        let app = build_router(context(), AuthSettings::default());
        for uri in ["/api/v1/pipelines/missing", "/api/v1/pipelines/missing/outcome"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }

        let cancel = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/v1/pipelines/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(cancel.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_token_required_when_configured() {
        let app = build_router(context(), AuthSettings::new("secret"));

        let rejected = app
            .clone()
            .oneshot(post_pipeline(r#"{"video_ref": "clip.mp4"}"#))
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);

        let public = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(public.status(), StatusCode::OK);

        let mut request = post_pipeline(r#"{"video_ref": "clip.mp4"}"#);
        request
            .headers_mut()
            .insert("authorization", "Bearer secret".parse().unwrap());
        let accepted = app.oneshot(request).await.unwrap();
        assert_eq!(accepted.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rejects_work_after_shutdown() {
        let ctx = context();
        ctx.start().await.unwrap();
        ctx.shutdown().await;
        let app = build_router(ctx, AuthSettings::default());

        let health = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app
            .oneshot(post_pipeline(r#"{"video_ref": "clip.mp4"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
