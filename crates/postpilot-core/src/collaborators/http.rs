use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AnalyticsRecord, CaptionResult, ContentServices, PublishResult, VideoMetadata};
use crate::error::{Error, Result};
use crate::pipeline::PipelineContext;

/// HTTP collaborator configuration
#[derive(Debug, Clone)]
pub struct HttpServicesConfig {
    /// Backend base URL, e.g. `http://localhost:8000/`
    pub base_url: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Optional bearer token sent with every request
    pub api_token: Option<String>,
}

impl Default for HttpServicesConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/".to_string(),
            timeout: Duration::from_secs(30),
            api_token: None,
        }
    }
}

#[derive(Serialize)]
struct MetadataRequest<'a> {
    video_ref: &'a str,
}

#[derive(Serialize)]
struct AnalyticsRequest<'a> {
    post_id: &'a str,
}

#[derive(Deserialize)]
struct ScheduleResponse {
    scheduled_time: DateTime<Utc>,
}

/// Collaborators served by the content backend's `/api/v1/content/*` routes.
///
/// Timeouts, connection failures and 5xx responses map to
/// [`Error::TransientService`]; 400 and 422 to [`Error::Validation`];
/// other non-success statuses to [`Error::PermanentService`].
pub struct HttpContentServices {
    client: Client,
    base_url: Url,
    api_token: Option<String>,
}

impl HttpContentServices {
    /// Create a client for `config.base_url`
    pub fn new(config: HttpServicesConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| Error::Configuration(format!("invalid collaborator url {}: {}", base, e)))?;

        Ok(Self {
            client,
            base_url,
            api_token: config.api_token,
        })
    }

    async fn post<B: Serialize + ?Sized + Sync, T: DeserializeOwned>(
        &self,
        service: &str,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| Error::Configuration(format!("invalid path {}: {}", path, e)))?;

        let mut request = self.client.post(url).json(body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::from_http(service, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(service, status, &body));
        }

        debug!(service = %service, status = %status, "Collaborator call succeeded");
        response
            .json::<T>()
            .await
            .map_err(|e| Error::permanent(service, format!("invalid response body: {}", e)))
    }
}

fn classify_status(service: &str, status: StatusCode, body: &str) -> Error {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Error::transient(service, message)
    } else if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
        Error::Validation(format!("{}: {}", service, message))
    } else {
        Error::permanent(service, message)
    }
}

#[async_trait]
impl ContentServices for HttpContentServices {
    async fn validate_and_extract_metadata(&self, video_ref: &str) -> Result<VideoMetadata> {
        self.post(
            "media",
            "api/v1/content/metadata",
            &MetadataRequest { video_ref },
        )
        .await
    }

    async fn generate_caption(&self, context: &PipelineContext) -> Result<CaptionResult> {
        self.post("captions", "api/v1/content/caption", context)
            .await
    }

    async fn compute_optimal_time(&self, context: &PipelineContext) -> Result<DateTime<Utc>> {
        let response: ScheduleResponse = self
            .post("scheduler", "api/v1/content/schedule", context)
            .await?;
        Ok(response.scheduled_time)
    }

    async fn publish_to_platforms(&self, context: &PipelineContext) -> Result<PublishResult> {
        self.post("publisher", "api/v1/content/publish", context)
            .await
    }

    async fn collect_analytics(&self, post_id: &str) -> Result<AnalyticsRecord> {
        self.post(
            "analytics",
            "api/v1/content/analytics",
            &AnalyticsRequest { post_id },
        )
        .await
    }

    async fn store_analytics(&self, context: &PipelineContext) -> Result<()> {
        let _: serde_json::Value = self
            .post("analytics", "api/v1/content/learning", context)
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify_status("captions", StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(classify_status("captions", StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(matches!(
            classify_status("media", StatusCode::UNPROCESSABLE_ENTITY, "bad codec"),
            Error::Validation(_)
        ));
        assert!(matches!(
            classify_status("publisher", StatusCode::FORBIDDEN, ""),
            Error::PermanentService { .. }
        ));
    }

    #[test]
    fn test_base_url_normalized() {
        let services = HttpContentServices::new(HttpServicesConfig {
            base_url: "http://backend:8000/prefix".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            services
                .base_url
                .join("api/v1/content/caption")
                .unwrap()
                .as_str(),
            "http://backend:8000/prefix/api/v1/content/caption"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let result = HttpContentServices::new(HttpServicesConfig {
            base_url: "not a url".to_string(),
            ..Default::default()
        });
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
