//! External content services the pipeline delegates stage work to.
//!
//! The pipeline only knows the [`ContentServices`] trait. Two
//! implementations ship with the crate: [`HttpContentServices`] calls a
//! backend over HTTP, [`SimulatedContentServices`] returns canned results
//! for local development.

mod http;
mod simulated;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::pipeline::PipelineContext;

pub use http::{HttpContentServices, HttpServicesConfig};
pub use simulated::SimulatedContentServices;

/// Metadata extracted from an uploaded video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    /// Length in seconds
    pub duration: f64,
    /// Container format
    pub format: String,
    /// Size in bytes
    pub size: u64,
    /// Anything else the extractor reported
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Generated caption and hashtags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptionResult {
    /// Caption text
    pub caption: String,
    /// Hashtags, including the leading `#`
    pub hashtags: Vec<String>,
}

/// Result of publishing to the platforms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    /// Platform post id
    pub post_id: String,
    /// Platforms the content was published to
    pub platforms: Vec<String>,
}

/// Engagement numbers for a published post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsRecord {
    /// View count
    pub views: u64,
    /// Like count
    pub likes: u64,
    /// Comment count
    pub comments: u64,
    /// Platform-specific extras
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Stage work performed outside the orchestration core.
///
/// Implementations classify their own failures: [`Error::TransientService`]
/// is retried by the pipeline, [`Error::Validation`] and
/// [`Error::PermanentService`] fail it immediately.
///
/// [`Error::TransientService`]: crate::Error::TransientService
/// [`Error::Validation`]: crate::Error::Validation
/// [`Error::PermanentService`]: crate::Error::PermanentService
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentServices: Send + Sync {
    /// Validate the media reference and extract its metadata.
    async fn validate_and_extract_metadata(&self, video_ref: &str) -> Result<VideoMetadata>;

    /// Generate caption text and hashtags.
    async fn generate_caption(&self, context: &PipelineContext) -> Result<CaptionResult>;

    /// Pick the publish time.
    async fn compute_optimal_time(&self, context: &PipelineContext) -> Result<DateTime<Utc>>;

    /// Publish the content.
    async fn publish_to_platforms(&self, context: &PipelineContext) -> Result<PublishResult>;

    /// Fetch engagement numbers for a post.
    async fn collect_analytics(&self, post_id: &str) -> Result<AnalyticsRecord>;

    /// Hand analytics to the learning store. No-op unless overridden.
    async fn store_analytics(&self, _context: &PipelineContext) -> Result<()> {
        Ok(())
    }

    /// Implementation name for logs
    fn name(&self) -> &'static str;
}
