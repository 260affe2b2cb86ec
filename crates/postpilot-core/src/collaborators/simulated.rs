use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Map;
use tracing::debug;

use super::{AnalyticsRecord, CaptionResult, ContentServices, PublishResult, VideoMetadata};
use crate::error::{Error, Result};
use crate::pipeline::PipelineContext;

/// Canned responses for running the pipeline without a backend.
///
/// Every call succeeds except metadata extraction for an empty reference.
/// Posts are scheduled `schedule_delay` after the call.
#[derive(Debug, Clone)]
pub struct SimulatedContentServices {
    schedule_delay: Duration,
}

impl SimulatedContentServices {
    /// Schedule posts five minutes out
    #[must_use]
    pub fn new() -> Self {
        Self {
            schedule_delay: Duration::from_secs(300),
        }
    }

    /// Override how far in the future posts are scheduled
    #[must_use]
    pub fn with_schedule_delay(mut self, delay: Duration) -> Self {
        self.schedule_delay = delay;
        self
    }
}

impl Default for SimulatedContentServices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentServices for SimulatedContentServices {
    async fn validate_and_extract_metadata(&self, video_ref: &str) -> Result<VideoMetadata> {
        if video_ref.trim().is_empty() {
            return Err(Error::Validation("video reference is empty".to_string()));
        }
        Ok(VideoMetadata {
            duration: 60.0,
            format: "mp4".to_string(),
            size: 1_024_000,
            extra: Map::new(),
        })
    }

    async fn generate_caption(&self, context: &PipelineContext) -> Result<CaptionResult> {
        debug!(task_id = %context.task_id, "Simulated caption");
        Ok(CaptionResult {
            caption: "Amazing content! #trending".to_string(),
            hashtags: vec![
                "#viral".to_string(),
                "#content".to_string(),
                "#ai".to_string(),
            ],
        })
    }

    async fn compute_optimal_time(&self, _context: &PipelineContext) -> Result<DateTime<Utc>> {
        let delay = chrono::Duration::from_std(self.schedule_delay)
            .map_err(|e| Error::Internal(format!("schedule delay out of range: {}", e)))?;
        Ok(Utc::now() + delay)
    }

    async fn publish_to_platforms(&self, context: &PipelineContext) -> Result<PublishResult> {
        Ok(PublishResult {
            post_id: format!("sim-{}", context.task_id),
            platforms: vec!["instagram".to_string(), "youtube".to_string()],
        })
    }

    async fn collect_analytics(&self, _post_id: &str) -> Result<AnalyticsRecord> {
        Ok(AnalyticsRecord {
            views: 1000,
            likes: 50,
            comments: 10,
            extra: Map::new(),
        })
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}
