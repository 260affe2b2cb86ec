use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Pipeline states. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    /// Validate input and extract metadata
    Upload,
    /// Generate caption and hashtags
    Caption,
    /// Pick the publish time
    Schedule,
    /// Publish to the platforms
    Post,
    /// Collect analytics
    Analyze,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

impl PipelineState {
    /// Progress percentage reported while a pipeline is in this state.
    #[must_use]
    pub fn progress(&self) -> f64 {
        match self {
            Self::Upload => 20.0,
            Self::Caption => 40.0,
            Self::Schedule => 60.0,
            Self::Post => 80.0,
            Self::Analyze | Self::Completed => 100.0,
            Self::Failed => 0.0,
        }
    }

    /// Whether the pipeline has stopped
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Successor on the happy path; `None` for terminal states.
    #[must_use]
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Upload => Some(Self::Caption),
            Self::Caption => Some(Self::Schedule),
            Self::Schedule => Some(Self::Post),
            Self::Post => Some(Self::Analyze),
            Self::Analyze => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    /// Step name used in retry task ids (`<task_id>_<step>`).
    #[must_use]
    pub fn step_name(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Caption => "caption",
            Self::Schedule => "schedule",
            Self::Post => "post",
            Self::Analyze => "analyze",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Upload => "UPLOAD",
            Self::Caption => "CAPTION",
            Self::Schedule => "SCHEDULE",
            Self::Post => "POST",
            Self::Analyze => "ANALYZE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Working state of one pipeline.
///
/// Owned by the task driving the pipeline; other readers only ever see
/// [`PipelineStatus`] snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineContext {
    /// Task identifier
    pub task_id: String,
    /// Owning user
    pub user_id: String,
    /// Current state
    pub state: PipelineState,
    /// Input media reference
    pub video_ref: String,
    /// Generated caption
    pub caption: Option<String>,
    /// Generated hashtags
    pub hashtags: Vec<String>,
    /// Chosen publish time
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Platform post id
    pub post_id: Option<String>,
    /// Collected analytics
    pub analytics: Option<Value>,
    /// Free-form stage data
    pub metadata: Map<String, Value>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl PipelineContext {
    /// Fresh context in the UPLOAD state
    #[must_use]
    pub fn new(
        task_id: impl Into<String>,
        user_id: impl Into<String>,
        video_ref: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            user_id: user_id.into(),
            state: PipelineState::Upload,
            video_ref: video_ref.into(),
            caption: None,
            hashtags: Vec::new(),
            scheduled_time: None,
            post_id: None,
            analytics: None,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Snapshot of an active pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    /// Task identifier
    pub task_id: String,
    /// Owning user
    pub user_id: String,
    /// Current state
    pub state: PipelineState,
    /// Percent complete, see [`PipelineState::progress`]
    pub progress: f64,
    /// Input media reference
    pub video_ref: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last transition time
    pub updated_at: DateTime<Utc>,
}

impl From<&PipelineContext> for PipelineStatus {
    fn from(ctx: &PipelineContext) -> Self {
        Self {
            task_id: ctx.task_id.clone(),
            user_id: ctx.user_id.clone(),
            state: ctx.state,
            progress: ctx.state.progress(),
            video_ref: ctx.video_ref.clone(),
            created_at: ctx.created_at,
            updated_at: ctx.updated_at,
        }
    }
}

/// How a finished pipeline ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutcome {
    /// Task identifier
    pub task_id: String,
    /// Owning user
    pub user_id: String,
    /// `Completed` or `Failed`
    pub state: PipelineState,
    /// Last non-terminal state reached
    pub last_state: PipelineState,
    /// Error text, for failures
    pub error: Option<String>,
    /// Error kind, for failures
    pub error_kind: Option<String>,
    /// Seconds from start to completion, for successes
    pub completion_time: Option<f64>,
    /// Platform post id, when one was produced
    pub post_id: Option<String>,
    /// Caption, when one was produced
    pub caption: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Terminal time
    pub finished_at: DateTime<Utc>,
}

/// Engine counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    /// Pipelines accepted
    pub total_started: u64,
    /// Pipelines that reached COMPLETED
    pub total_completed: u64,
    /// Pipelines that reached FAILED
    pub total_failed: u64,
    /// Pipelines still running
    pub active_pipelines: usize,
    /// Running mean of completion times, seconds
    pub avg_completion_time: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_order() {
        let mut state = PipelineState::Upload;
        let mut seen = vec![state];
        while let Some(next) = state.next() {
            seen.push(next);
            state = next;
        }
        assert_eq!(
            seen,
            vec![
                PipelineState::Upload,
                PipelineState::Caption,
                PipelineState::Schedule,
                PipelineState::Post,
                PipelineState::Analyze,
                PipelineState::Completed,
            ]
        );
        assert!(PipelineState::Failed.next().is_none());
    }

    #[test]
    fn test_progress_table() {
        let table: Vec<f64> = [
            PipelineState::Upload,
            PipelineState::Caption,
            PipelineState::Schedule,
            PipelineState::Post,
            PipelineState::Analyze,
        ]
        .iter()
        .map(PipelineState::progress)
        .collect();
        assert_eq!(table, vec![20.0, 40.0, 60.0, 80.0, 100.0]);
        assert_eq!(PipelineState::Completed.progress(), 100.0);
        assert_eq!(PipelineState::Failed.progress(), 0.0);
    }

    #[test]
    fn test_state_wire_format() {
        assert_eq!(
            serde_json::to_string(&PipelineState::Schedule).unwrap(),
            "\"SCHEDULE\""
        );
        let parsed: PipelineState = serde_json::from_str("\"COMPLETED\"").unwrap();
        assert_eq!(parsed, PipelineState::Completed);
        assert_eq!(PipelineState::Post.to_string(), "POST");
    }

    #[test]
    fn test_status_snapshot() {
        let mut ctx = PipelineContext::new("t1", "u1", "s3://bucket/v.mp4");
        ctx.state = PipelineState::Schedule;
        let status = PipelineStatus::from(&ctx);
        assert_eq!(status.task_id, "t1");
        assert_eq!(status.progress, 60.0);
        assert_eq!(status.video_ref, "s3://bucket/v.mp4");
    }
}
