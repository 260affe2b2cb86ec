use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::health::{AlertLevel, HealthStatus, ServiceHealth, SystemMetrics};
use crate::pipeline::PipelineState;

/// Channel every event is mirrored to.
pub const WILDCARD_CHANNEL: &str = "events:all";

/// Event envelope as it travels over the broker.
///
/// Immutable once published. `event_id` is `<event_type>_<unix millis>` and
/// only serves as a best-effort deduplication hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Topic the event was published under
    pub event_type: String,
    /// Structured payload
    pub data: Value,
    /// Publish time
    pub timestamp: DateTime<Utc>,
    /// Publishing component
    pub source: String,
    /// Best-effort identifier
    pub event_id: String,
}

impl Event {
    /// Wrap `data` into an envelope stamped with the current time.
    #[must_use]
    pub fn new(event_type: impl Into<String>, data: Value, source: impl Into<String>) -> Self {
        let event_type = event_type.into();
        let timestamp = Utc::now();
        let event_id = format!("{}_{}", event_type, timestamp.timestamp_millis());
        Self {
            event_type,
            data,
            timestamp,
            source: source.into(),
            event_id,
        }
    }

    /// First dot-separated segment of the topic (`pipeline`, `system`, ...).
    #[must_use]
    pub fn category(&self) -> &str {
        self.event_type
            .split('.')
            .next()
            .unwrap_or(self.event_type.as_str())
    }

    /// Encode as the JSON wire envelope.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a JSON wire envelope.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Deserialize the payload into a concrete type.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Decode into the typed payload, if the topic is a known one.
    pub fn payload(&self) -> Result<EventPayload> {
        EventPayload::from_parts(&self.event_type, self.data.clone())
    }
}

/// Typed payloads for every event the core publishes.
///
/// The discriminator doubles as the topic name; `data` carries the
/// per-type schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data")]
pub enum EventPayload {
    /// A pipeline was accepted and its task spawned
    #[serde(rename = "pipeline.started")]
    PipelineStarted {
        /// Task identifier
        task_id: String,
        /// Owning user
        user_id: String,
        /// Input media reference
        video_ref: String,
    },
    /// A pipeline moved from one state to the next
    #[serde(rename = "pipeline.state_changed")]
    PipelineStateChanged {
        /// Task identifier
        task_id: String,
        /// Owning user
        user_id: String,
        /// Previous state
        from_state: PipelineState,
        /// New state
        to_state: PipelineState,
        /// Transition time
        timestamp: DateTime<Utc>,
    },
    /// UPLOAD stage finished
    #[serde(rename = "pipeline.upload_completed")]
    UploadCompleted {
        /// Task identifier
        task_id: String,
        /// Extracted media metadata
        metadata: Value,
    },
    /// CAPTION stage finished
    #[serde(rename = "pipeline.caption_generated")]
    CaptionGenerated {
        /// Task identifier
        task_id: String,
        /// Caption text
        caption: String,
        /// Hashtags
        hashtags: Vec<String>,
        /// Whether the caption came from the cache
        cached: bool,
    },
    /// SCHEDULE stage finished
    #[serde(rename = "pipeline.scheduled")]
    Scheduled {
        /// Task identifier
        task_id: String,
        /// Chosen publish time
        scheduled_time: DateTime<Utc>,
    },
    /// POST stage finished
    #[serde(rename = "pipeline.posted")]
    Posted {
        /// Task identifier
        task_id: String,
        /// Platform post id
        post_id: String,
        /// Platforms the content went to
        platforms: Vec<String>,
    },
    /// ANALYZE stage finished
    #[serde(rename = "pipeline.analyzed")]
    Analyzed {
        /// Task identifier
        task_id: String,
        /// Collected analytics
        analytics: Value,
    },
    /// Pipeline reached COMPLETED
    #[serde(rename = "pipeline.completed")]
    PipelineCompleted {
        /// Task identifier
        task_id: String,
        /// Owning user
        user_id: String,
        /// Wall-clock seconds from start to completion
        completion_time: f64,
        /// Post id, when one was produced
        post_id: Option<String>,
    },
    /// Pipeline reached FAILED
    #[serde(rename = "pipeline.failed")]
    PipelineFailed {
        /// Task identifier
        task_id: String,
        /// Owning user
        user_id: String,
        /// State the pipeline was in when it failed
        last_state: PipelineState,
        /// Error text
        error: String,
        /// Error kind, see [`Error::kind`]
        error_kind: String,
    },
    /// A health check failed
    #[serde(rename = "system.service_down")]
    ServiceDown {
        /// Service name
        service: String,
        /// Failure description
        error: String,
        /// Failures in a row, including this one
        consecutive_failures: u32,
    },
    /// A service's status changed
    #[serde(rename = "system.service_status_changed")]
    ServiceStatusChanged {
        /// Service name
        service: String,
        /// Previous status
        old_status: HealthStatus,
        /// New status
        new_status: HealthStatus,
        /// Change time
        timestamp: DateTime<Utc>,
    },
    /// Self-healing brought a service back
    #[serde(rename = "system.service_recovered")]
    ServiceRecovered {
        /// Service name
        service: String,
        /// Name of the recovery action that succeeded
        action: String,
        /// Recovery time
        timestamp: DateTime<Utc>,
    },
    /// CPU, memory or disk crossed a threshold
    #[serde(rename = "system.resource_alert")]
    ResourceAlert {
        /// `cpu`, `memory` or `disk`
        resource: String,
        /// Severity
        level: AlertLevel,
        /// Observed percentage
        value: f64,
        /// Threshold that was crossed
        threshold: f64,
        /// Sample time
        timestamp: DateTime<Utc>,
    },
    /// Summary published at the end of every monitoring cycle
    #[serde(rename = "system.health_check")]
    HealthCheck {
        /// Worst status across services
        overall_status: HealthStatus,
        /// Per-service health
        services: BTreeMap<String, ServiceHealth>,
        /// Latest resource sample
        system: Option<SystemMetrics>,
        /// Cycle time
        timestamp: DateTime<Utc>,
    },
    /// A retry task succeeded
    #[serde(rename = "retry.task_completed")]
    RetryTaskCompleted {
        /// Retry task id
        task_id: String,
        /// Attempts used
        attempts: u32,
    },
    /// A retry task gave up
    #[serde(rename = "retry.task_failed")]
    RetryTaskFailed {
        /// Retry task id
        task_id: String,
        /// Attempts used
        attempts: u32,
        /// Last error
        error: String,
    },
    /// A retry task was rescheduled
    #[serde(rename = "retry.retry_scheduled")]
    RetryScheduled {
        /// Retry task id
        task_id: String,
        /// Attempts made so far
        attempt: u32,
        /// Delay until the next attempt, seconds
        delay_secs: f64,
    },
}

impl EventPayload {
    /// Topic this payload is published under.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PipelineStarted { .. } => "pipeline.started",
            Self::PipelineStateChanged { .. } => "pipeline.state_changed",
            Self::UploadCompleted { .. } => "pipeline.upload_completed",
            Self::CaptionGenerated { .. } => "pipeline.caption_generated",
            Self::Scheduled { .. } => "pipeline.scheduled",
            Self::Posted { .. } => "pipeline.posted",
            Self::Analyzed { .. } => "pipeline.analyzed",
            Self::PipelineCompleted { .. } => "pipeline.completed",
            Self::PipelineFailed { .. } => "pipeline.failed",
            Self::ServiceDown { .. } => "system.service_down",
            Self::ServiceStatusChanged { .. } => "system.service_status_changed",
            Self::ServiceRecovered { .. } => "system.service_recovered",
            Self::ResourceAlert { .. } => "system.resource_alert",
            Self::HealthCheck { .. } => "system.health_check",
            Self::RetryTaskCompleted { .. } => "retry.task_completed",
            Self::RetryTaskFailed { .. } => "retry.task_failed",
            Self::RetryScheduled { .. } => "retry.retry_scheduled",
        }
    }

    /// The `data` half of the envelope.
    pub fn to_data(&self) -> Result<Value> {
        let mut tagged = serde_json::to_value(self)?;
        Ok(tagged
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    /// Rebuild a typed payload from a topic and its data.
    pub fn from_parts(event_type: &str, data: Value) -> Result<Self> {
        let tagged = serde_json::json!({ "event_type": event_type, "data": data });
        Ok(serde_json::from_value(tagged)?)
    }
}

/// Check that a topic can be published to.
///
/// Topics are non-empty, contain no whitespace, and may not be the wildcard
/// channel itself.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::Validation("event type must not be empty".to_string()));
    }
    if topic.chars().any(char::is_whitespace) {
        return Err(Error::Validation(format!(
            "event type must not contain whitespace: {:?}",
            topic
        )));
    }
    if topic == WILDCARD_CHANNEL {
        return Err(Error::Validation(format!(
            "{} is reserved for mirroring",
            WILDCARD_CHANNEL
        )));
    }
    Ok(())
}
