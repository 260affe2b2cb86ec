//! Error types for postpilot-core
//!
//! A single error enum covers the whole orchestration core. The variants
//! follow the failure taxonomy the pipeline reacts to: validation and
//! permanent rejections fail a pipeline immediately, transient service and
//! connectivity errors are handed to the retry manager.

use thiserror::Error;

/// Core error type
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Bad input (invalid media reference, malformed request)
    #[error("validation error: {0}")]
    Validation(String),

    /// Network or 5xx-class failure from a collaborator
    #[error("transient error from {service}: {message}")]
    TransientService {
        /// Collaborator or service name
        service: String,
        /// Failure description
        message: String,
    },

    /// Collaborator reported a definitive rejection
    #[error("permanent error from {service}: {message}")]
    PermanentService {
        /// Collaborator or service name
        service: String,
        /// Failure description
        message: String,
    },

    /// CPU, memory, disk or concurrency limit reached
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    /// A dependent service stopped answering health checks
    #[error("connectivity lost to {service}: {message}")]
    ConnectivityLoss {
        /// Service name
        service: String,
        /// Failure description
        message: String,
    },

    /// A pipeline with this task id is already running
    #[error("pipeline already active: {0}")]
    DuplicatePipeline(String),

    /// Unknown task, service or key
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation did not finish in time
    #[error("timed out: {0}")]
    Timeout(String),

    /// Operation was cancelled (shutdown or explicit cancel)
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// JSON encoding/decoding failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Redis command or connection failure
    #[error("redis error: {0}")]
    Redis(String),

    /// Invalid settings
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a transient collaborator failure.
    pub fn transient(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientService {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a permanent collaborator failure.
    pub fn permanent(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PermanentService {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Whether the retry manager may attempt the operation again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientService { .. } | Self::ConnectivityLoss { .. } | Self::Timeout(_)
        )
    }

    /// Short machine-readable kind, used in event payloads and API responses.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::TransientService { .. } => "transient_service",
            Self::PermanentService { .. } => "permanent_service",
            Self::ResourceExhaustion(_) => "resource_exhaustion",
            Self::ConnectivityLoss { .. } => "connectivity_loss",
            Self::DuplicatePipeline(_) => "duplicate_pipeline",
            Self::NotFound(_) => "not_found",
            Self::Timeout(_) => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::Serialization(_) => "serialization",
            Self::Redis(_) => "redis",
            Self::Configuration(_) => "configuration",
            Self::Internal(_) => "internal",
        }
    }

    /// Classify an HTTP client error coming back from `service`.
    ///
    /// Timeouts, connection failures and 5xx responses are transient; 400 and
    /// 422 are validation failures; every other status is a permanent rejection.
    pub fn from_http(service: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return Self::transient(service, err.to_string());
        }
        match err.status() {
            Some(status) if status.is_server_error() => Self::transient(service, err.to_string()),
            Some(status) if status.as_u16() == 400 || status.as_u16() == 422 => {
                Self::Validation(format!("{}: {}", service, err))
            }
            Some(_) => Self::permanent(service, err.to_string()),
            None => Self::transient(service, err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::Redis(err.to_string())
    }
}
