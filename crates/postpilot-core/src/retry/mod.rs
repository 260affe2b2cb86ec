//! Retry manager with pluggable backoff strategies
//!
//! Operations are submitted as tasks and driven by a background scheduler.
//! Whether a failure is retried is decided by [`Error::is_retryable`]:
//! transient errors back off and retry up to `max_attempts`, everything else
//! terminates the task immediately.
//!
//! [`Error::is_retryable`]: crate::Error::is_retryable

mod config;
mod manager;

pub use config::{RetryConfig, RetryStrategy};
pub use manager::{
    RetryManager, RetryManagerConfig, RetryMetrics, RetryOperation, RetryTaskStatus, TaskResult,
};

#[cfg(test)]
mod tests;
