use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::RetryConfig;
use crate::error::{Error, Result};
use crate::event_bus::{EventBus, EventPayload};

/// Operation driven by the retry manager. Called once per attempt.
pub type RetryOperation = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

const EVENT_SOURCE: &str = "retry_manager";

/// Retry manager configuration
#[derive(Debug, Clone)]
pub struct RetryManagerConfig {
    /// How often the scheduler looks for due tasks
    pub poll_interval: Duration,
    /// Terminal tasks kept for status queries
    pub completed_history: usize,
    /// Default wait used by the `retry_*` convenience methods
    pub wait_timeout: Duration,
}

impl Default for RetryManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            completed_history: 100,
            wait_timeout: Duration::from_secs(300),
        }
    }
}

impl RetryManagerConfig {
    /// Set poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set completed history size
    #[must_use]
    pub fn with_completed_history(mut self, size: usize) -> Self {
        self.completed_history = size;
        self
    }

    /// Set wait timeout
    #[must_use]
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }
}

/// Terminal outcome of a retry task
#[derive(Debug, Clone)]
enum TaskOutcome {
    Succeeded(Value),
    Failed(Error),
}

impl TaskOutcome {
    fn into_result(self) -> Result<Value> {
        match self {
            Self::Succeeded(value) => Ok(value),
            Self::Failed(err) => Err(err),
        }
    }
}

/// How a finished task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResult {
    /// Operation succeeded
    Success,
    /// Attempts exhausted or non-retryable error
    Failed,
    /// Cancelled before finishing
    Cancelled,
}

/// Snapshot returned by [`RetryManager::get_task_status`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryTaskStatus {
    /// Task id
    pub task_id: String,
    /// Executions so far
    pub attempts: u32,
    /// Configured maximum
    pub max_attempts: u32,
    /// Start of the latest execution
    pub last_attempt: Option<DateTime<Utc>>,
    /// Latest error text
    pub last_error: Option<String>,
    /// Whether the task is terminal
    pub completed: bool,
    /// Seconds until the next execution (active tasks only)
    pub next_retry_in: Option<f64>,
    /// Outcome (terminal tasks only)
    pub result: Option<TaskResult>,
}

/// Counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryMetrics {
    /// Tasks submitted
    pub total_tasks: u64,
    /// Tasks that succeeded
    pub successful_tasks: u64,
    /// Tasks that failed or were cancelled
    pub failed_tasks: u64,
    /// Executions across all tasks
    pub retry_attempts: u64,
    /// Mean executions per terminal task
    pub avg_attempts_per_task: f64,
    /// Tasks not yet terminal
    pub active_tasks: usize,
}

struct RetryTask {
    task_id: String,
    operation: RetryOperation,
    config: RetryConfig,
    attempts: u32,
    last_attempt: Option<DateTime<Utc>>,
    last_error: Option<Error>,
    next_attempt_at: Instant,
    in_flight: bool,
    outcome: watch::Sender<Option<TaskOutcome>>,
}

struct CompletedTask {
    status: RetryTaskStatus,
    outcome: watch::Receiver<Option<TaskOutcome>>,
}

#[derive(Default)]
struct State {
    active: HashMap<String, RetryTask>,
    completed: VecDeque<CompletedTask>,
    metrics: RetryMetrics,
    terminal_attempts: u64,
}

impl State {
    fn finish(
        &mut self,
        task: RetryTask,
        outcome: TaskOutcome,
        result: TaskResult,
        history: usize,
    ) {
        match result {
            TaskResult::Success => self.metrics.successful_tasks += 1,
            TaskResult::Failed | TaskResult::Cancelled => self.metrics.failed_tasks += 1,
        }
        self.terminal_attempts += u64::from(task.attempts);
        let terminal = self.metrics.successful_tasks + self.metrics.failed_tasks;
        self.metrics.avg_attempts_per_task = self.terminal_attempts as f64 / terminal as f64;

        let status = RetryTaskStatus {
            task_id: task.task_id.clone(),
            attempts: task.attempts,
            max_attempts: task.config.max_attempts,
            last_attempt: task.last_attempt,
            last_error: task.last_error.as_ref().map(ToString::to_string),
            completed: true,
            next_retry_in: None,
            result: Some(result),
        };
        let receiver = task.outcome.subscribe();
        let _ = task.outcome.send(Some(outcome));

        self.completed.push_back(CompletedTask {
            status,
            outcome: receiver,
        });
        while self.completed.len() > history {
            self.completed.pop_front();
        }
    }
}

/// Background retry-with-backoff manager.
///
/// Tasks are executed by a scheduler loop that wakes every `poll_interval`,
/// or immediately when a task is submitted or forced. Each execution runs on
/// its own Tokio task, and a task is never executed twice concurrently.
pub struct RetryManager {
    config: RetryManagerConfig,
    state: Mutex<State>,
    wakeup: Notify,
    event_bus: Option<Arc<EventBus>>,
}

impl RetryManager {
    /// Create a manager; call [`start`](Self::start) to run the scheduler.
    #[must_use]
    pub fn new(config: RetryManagerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            wakeup: Notify::new(),
            event_bus: None,
        }
    }

    /// Publish `retry.*` events on `bus`.
    #[must_use]
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the scheduler loop. It exits when `shutdown` fires.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let manager = Arc::clone(self);
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Retry manager started"
        );
        tokio::spawn(async move {
            loop {
                for (task_id, operation) in manager.take_due() {
                    let runner = Arc::clone(&manager);
                    tokio::spawn(async move {
                        runner.execute(task_id, operation).await;
                    });
                }

                tokio::select! {
                    _ = tokio::time::sleep(manager.config.poll_interval) => {}
                    _ = manager.wakeup.notified() => {}
                    _ = shutdown.cancelled() => {
                        info!("Retry manager stopped");
                        break;
                    }
                }
            }
        });
    }

    /// Enqueue `operation` under `task_id`. The first attempt runs on the
    /// next scheduler pass.
    pub fn submit_task(
        &self,
        task_id: impl Into<String>,
        operation: RetryOperation,
        config: RetryConfig,
    ) -> Result<String> {
        let task_id = task_id.into();
        {
            let mut state = self.lock();
            if state.active.contains_key(&task_id) {
                return Err(Error::Validation(format!(
                    "retry task {} is already active",
                    task_id
                )));
            }
            state.completed.retain(|c| c.status.task_id != task_id);

            let (outcome, _) = watch::channel(None);
            state.active.insert(
                task_id.clone(),
                RetryTask {
                    task_id: task_id.clone(),
                    operation,
                    config,
                    attempts: 0,
                    last_attempt: None,
                    last_error: None,
                    next_attempt_at: Instant::now(),
                    in_flight: false,
                    outcome,
                },
            );
            state.metrics.total_tasks += 1;
        }

        debug!(task_id = %task_id, "Submitted retry task");
        self.wakeup.notify_one();
        Ok(task_id)
    }

    /// Claim every due task: mark it in flight and count the attempt.
    fn take_due(&self) -> Vec<(String, RetryOperation)> {
        let now = Instant::now();
        let wall_now = Utc::now();
        let mut state = self.lock();
        let mut due = Vec::new();
        let mut started = 0;

        for task in state.active.values_mut() {
            if task.in_flight
                || task.attempts >= task.config.max_attempts
                || task.next_attempt_at > now
            {
                continue;
            }
            task.in_flight = true;
            task.attempts += 1;
            task.last_attempt = Some(wall_now);
            started += 1;
            due.push((task.task_id.clone(), Arc::clone(&task.operation)));
        }
        state.metrics.retry_attempts += started;
        due
    }

    async fn execute(&self, task_id: String, operation: RetryOperation) {
        debug!(task_id = %task_id, "Executing retry task");
        let outcome = operation().await;

        let event = {
            let mut state = self.lock();
            let Some(mut task) = state.active.remove(&task_id) else {
                debug!(task_id = %task_id, "Retry task was cancelled while running");
                return;
            };
            task.in_flight = false;

            match outcome {
                Ok(value) => {
                    let attempts = task.attempts;
                    state.finish(
                        task,
                        TaskOutcome::Succeeded(value),
                        TaskResult::Success,
                        self.config.completed_history,
                    );
                    info!(task_id = %task_id, attempts, "Retry task completed");
                    EventPayload::RetryTaskCompleted { task_id, attempts }
                }
                Err(err) => {
                    let attempts = task.attempts;
                    let exhausted = attempts >= task.config.max_attempts;
                    if exhausted || !err.is_retryable() {
                        error!(
                            task_id = %task_id,
                            attempts,
                            retryable = err.is_retryable(),
                            error = %err,
                            "Retry task failed permanently"
                        );
                        task.last_error = Some(err.clone());
                        state.finish(
                            task,
                            TaskOutcome::Failed(err.clone()),
                            TaskResult::Failed,
                            self.config.completed_history,
                        );
                        EventPayload::RetryTaskFailed {
                            task_id,
                            attempts,
                            error: err.to_string(),
                        }
                    } else {
                        let delay = task.config.delay_for(attempts - 1);
                        warn!(
                            task_id = %task_id,
                            attempt = attempts,
                            max_attempts = task.config.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Retry task failed, rescheduling"
                        );
                        task.last_error = Some(err);
                        task.next_attempt_at = Instant::now() + delay;
                        state.active.insert(task_id.clone(), task);
                        EventPayload::RetryScheduled {
                            task_id,
                            attempt: attempts,
                            delay_secs: delay.as_secs_f64(),
                        }
                    }
                }
            }
        };

        self.publish(&event).await;
    }

    async fn publish(&self, payload: &EventPayload) {
        if let Some(bus) = &self.event_bus {
            if let Err(e) = bus.publish_payload(payload, EVENT_SOURCE).await {
                warn!(error = %e, event_type = payload.event_type(), "Failed to publish retry event");
            }
        }
    }

    /// Wait until `task_id` is terminal and return its result or last error.
    ///
    /// Fails with [`Error::NotFound`] for unknown ids and [`Error::Timeout`]
    /// when `timeout` elapses first. Only the caller waits; the scheduler
    /// keeps running.
    pub async fn wait_for_task(&self, task_id: &str, timeout: Duration) -> Result<Value> {
        let mut receiver = {
            let state = self.lock();
            match state.active.get(task_id) {
                Some(task) => task.outcome.subscribe(),
                None => state
                    .completed
                    .iter()
                    .rev()
                    .find(|c| c.status.task_id == task_id)
                    .map(|c| c.outcome.clone())
                    .ok_or_else(|| Error::NotFound(format!("retry task {}", task_id)))?,
            }
        };

        let waited = tokio::time::timeout(timeout, receiver.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(outcome)) => match outcome.clone() {
                Some(outcome) => outcome.into_result(),
                None => Err(Error::Internal(format!("retry task {} has no outcome", task_id))),
            },
            Ok(Err(_)) => Err(Error::Internal(format!(
                "retry task {} was dropped",
                task_id
            ))),
            Err(_) => Err(Error::Timeout(format!(
                "retry task {} did not complete within {:?}",
                task_id, timeout
            ))),
        }
    }

    /// Submit with an explicit config and wait for the typed result.
    pub async fn retry_with_config<T, F, Fut>(
        &self,
        task_id: &str,
        config: RetryConfig,
        operation: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let op: RetryOperation = Arc::new(move || {
            let fut = operation();
            async move {
                let value = fut.await?;
                serde_json::to_value(value).map_err(Error::from)
            }
            .boxed()
        });
        let id = self.submit_task(task_id, op, config)?;
        let value = self.wait_for_task(&id, self.config.wait_timeout).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Retry one pipeline stage under `<task_id>_<step>`.
    pub async fn retry_pipeline_step<T, F, Fut>(
        &self,
        task_id: &str,
        step: &str,
        operation: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.retry_with_config(
            &format!("{}_{}", task_id, step),
            RetryConfig::pipeline_step(),
            operation,
        )
        .await
    }

    /// Retry a plain API call under `<task_id>_api_call`.
    pub async fn retry_api_call<T, F, Fut>(&self, task_id: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.retry_with_config(
            &format!("{}_api_call", task_id),
            RetryConfig::api_call(),
            operation,
        )
        .await
    }

    /// Status of an active or recently finished task.
    #[must_use]
    pub fn get_task_status(&self, task_id: &str) -> Option<RetryTaskStatus> {
        let state = self.lock();
        if let Some(task) = state.active.get(task_id) {
            let next_retry_in = if task.in_flight {
                0.0
            } else {
                task.next_attempt_at
                    .saturating_duration_since(Instant::now())
                    .as_secs_f64()
            };
            return Some(RetryTaskStatus {
                task_id: task.task_id.clone(),
                attempts: task.attempts,
                max_attempts: task.config.max_attempts,
                last_attempt: task.last_attempt,
                last_error: task.last_error.as_ref().map(ToString::to_string),
                completed: false,
                next_retry_in: Some(next_retry_in),
                result: None,
            });
        }
        state
            .completed
            .iter()
            .rev()
            .find(|c| c.status.task_id == task_id)
            .map(|c| c.status.clone())
    }

    /// Cancel an active task. An in-flight execution runs to completion but
    /// its result is discarded. Returns false if the task is not active.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let mut state = self.lock();
        let Some(mut task) = state.active.remove(task_id) else {
            return false;
        };
        let err = Error::Cancelled(format!("retry task {}", task_id));
        task.last_error = Some(err.clone());
        state.finish(
            task,
            TaskOutcome::Failed(err),
            TaskResult::Cancelled,
            self.config.completed_history,
        );
        info!(task_id = %task_id, "Cancelled retry task");
        true
    }

    /// Make an active task due now. Returns false if the task is not active.
    pub fn force_retry(&self, task_id: &str) -> bool {
        let found = {
            let mut state = self.lock();
            match state.active.get_mut(task_id) {
                Some(task) => {
                    task.next_attempt_at = Instant::now();
                    true
                }
                None => false,
            }
        };
        if found {
            info!(task_id = %task_id, "Forced retry");
            self.wakeup.notify_one();
        }
        found
    }

    /// Current counters
    #[must_use]
    pub fn get_metrics(&self) -> RetryMetrics {
        let state = self.lock();
        RetryMetrics {
            active_tasks: state.active.len(),
            ..state.metrics.clone()
        }
    }
}

impl std::fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryManager")
            .field("config", &self.config)
            .finish()
    }
}
