use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::types::{
    PipelineContext, PipelineMetrics, PipelineOutcome, PipelineState, PipelineStatus,
};
use crate::cache::CacheManager;
use crate::collaborators::{AnalyticsRecord, CaptionResult, ContentServices, PublishResult};
use crate::error::{Error, Result};
use crate::event_bus::{EventBus, EventPayload};
use crate::health::{AlertLevel, HealthMonitor};
use crate::retry::{RetryConfig, RetryManager};
use crate::shutdown::{PipelineGuard, ShutdownController};

const EVENT_SOURCE: &str = "pipeline_engine";

/// Pipeline engine configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Pipelines allowed to run at once
    pub max_concurrent_pipelines: usize,
    /// Processing-time deadline for a whole pipeline, excluding the wait
    /// for the scheduled publish time
    pub pipeline_timeout: Duration,
    /// Longest single sleep while waiting for the scheduled time
    pub max_schedule_wait: Duration,
    /// Retry policy applied to every collaborator call
    pub stage_retry: RetryConfig,
    /// Reject new pipelines while system resources are critical
    pub throttle_on_resource_alert: bool,
    /// Terminal outcomes kept for queries
    pub outcome_history: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_pipelines: 10,
            pipeline_timeout: Duration::from_secs(30 * 60),
            max_schedule_wait: Duration::from_secs(300),
            stage_retry: RetryConfig::pipeline_step(),
            throttle_on_resource_alert: true,
            outcome_history: 100,
        }
    }
}

impl PipelineConfig {
    /// Create a new configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency limit
    #[must_use]
    pub fn with_max_concurrent_pipelines(mut self, max: usize) -> Self {
        self.max_concurrent_pipelines = max;
        self
    }

    /// Set the whole-pipeline deadline
    #[must_use]
    pub fn with_pipeline_timeout(mut self, timeout: Duration) -> Self {
        self.pipeline_timeout = timeout;
        self
    }

    /// Set the POST stage wait cap
    #[must_use]
    pub fn with_max_schedule_wait(mut self, wait: Duration) -> Self {
        self.max_schedule_wait = wait;
        self
    }

    /// Set the per-stage retry policy
    #[must_use]
    pub fn with_stage_retry(mut self, retry: RetryConfig) -> Self {
        self.stage_retry = retry;
        self
    }

    /// Enable or disable resource throttling
    #[must_use]
    pub fn with_throttle_on_resource_alert(mut self, enabled: bool) -> Self {
        self.throttle_on_resource_alert = enabled;
        self
    }

    /// Set outcome history size
    #[must_use]
    pub fn with_outcome_history(mut self, size: usize) -> Self {
        self.outcome_history = size;
        self
    }
}

/// Result of one stage, computed before the context is touched.
enum StageOutput {
    Uploaded(Value),
    Captioned { result: CaptionResult, cached: bool },
    Scheduled(DateTime<Utc>),
    Posted(PublishResult),
    Analyzed(Value),
}

impl StageOutput {
    fn next_state(&self) -> PipelineState {
        match self {
            Self::Uploaded(_) => PipelineState::Caption,
            Self::Captioned { .. } => PipelineState::Schedule,
            Self::Scheduled(_) => PipelineState::Post,
            Self::Posted(_) => PipelineState::Analyze,
            Self::Analyzed(_) => PipelineState::Completed,
        }
    }

    /// Write the stage result into `ctx` and build the matching event.
    fn apply(self, ctx: &mut PipelineContext) -> EventPayload {
        ctx.touch();
        let task_id = ctx.task_id.clone();
        match self {
            Self::Uploaded(metadata) => {
                ctx.metadata
                    .insert("video_metadata".to_string(), metadata.clone());
                EventPayload::UploadCompleted { task_id, metadata }
            }
            Self::Captioned { result, cached } => {
                ctx.caption = Some(result.caption.clone());
                ctx.hashtags = result.hashtags.clone();
                ctx.metadata
                    .insert("caption_cached".to_string(), Value::Bool(cached));
                EventPayload::CaptionGenerated {
                    task_id,
                    caption: result.caption,
                    hashtags: result.hashtags,
                    cached,
                }
            }
            Self::Scheduled(scheduled_time) => {
                ctx.scheduled_time = Some(scheduled_time);
                EventPayload::Scheduled {
                    task_id,
                    scheduled_time,
                }
            }
            Self::Posted(result) => {
                ctx.post_id = Some(result.post_id.clone());
                ctx.metadata
                    .insert("platforms".to_string(), Value::from(result.platforms.clone()));
                EventPayload::Posted {
                    task_id,
                    post_id: result.post_id,
                    platforms: result.platforms,
                }
            }
            Self::Analyzed(analytics) => {
                ctx.analytics = Some(analytics.clone());
                EventPayload::Analyzed { task_id, analytics }
            }
        }
    }
}

struct ActivePipeline {
    status: PipelineStatus,
    cancel: CancellationToken,
}

#[derive(Default)]
struct History {
    outcomes: VecDeque<PipelineOutcome>,
    metrics: PipelineMetrics,
}

impl History {
    fn record(&mut self, outcome: PipelineOutcome, limit: usize) {
        self.outcomes.push_back(outcome);
        while self.outcomes.len() > limit {
            self.outcomes.pop_front();
        }
    }
}

fn retry_task_id(task_id: &str, state: PipelineState) -> String {
    format!("{}_{}", task_id, state.step_name())
}

/// Drives pipelines through UPLOAD → CAPTION → SCHEDULE → POST → ANALYZE.
///
/// Each pipeline runs on its own Tokio task and owns its
/// [`PipelineContext`]. Collaborator calls go through the [`RetryManager`],
/// and every transition is published on the [`EventBus`].
pub struct PipelineEngine {
    config: PipelineConfig,
    services: Arc<dyn ContentServices>,
    cache: Arc<CacheManager>,
    retry: Arc<RetryManager>,
    event_bus: Arc<EventBus>,
    health: Option<Arc<HealthMonitor>>,
    shutdown: Option<Arc<ShutdownController>>,
    active: DashMap<String, ActivePipeline>,
    running: AtomicUsize,
    history: Mutex<History>,
}

impl PipelineEngine {
    /// Create an engine. The retry manager must be started separately.
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        services: Arc<dyn ContentServices>,
        cache: Arc<CacheManager>,
        retry: Arc<RetryManager>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            services,
            cache,
            retry,
            event_bus,
            health: None,
            shutdown: None,
            active: DashMap::new(),
            running: AtomicUsize::new(0),
            history: Mutex::new(History::default()),
        }
    }

    /// Consult `monitor` before admitting new pipelines
    #[must_use]
    pub fn with_health_monitor(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.health = Some(monitor);
        self
    }

    /// Register pipelines with `controller` so shutdown drains them
    #[must_use]
    pub fn with_shutdown(mut self, controller: Arc<ShutdownController>) -> Self {
        self.shutdown = Some(controller);
        self
    }

    /// Get configuration
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn lock_history(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Accept a pipeline and spawn its execution. Returns the task id
    /// without waiting for any stage.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for an empty task or user id
    /// - [`Error::DuplicatePipeline`] if `task_id` is already running
    /// - [`Error::ResourceExhaustion`] when at the concurrency limit, when
    ///   system resources are critical, or during shutdown
    pub async fn start_pipeline(
        self: &Arc<Self>,
        task_id: impl Into<String>,
        user_id: impl Into<String>,
        video_ref: impl Into<String>,
    ) -> Result<String> {
        let task_id = task_id.into();
        let user_id = user_id.into();
        if task_id.trim().is_empty() {
            return Err(Error::Validation("task_id must not be empty".to_string()));
        }
        if user_id.trim().is_empty() {
            return Err(Error::Validation("user_id must not be empty".to_string()));
        }

        let guard = match &self.shutdown {
            Some(controller) => Some(controller.admit().ok_or_else(|| {
                Error::ResourceExhaustion("shutting down, not accepting pipelines".to_string())
            })?),
            None => None,
        };
        if self.active.contains_key(&task_id) {
            return Err(Error::DuplicatePipeline(task_id));
        }
        self.check_throttle()?;
        self.reserve_slot()?;

        let cancel = guard
            .as_ref()
            .map(PipelineGuard::token)
            .unwrap_or_default();
        let ctx = PipelineContext::new(task_id.clone(), user_id, video_ref);

        match self.active.entry(task_id.clone()) {
            Entry::Occupied(_) => {
                self.running.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::DuplicatePipeline(task_id));
            }
            Entry::Vacant(slot) => {
                slot.insert(ActivePipeline {
                    status: PipelineStatus::from(&ctx),
                    cancel: cancel.clone(),
                });
            }
        }
        self.lock_history().metrics.total_started += 1;

        info!(
            task_id = %ctx.task_id,
            user_id = %ctx.user_id,
            video_ref = %ctx.video_ref,
            "Pipeline started"
        );
        self.emit(&EventPayload::PipelineStarted {
            task_id: ctx.task_id.clone(),
            user_id: ctx.user_id.clone(),
            video_ref: ctx.video_ref.clone(),
        })
        .await;

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run(ctx, cancel).await;
            drop(guard);
        });

        Ok(task_id)
    }

    fn check_throttle(&self) -> Result<()> {
        if !self.config.throttle_on_resource_alert {
            return Ok(());
        }
        let critical = self
            .health
            .as_ref()
            .is_some_and(|h| h.resource_pressure() == Some(AlertLevel::Critical));
        if critical {
            warn!("Rejecting pipeline: system resources critical");
            return Err(Error::ResourceExhaustion(
                "system resources critical, new pipelines throttled".to_string(),
            ));
        }
        Ok(())
    }

    fn reserve_slot(&self) -> Result<()> {
        let max = self.config.max_concurrent_pipelines;
        self.running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|n| {
                Error::ResourceExhaustion(format!(
                    "{} pipelines already running (limit {})",
                    n, max
                ))
            })
    }

    fn release(&self, task_id: &str) {
        if self.active.remove(task_id).is_some() {
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn run(self: Arc<Self>, mut ctx: PipelineContext, cancel: CancellationToken) {
        let started = std::time::Instant::now();
        let timeout = self.config.pipeline_timeout;
        let task_id = ctx.task_id.clone();

        let result = tokio::select! {
            result = self.drive(&mut ctx, timeout) => result,
            _ = cancel.cancelled() => Err(Error::Cancelled(format!("pipeline {}", task_id))),
        };

        match result {
            Ok(()) => self.complete(ctx, started.elapsed().as_secs_f64()).await,
            Err(err) => self.fail(ctx, err).await,
        }
    }

    /// Run stages until a terminal state. `budget` bounds processing time
    /// only; waiting for the scheduled publish time is not charged to it.
    async fn drive(&self, ctx: &mut PipelineContext, budget: Duration) -> Result<()> {
        let mut remaining = budget;
        while !ctx.state.is_terminal() {
            if ctx.state == PipelineState::Post {
                self.wait_for_schedule(ctx).await;
            }
            let started = tokio::time::Instant::now();
            let next = tokio::time::timeout(remaining, self.execute_stage(ctx))
                .await
                .map_err(|_| {
                    Error::Timeout(format!("pipeline exceeded {}s", budget.as_secs()))
                })??;
            remaining = remaining.saturating_sub(started.elapsed());
            self.transition(ctx, next).await;
        }
        Ok(())
    }

    /// Sleep until `ctx.scheduled_time`, in steps of at most
    /// `max_schedule_wait`, re-checking the schedule after each step.
    async fn wait_for_schedule(&self, ctx: &PipelineContext) {
        let Some(at) = ctx.scheduled_time else {
            return;
        };
        let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if wait.is_zero() {
            return;
        }
        info!(
            task_id = %ctx.task_id,
            wait_secs = wait.as_secs_f64(),
            scheduled_time = %at,
            "Waiting for scheduled time"
        );

        let deadline = tokio::time::Instant::now() + wait;
        let step_cap = self.config.max_schedule_wait.max(Duration::from_secs(1));
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() || Utc::now() >= at {
                break;
            }
            let step = left.min(step_cap);
            debug!(
                task_id = %ctx.task_id,
                step_secs = step.as_secs_f64(),
                left_secs = left.as_secs_f64(),
                "Schedule wait step"
            );
            tokio::time::sleep(step).await;
        }
    }

    /// Run the handler for `ctx.state`, apply its result to `ctx` and
    /// publish the stage event. Returns the state to move to; the caller
    /// performs the transition.
    ///
    /// On error `ctx` is left untouched. The POST handler publishes
    /// right away; the scheduled-time wait happens in the run loop.
    pub async fn execute_stage(&self, ctx: &mut PipelineContext) -> Result<PipelineState> {
        debug!(task_id = %ctx.task_id, state = %ctx.state, "Executing stage");
        let output = match ctx.state {
            PipelineState::Upload => self.upload(ctx).await?,
            PipelineState::Caption => self.caption(ctx).await?,
            PipelineState::Schedule => self.schedule(ctx).await?,
            PipelineState::Post => self.post(ctx).await?,
            PipelineState::Analyze => self.analyze(ctx).await?,
            terminal => {
                return Err(Error::Validation(format!(
                    "pipeline {} is already {}",
                    ctx.task_id, terminal
                )))
            }
        };
        let next = output.next_state();
        let payload = output.apply(ctx);
        self.emit(&payload).await;
        Ok(next)
    }

    async fn with_retry<T, F, Fut>(&self, ctx: &PipelineContext, operation: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.retry
            .retry_with_config(
                &retry_task_id(&ctx.task_id, ctx.state),
                self.config.stage_retry.clone(),
                operation,
            )
            .await
    }

    async fn upload(&self, ctx: &PipelineContext) -> Result<StageOutput> {
        let services = Arc::clone(&self.services);
        let video_ref = ctx.video_ref.clone();
        let metadata = self
            .with_retry(ctx, move || {
                let services = Arc::clone(&services);
                let video_ref = video_ref.clone();
                async move { services.validate_and_extract_metadata(&video_ref).await }
            })
            .await?;

        if let Err(e) = self.cache.cache_video_metadata(&ctx.task_id, &metadata).await {
            warn!(task_id = %ctx.task_id, error = %e, "Failed to cache video metadata");
        }
        Ok(StageOutput::Uploaded(serde_json::to_value(&metadata)?))
    }

    async fn caption(&self, ctx: &PipelineContext) -> Result<StageOutput> {
        match self.cache.get_cached_caption(&ctx.task_id).await {
            Ok(Some(result)) => {
                debug!(task_id = %ctx.task_id, "Caption cache hit");
                return Ok(StageOutput::Captioned {
                    result,
                    cached: true,
                });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(task_id = %ctx.task_id, error = %e, "Caption cache read failed, generating");
            }
        }

        let services = Arc::clone(&self.services);
        let snapshot = ctx.clone();
        let result: CaptionResult = self
            .with_retry(ctx, move || {
                let services = Arc::clone(&services);
                let snapshot = snapshot.clone();
                async move { services.generate_caption(&snapshot).await }
            })
            .await?;

        if let Err(e) = self.cache.cache_caption(&ctx.task_id, &result).await {
            warn!(task_id = %ctx.task_id, error = %e, "Failed to cache caption");
        }
        Ok(StageOutput::Captioned {
            result,
            cached: false,
        })
    }

    async fn schedule(&self, ctx: &PipelineContext) -> Result<StageOutput> {
        let services = Arc::clone(&self.services);
        let snapshot = ctx.clone();
        let scheduled_time: DateTime<Utc> = self
            .with_retry(ctx, move || {
                let services = Arc::clone(&services);
                let snapshot = snapshot.clone();
                async move { services.compute_optimal_time(&snapshot).await }
            })
            .await?;
        Ok(StageOutput::Scheduled(scheduled_time))
    }

    async fn post(&self, ctx: &PipelineContext) -> Result<StageOutput> {
        let services = Arc::clone(&self.services);
        let snapshot = ctx.clone();
        let result: PublishResult = self
            .with_retry(ctx, move || {
                let services = Arc::clone(&services);
                let snapshot = snapshot.clone();
                async move { services.publish_to_platforms(&snapshot).await }
            })
            .await?;
        Ok(StageOutput::Posted(result))
    }

    async fn analyze(&self, ctx: &PipelineContext) -> Result<StageOutput> {
        let post_id = ctx.post_id.clone().ok_or_else(|| {
            Error::Internal(format!(
                "pipeline {} reached ANALYZE without a post id",
                ctx.task_id
            ))
        })?;

        let services = Arc::clone(&self.services);
        let id = post_id.clone();
        let analytics: AnalyticsRecord = self
            .with_retry(ctx, move || {
                let services = Arc::clone(&services);
                let id = id.clone();
                async move { services.collect_analytics(&id).await }
            })
            .await?;

        if let Err(e) = self.cache.cache_analytics(&post_id, &analytics).await {
            warn!(task_id = %ctx.task_id, error = %e, "Failed to cache analytics");
        }
        let value = serde_json::to_value(&analytics)?;

        let mut learning = ctx.clone();
        learning.analytics = Some(value.clone());
        if let Err(e) = self.services.store_analytics(&learning).await {
            warn!(task_id = %ctx.task_id, error = %e, "Failed to store analytics for learning");
        }
        Ok(StageOutput::Analyzed(value))
    }

    async fn transition(&self, ctx: &mut PipelineContext, to: PipelineState) {
        let from = ctx.state;
        ctx.state = to;
        ctx.touch();
        if let Some(mut active) = self.active.get_mut(&ctx.task_id) {
            active.status = PipelineStatus::from(&*ctx);
        }

        info!(task_id = %ctx.task_id, from = %from, to = %to, "Pipeline state changed");
        self.emit(&EventPayload::PipelineStateChanged {
            task_id: ctx.task_id.clone(),
            user_id: ctx.user_id.clone(),
            from_state: from,
            to_state: to,
            timestamp: ctx.updated_at,
        })
        .await;
    }

    async fn complete(&self, ctx: PipelineContext, completion_time: f64) {
        let outcome = PipelineOutcome {
            task_id: ctx.task_id.clone(),
            user_id: ctx.user_id.clone(),
            state: PipelineState::Completed,
            last_state: PipelineState::Analyze,
            error: None,
            error_kind: None,
            completion_time: Some(completion_time),
            post_id: ctx.post_id.clone(),
            caption: ctx.caption.clone(),
            created_at: ctx.created_at,
            finished_at: ctx.updated_at,
        };
        self.release(&ctx.task_id);
        {
            let mut history = self.lock_history();
            history.metrics.total_completed += 1;
            let n = history.metrics.total_completed as f64;
            let avg = history.metrics.avg_completion_time;
            history.metrics.avg_completion_time = avg + (completion_time - avg) / n;
            history.record(outcome, self.config.outcome_history);
        }

        info!(task_id = %ctx.task_id, completion_time, "Pipeline completed");
        self.emit(&EventPayload::PipelineCompleted {
            task_id: ctx.task_id,
            user_id: ctx.user_id,
            completion_time,
            post_id: ctx.post_id,
        })
        .await;
    }

    async fn fail(&self, mut ctx: PipelineContext, err: Error) {
        let last_state = ctx.state;
        if matches!(err, Error::Cancelled(_) | Error::Timeout(_)) {
            // The stage future was dropped; stop its retry task too.
            self.retry
                .cancel_task(&retry_task_id(&ctx.task_id, last_state));
        }
        error!(
            task_id = %ctx.task_id,
            last_state = %last_state,
            error = %err,
            "Pipeline failed"
        );
        self.transition(&mut ctx, PipelineState::Failed).await;

        let outcome = PipelineOutcome {
            task_id: ctx.task_id.clone(),
            user_id: ctx.user_id.clone(),
            state: PipelineState::Failed,
            last_state,
            error: Some(err.to_string()),
            error_kind: Some(err.kind().to_string()),
            completion_time: None,
            post_id: ctx.post_id.clone(),
            caption: ctx.caption.clone(),
            created_at: ctx.created_at,
            finished_at: ctx.updated_at,
        };
        self.release(&ctx.task_id);
        {
            let mut history = self.lock_history();
            history.metrics.total_failed += 1;
            history.record(outcome, self.config.outcome_history);
        }

        self.emit(&EventPayload::PipelineFailed {
            task_id: ctx.task_id,
            user_id: ctx.user_id,
            last_state,
            error: err.to_string(),
            error_kind: err.kind().to_string(),
        })
        .await;
    }

    async fn emit(&self, payload: &EventPayload) {
        if let Err(e) = self.event_bus.publish_payload(payload, EVENT_SOURCE).await {
            warn!(error = %e, event_type = payload.event_type(), "Failed to publish pipeline event");
        }
    }

    /// Drive an active pipeline to FAILED. Returns false if it is not active.
    pub fn cancel_pipeline(&self, task_id: &str) -> bool {
        let token = self.active.get(task_id).map(|a| a.cancel.clone());
        match token {
            Some(token) => {
                token.cancel();
                info!(task_id = %task_id, "Pipeline cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Status of an active pipeline.
    ///
    /// Terminal pipelines are reported by
    /// [`get_pipeline_outcome`](Self::get_pipeline_outcome).
    pub fn get_pipeline_status(&self, task_id: &str) -> Result<PipelineStatus> {
        self.active
            .get(task_id)
            .map(|a| a.status.clone())
            .ok_or_else(|| Error::NotFound(format!("pipeline {}", task_id)))
    }

    /// Snapshots of every active pipeline
    #[must_use]
    pub fn active_pipelines(&self) -> Vec<PipelineStatus> {
        self.active.iter().map(|a| a.status.clone()).collect()
    }

    /// Most recent terminal outcome for `task_id`.
    pub fn get_pipeline_outcome(&self, task_id: &str) -> Result<PipelineOutcome> {
        self.lock_history()
            .outcomes
            .iter()
            .rev()
            .find(|o| o.task_id == task_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("pipeline outcome {}", task_id)))
    }

    /// Current counters
    #[must_use]
    pub fn get_metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            active_pipelines: self.active.len(),
            ..self.lock_history().metrics.clone()
        }
    }
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("config", &self.config)
            .field("services", &self.services.name())
            .field("active", &self.active.len())
            .finish()
    }
}
