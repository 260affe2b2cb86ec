//! Server configuration types
//!
//! Every section deserializes from a partial file: missing keys take the
//! defaults below, which match `config/default.toml`.

use anyhow::{Context, Result};
use postpilot_core::event_bus::DEFAULT_SUBSCRIBER_QUEUE;
use postpilot_core::health::ResourceThresholds;
use postpilot_core::{
    AppContextConfig, CacheConfig, ContentServices, HealthConfig, HttpContentServices,
    HttpServicesConfig, MonitoredService, PipelineConfig, RetryConfig, RetryManagerConfig,
    RetryStrategy, ServiceCheck, SimulatedContentServices, WebSocketConfig,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub events: EventsSection,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub websocket: WebSocketSection,
    #[serde(default)]
    pub collaborators: CollaboratorsConfig,
}

impl AppConfig {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// Component settings for [`postpilot_core::AppContext`].
    pub fn context_config(&self) -> AppContextConfig {
        AppContextConfig {
            redis_url: self.redis.url.clone().filter(|url| !url.trim().is_empty()),
            cache: self.cache_config(),
            retry: self.retry.manager_config(),
            health: self.health.health_config(),
            monitored_services: self.health.monitored_services(),
            websocket: self.websocket.websocket_config(),
            pipeline: self.pipeline.pipeline_config(),
            drain_timeout: Duration::from_secs(self.server.drain_timeout_secs),
            event_queue_capacity: self.events.subscriber_queue,
        }
    }

    fn cache_config(&self) -> CacheConfig {
        let mut cache = CacheConfig::default()
            .with_default_ttl(Duration::from_secs(self.cache.default_ttl_secs))
            .with_caption_ttl(Duration::from_secs(self.pipeline.caption_ttl_secs))
            .with_video_ttl(Duration::from_secs(self.pipeline.video_ttl_secs))
            .with_analytics_ttl(Duration::from_secs(self.pipeline.analytics_ttl_secs))
            .with_sweep_interval(Duration::from_secs(self.cache.sweep_interval_secs));
        cache.user_preferences_ttl = Duration::from_secs(self.cache.user_preferences_ttl_secs);
        cache
    }

    /// Build the collaborator implementation selected by `collaborators.mode`.
    pub fn content_services(&self) -> Result<Arc<dyn ContentServices>> {
        match self.collaborators.mode {
            CollaboratorMode::Simulated => Ok(Arc::new(SimulatedContentServices::new())),
            CollaboratorMode::Http => {
                let services = HttpContentServices::new(self.collaborators.http_config())
                    .context("Failed to build HTTP collaborators")?;
                Ok(Arc::new(services))
            }
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared API token; empty disables the check
    #[serde(default)]
    pub api_token: String,
    /// How long shutdown waits for running pipelines
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_token: String::new(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_drain_timeout() -> u64 {
    30
}

/// Redis configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisConfig {
    /// In-memory backends when unset
    #[serde(default)]
    pub url: Option<String>,
}

/// Event bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsSection {
    /// Events a subscriber may have queued before new ones are dropped
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            subscriber_queue: default_subscriber_queue(),
        }
    }
}

fn default_subscriber_queue() -> usize {
    DEFAULT_SUBSCRIBER_QUEUE
}

/// Console log format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for daily-rolling JSON log files; console only when unset
    #[serde(default)]
    pub directory: Option<String>,
}

/// Pipeline engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_pipelines: usize,
    #[serde(default = "default_pipeline_timeout")]
    pub pipeline_timeout_secs: u64,
    #[serde(default = "default_max_schedule_wait")]
    pub max_schedule_wait_secs: u64,
    #[serde(default = "default_video_ttl")]
    pub video_ttl_secs: u64,
    #[serde(default = "default_caption_ttl")]
    pub caption_ttl_secs: u64,
    #[serde(default = "default_analytics_ttl")]
    pub analytics_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub throttle_on_resource_alert: bool,
    #[serde(default = "default_history")]
    pub outcome_history: usize,
    #[serde(default)]
    pub stage_retry: RetryPolicySection,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_concurrent_pipelines: default_max_concurrent(),
            pipeline_timeout_secs: default_pipeline_timeout(),
            max_schedule_wait_secs: default_max_schedule_wait(),
            video_ttl_secs: default_video_ttl(),
            caption_ttl_secs: default_caption_ttl(),
            analytics_ttl_secs: default_analytics_ttl(),
            throttle_on_resource_alert: true,
            outcome_history: default_history(),
            stage_retry: RetryPolicySection::default(),
        }
    }
}

impl PipelineSection {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::new()
            .with_max_concurrent_pipelines(self.max_concurrent_pipelines)
            .with_pipeline_timeout(Duration::from_secs(self.pipeline_timeout_secs))
            .with_max_schedule_wait(Duration::from_secs(self.max_schedule_wait_secs))
            .with_stage_retry(self.stage_retry.retry_config())
            .with_throttle_on_resource_alert(self.throttle_on_resource_alert)
            .with_outcome_history(self.outcome_history)
    }
}

fn default_max_concurrent() -> usize {
    10
}
fn default_pipeline_timeout() -> u64 {
    1800
}
fn default_max_schedule_wait() -> u64 {
    300
}
fn default_video_ttl() -> u64 {
    3600
}
fn default_caption_ttl() -> u64 {
    1800
}
fn default_analytics_ttl() -> u64 {
    7200
}
fn default_history() -> usize {
    100
}
fn default_true() -> bool {
    true
}

/// Retry policy applied to each pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicySection {
    #[serde(default = "default_stage_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_strategy")]
    pub strategy: RetryStrategy,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryPolicySection {
    fn default() -> Self {
        Self {
            max_attempts: default_stage_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            strategy: default_strategy(),
            jitter: true,
        }
    }
}

impl RetryPolicySection {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(self.max_attempts)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_backoff_multiplier(self.backoff_multiplier)
            .with_strategy(self.strategy)
            .with_jitter(self.jitter)
    }
}

fn default_stage_attempts() -> u32 {
    5
}
fn default_initial_delay_ms() -> u64 {
    2000
}
fn default_max_delay_ms() -> u64 {
    120_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_strategy() -> RetryStrategy {
    RetryStrategy::ExponentialBackoff
}

/// Retry scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_history")]
    pub completed_history: usize,
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            completed_history: default_history(),
            wait_timeout_secs: default_wait_timeout(),
        }
    }
}

impl RetrySection {
    pub fn manager_config(&self) -> RetryManagerConfig {
        RetryManagerConfig::default()
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_completed_history(self.completed_history)
            .with_wait_timeout(Duration::from_secs(self.wait_timeout_secs))
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_wait_timeout() -> u64 {
    3600
}

/// Cache settings not tied to a pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_preferences_ttl")]
    pub user_preferences_ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_cache_ttl(),
            user_preferences_ttl_secs: default_preferences_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    3600
}
fn default_preferences_ttl() -> u64 {
    86_400
}
fn default_sweep_interval() -> u64 {
    300
}

/// A service watched from startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    /// `http`, `redis`, `database`/`tcp` or `custom`
    #[serde(default = "default_check_type")]
    pub check_type: String,
    pub endpoint: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_check_type() -> String {
    "http".to_string()
}

/// Health monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_check_timeout")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_degraded_secs")]
    pub response_time_degraded_secs: u64,
    #[serde(default = "default_critical_secs")]
    pub response_time_critical_secs: u64,
    #[serde(default = "default_recovery_wait")]
    pub recovery_wait_secs: u64,
    #[serde(default = "default_history")]
    pub history_size: usize,
    #[serde(default)]
    pub thresholds: ResourceThresholds,
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            default_timeout_secs: default_check_timeout(),
            max_consecutive_failures: default_max_failures(),
            response_time_degraded_secs: default_degraded_secs(),
            response_time_critical_secs: default_critical_secs(),
            recovery_wait_secs: default_recovery_wait(),
            history_size: default_history(),
            thresholds: ResourceThresholds::default(),
            services: Vec::new(),
        }
    }
}

impl HealthSection {
    pub fn health_config(&self) -> HealthConfig {
        HealthConfig::default()
            .with_check_interval(Duration::from_secs(self.check_interval_secs))
            .with_default_timeout(Duration::from_secs(self.default_timeout_secs))
            .with_max_consecutive_failures(self.max_consecutive_failures)
            .with_response_thresholds(
                Duration::from_secs(self.response_time_degraded_secs),
                Duration::from_secs(self.response_time_critical_secs),
            )
            .with_resource_thresholds(self.thresholds)
            .with_recovery_wait(Duration::from_secs(self.recovery_wait_secs))
            .with_history_size(self.history_size)
    }

    pub fn monitored_services(&self) -> Vec<MonitoredService> {
        self.services
            .iter()
            .map(|entry| MonitoredService {
                name: entry.name.clone(),
                check: ServiceCheck::from_kind(&entry.check_type, entry.endpoint.clone()),
                timeout: entry.timeout_secs.map(Duration::from_secs),
            })
            .collect()
    }
}

fn default_check_interval() -> u64 {
    300
}
fn default_check_timeout() -> u64 {
    5
}
fn default_max_failures() -> u32 {
    3
}
fn default_degraded_secs() -> u64 {
    5
}
fn default_critical_secs() -> u64 {
    15
}
fn default_recovery_wait() -> u64 {
    10
}

/// WebSocket fan-out settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketSection {
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            auth_timeout_secs: default_auth_timeout(),
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl WebSocketSection {
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .with_auth_timeout(Duration::from_secs(self.auth_timeout_secs))
            .with_liveness(
                Duration::from_secs(self.ping_interval_secs),
                Duration::from_secs(self.pong_timeout_secs),
            )
            .with_channel_capacity(self.channel_capacity)
    }
}

fn default_auth_timeout() -> u64 {
    10
}
fn default_ping_interval() -> u64 {
    60
}
fn default_pong_timeout() -> u64 {
    10
}
fn default_channel_capacity() -> usize {
    256
}

/// Which collaborator implementation drives the pipeline stages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollaboratorMode {
    Http,
    #[default]
    Simulated,
}

/// Collaborator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorsConfig {
    #[serde(default)]
    pub mode: CollaboratorMode,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Default for CollaboratorsConfig {
    fn default() -> Self {
        Self {
            mode: CollaboratorMode::default(),
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            api_token: None,
        }
    }
}

impl CollaboratorsConfig {
    pub fn http_config(&self) -> HttpServicesConfig {
        HttpServicesConfig {
            base_url: self.base_url.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs),
            api_token: self.api_token.clone().filter(|t| !t.is_empty()),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8000/".to_string()
}
fn default_request_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_core_defaults() {
        let config = AppConfig::default();
        let ctx = config.context_config();

        assert!(ctx.redis_url.is_none());
        assert_eq!(ctx.drain_timeout, Duration::from_secs(30));
        assert_eq!(ctx.event_queue_capacity, 1024);
        assert_eq!(ctx.cache, CacheConfig::default());
        assert_eq!(ctx.pipeline.max_concurrent_pipelines, 10);
        assert_eq!(ctx.pipeline.pipeline_timeout, Duration::from_secs(1800));
        assert_eq!(ctx.pipeline.stage_retry, RetryConfig::pipeline_step());
        assert_eq!(ctx.health.check_interval, Duration::from_secs(300));
        assert_eq!(ctx.health.resources, ResourceThresholds::default());
        assert_eq!(ctx.websocket, WebSocketConfig::default());
        assert!(ctx.monitored_services.is_empty());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [pipeline]
            max_concurrent_pipelines = 3

            [pipeline.stage_retry]
            strategy = "linear_backoff"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.pipeline.max_concurrent_pipelines, 3);
        assert_eq!(config.pipeline.caption_ttl_secs, 1800);
        assert_eq!(config.pipeline.stage_retry.strategy, RetryStrategy::LinearBackoff);
        assert_eq!(config.pipeline.stage_retry.max_attempts, 5);
        assert_eq!(config.collaborators.mode, CollaboratorMode::Simulated);
    }

    #[test]
    fn test_health_services_mapping() {
        let config: AppConfig = toml::from_str(
            r#"
            [[health.services]]
            name = "backend"
            endpoint = "http://localhost:8000/health"
            timeout_secs = 2

            [[health.services]]
            name = "db"
            check_type = "database"
            endpoint = "localhost:5432"
            "#,
        )
        .unwrap();

        let services = config.context_config().monitored_services;
        assert_eq!(services.len(), 2);
        assert_eq!(
            services[0].check,
            ServiceCheck::Http("http://localhost:8000/health".to_string())
        );
        assert_eq!(services[0].timeout, Some(Duration::from_secs(2)));
        assert_eq!(services[1].check, ServiceCheck::Tcp("localhost:5432".to_string()));
        assert_eq!(services[1].timeout, None);
    }

    #[test]
    fn test_blank_redis_url_means_memory() {
        let mut config = AppConfig::default();
        config.redis.url = Some("  ".to_string());
        assert!(config.context_config().redis_url.is_none());

        config.redis.url = Some("redis://localhost:6379".to_string());
        assert_eq!(
            config.context_config().redis_url.as_deref(),
            Some("redis://localhost:6379")
        );
    }

    #[test]
    fn test_collaborator_modes() {
        let mut config = AppConfig::default();
        assert_eq!(config.content_services().unwrap().name(), "simulated");

        config.collaborators.mode = CollaboratorMode::Http;
        config.collaborators.api_token = Some(String::new());
        assert!(config.collaborators.http_config().api_token.is_none());
        assert!(config.content_services().is_ok());
    }

    #[test]
    fn test_save_round_trips() {
        let dir = std::env::temp_dir().join(format!("postpilot-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("local.toml");
        let mut config = AppConfig::default();
        config.server.port = 9100;
        config.save(&path).unwrap();

        let loaded: AppConfig = toml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.server.port, 9100);
        fs::remove_dir_all(dir).unwrap();
    }
}
