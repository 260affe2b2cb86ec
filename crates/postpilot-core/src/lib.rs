//! Postpilot Core - Content Pipeline Orchestration
//!
//! This crate drives each content item through the
//! UPLOAD → CAPTION → SCHEDULE → POST → ANALYZE workflow and provides the
//! infrastructure around it:
//! - EventBus: topic publish/subscribe over a shared broker
//! - Cache: namespaced TTL key/value store with hit/miss metrics
//! - Retry: background retry-with-backoff manager
//! - Health: service heartbeats, resource sampling and self-healing
//! - WebSocket: fan-out of bus events to subscribed clients
//! - Pipeline: the state machine itself
//! - Context: explicit construction and teardown of all of the above

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod collaborators;
pub mod context;
pub mod error;
pub mod event_bus;
pub mod health;
pub mod pipeline;
pub mod retry;
pub mod shutdown;
pub mod websocket;

pub use cache::{CacheConfig, CacheManager, KvStore, MemoryKvStore, Namespace, RedisKvStore};
pub use collaborators::{
    AnalyticsRecord, CaptionResult, ContentServices, HttpContentServices, HttpServicesConfig,
    PublishResult, SimulatedContentServices, VideoMetadata,
};
pub use context::{AppContext, AppContextConfig, MonitoredService, SystemMetricsSnapshot};
pub use error::{Error, Result};
pub use event_bus::{
    Broker, Event, EventBus, EventPayload, MemoryBroker, RedisBroker, SubscriptionId,
    WILDCARD_CHANNEL,
};
pub use health::{
    AlertLevel, HealthConfig, HealthMonitor, HealthReport, HealthStatus, ServiceCheck,
    ServiceHealth, ServiceProbe, SystemMetrics, SystemSampler,
};
pub use pipeline::{
    PipelineConfig, PipelineContext, PipelineEngine, PipelineMetrics, PipelineOutcome,
    PipelineState, PipelineStatus,
};
pub use retry::{RetryConfig, RetryManager, RetryManagerConfig, RetryStrategy, RetryTaskStatus};
pub use shutdown::{DrainReport, PipelineGuard, ShutdownController, ShutdownPhase};
pub use websocket::{
    ClientConnection, ClientMessage, Outbound, ServerMessage, WebSocketConfig, WebSocketManager,
};
