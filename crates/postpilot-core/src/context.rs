//! Application context
//!
//! Every component is built once here from explicit configuration and
//! handed its dependencies. Nothing in the crate reaches for a global.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::cache::{
    CacheConfig, CacheManager, CacheMetrics, KvStore, MemoryKvStore, RedisKvStore,
};
use crate::collaborators::ContentServices;
use crate::error::Result;
use crate::event_bus::{
    Broker, EventBus, EventBusStats, MemoryBroker, RedisBroker, DEFAULT_SUBSCRIBER_QUEUE,
};
use crate::health::{
    DefaultProbe, HealthConfig, HealthMonitor, HealthReport, ServiceCheck, ServiceProbe,
    SysinfoSampler, SystemSampler,
};
use crate::pipeline::{PipelineConfig, PipelineEngine, PipelineMetrics};
use crate::retry::{RetryManager, RetryManagerConfig, RetryMetrics};
use crate::shutdown::ShutdownController;
use crate::websocket::{ConnectionStats, WebSocketConfig, WebSocketManager};

/// A service the health monitor watches from startup
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredService {
    /// Service name
    pub name: String,
    /// How to check it
    pub check: ServiceCheck,
    /// Per-check timeout; the monitor default when `None`
    pub timeout: Option<Duration>,
}

/// Everything needed to build an [`AppContext`]
#[derive(Debug, Clone)]
pub struct AppContextConfig {
    /// Redis URL for the broker and cache; in-memory backends when `None`
    pub redis_url: Option<String>,
    /// Cache settings
    pub cache: CacheConfig,
    /// Retry scheduler settings
    pub retry: RetryManagerConfig,
    /// Health monitor settings
    pub health: HealthConfig,
    /// Services watched from startup
    pub monitored_services: Vec<MonitoredService>,
    /// WebSocket fan-out settings
    pub websocket: WebSocketConfig,
    /// Pipeline engine settings
    pub pipeline: PipelineConfig,
    /// How long shutdown waits for running pipelines
    pub drain_timeout: Duration,
    /// Per-subscriber event queue size
    pub event_queue_capacity: usize,
}

impl Default for AppContextConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            cache: CacheConfig::default(),
            retry: RetryManagerConfig::default(),
            health: HealthConfig::default(),
            monitored_services: Vec::new(),
            websocket: WebSocketConfig::default(),
            pipeline: PipelineConfig::default(),
            drain_timeout: Duration::from_secs(30),
            event_queue_capacity: DEFAULT_SUBSCRIBER_QUEUE,
        }
    }
}

/// Aggregated counters returned by [`AppContext::get_metrics`]
#[derive(Debug, Clone, Serialize)]
pub struct SystemMetricsSnapshot {
    /// Snapshot time
    pub timestamp: DateTime<Utc>,
    /// Seconds since the context was built
    pub uptime_secs: i64,
    /// Pipeline counters
    pub pipeline: PipelineMetrics,
    /// Cache counters
    pub cache: CacheMetrics,
    /// Retry counters
    pub retry: RetryMetrics,
    /// Service and resource health
    pub health: HealthReport,
    /// WebSocket connections
    pub websocket: ConnectionStats,
    /// Event bus counters
    pub event_bus: EventBusStats,
}

/// Live components of a running orchestrator
pub struct AppContext {
    /// Event bus
    pub event_bus: Arc<EventBus>,
    /// Cache manager
    pub cache: Arc<CacheManager>,
    /// Retry manager
    pub retry: Arc<RetryManager>,
    /// Health monitor
    pub health: Arc<HealthMonitor>,
    /// WebSocket fan-out
    pub websocket: Arc<WebSocketManager>,
    /// Pipeline engine
    pub pipeline: Arc<PipelineEngine>,
    /// Shutdown coordination
    pub shutdown: Arc<ShutdownController>,
    started_at: DateTime<Utc>,
}

impl AppContext {
    /// Build every component with the default probes and sampler. Nothing
    /// runs until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid Redis URL or if the HTTP probe
    /// client cannot be built.
    pub fn new(config: AppContextConfig, services: Arc<dyn ContentServices>) -> Result<Self> {
        let (broker, store): (Arc<dyn Broker>, Arc<dyn KvStore>) = match &config.redis_url {
            Some(url) => (
                Arc::new(RedisBroker::new(url)?),
                Arc::new(RedisKvStore::new(url)?),
            ),
            None => (
                Arc::new(MemoryBroker::default()),
                Arc::new(MemoryKvStore::new()),
            ),
        };
        Ok(Self::with_backends(
            config,
            services,
            broker,
            store,
            Arc::new(DefaultProbe::new()?),
            Arc::new(SysinfoSampler::new()),
        ))
    }

    /// Build on caller-supplied backends. `config.redis_url` is ignored.
    #[must_use]
    pub fn with_backends(
        config: AppContextConfig,
        services: Arc<dyn ContentServices>,
        broker: Arc<dyn Broker>,
        store: Arc<dyn KvStore>,
        probe: Arc<dyn ServiceProbe>,
        sampler: Arc<dyn SystemSampler>,
    ) -> Self {
        let event_bus =
            Arc::new(EventBus::new(broker).with_queue_capacity(config.event_queue_capacity));
        let shutdown = ShutdownController::with_timeout(config.drain_timeout);
        let cache = Arc::new(CacheManager::new(store, config.cache));
        let retry = Arc::new(
            RetryManager::new(config.retry).with_event_bus(Arc::clone(&event_bus)),
        );

        let health = Arc::new(HealthMonitor::new(
            config.health,
            Arc::clone(&event_bus),
            probe,
            sampler,
        ));
        for service in &config.monitored_services {
            health.register_service(&service.name, service.check.clone(), service.timeout);
        }

        let websocket = Arc::new(WebSocketManager::new(
            config.websocket,
            Arc::clone(&event_bus),
        ));
        let pipeline = Arc::new(
            PipelineEngine::new(
                config.pipeline,
                services,
                Arc::clone(&cache),
                Arc::clone(&retry),
                Arc::clone(&event_bus),
            )
            .with_health_monitor(Arc::clone(&health))
            .with_shutdown(Arc::clone(&shutdown)),
        );

        Self {
            event_bus,
            cache,
            retry,
            health,
            websocket,
            pipeline,
            shutdown,
            started_at: Utc::now(),
        }
    }

    /// Start every background loop under the shutdown controller.
    ///
    /// # Errors
    ///
    /// Fails if the broker subscription cannot be opened.
    pub async fn start(&self) -> Result<()> {
        self.event_bus
            .start_listening(self.shutdown.token())
            .await?;
        self.retry.start(self.shutdown.token());
        self.cache.start_sweeper(self.shutdown.token());
        self.websocket.start(self.shutdown.token());
        self.health.start(self.shutdown.token());
        info!(
            backend = self.cache.store().name(),
            "Orchestrator components started"
        );
        Ok(())
    }

    /// Stop accepting pipelines, drain running ones, and stop every loop.
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");
        if let Some(report) = self.shutdown.shutdown().await {
            info!(
                in_flight = report.in_flight,
                cancelled = report.cancelled,
                "Pipelines drained"
            );
        }
        self.websocket.stop();
        self.event_bus.stop_listening();
    }

    /// Pipeline, cache, retry, health, WebSocket and bus counters.
    #[must_use]
    pub fn get_metrics(&self) -> SystemMetricsSnapshot {
        let now = Utc::now();
        SystemMetricsSnapshot {
            timestamp: now,
            uptime_secs: (now - self.started_at).num_seconds(),
            pipeline: self.pipeline.get_metrics(),
            cache: self.cache.get_metrics(),
            retry: self.retry.get_metrics(),
            health: self.health.get_health_status(),
            websocket: self.websocket.get_connection_stats(),
            event_bus: self.event_bus.stats(),
        }
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("started_at", &self.started_at)
            .field("phase", &self.shutdown.phase())
            .finish()
    }
}
