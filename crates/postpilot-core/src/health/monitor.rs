use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::probes::{DefaultProbe, ServiceProbe};
use super::sampler::{SysinfoSampler, SystemSampler};
use super::types::{
    AlertLevel, HealthReport, HealthStatus, ResourceThresholds, ServiceCheck, ServiceHealth,
    SystemMetrics,
};
use crate::error::{Error, Result};
use crate::event_bus::{EventBus, EventPayload};

const SOURCE: &str = "health_monitor";

/// Recovery action run by self-healing. Receives the service's current record.
pub type RecoveryFn = Arc<dyn Fn(ServiceHealth) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct RecoveryAction {
    name: String,
    action: RecoveryFn,
}

/// Health monitor configuration
#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    /// Time between monitoring cycles
    pub check_interval: Duration,
    /// Timeout for services registered without one
    pub default_timeout: Duration,
    /// Failed checks in a row that make a service CRITICAL
    pub max_consecutive_failures: u32,
    /// Successful checks at least this slow are DEGRADED
    pub response_time_degraded: Duration,
    /// Successful checks at least this slow are CRITICAL
    pub response_time_critical: Duration,
    /// CPU, memory and disk alert thresholds
    pub resources: ResourceThresholds,
    /// Pause between a recovery action and the re-check
    pub recovery_wait: Duration,
    /// Resource samples kept
    pub history_size: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
            default_timeout: Duration::from_secs(5),
            max_consecutive_failures: 3,
            response_time_degraded: Duration::from_secs(5),
            response_time_critical: Duration::from_secs(15),
            resources: ResourceThresholds::default(),
            recovery_wait: Duration::from_secs(10),
            history_size: 100,
        }
    }
}

impl HealthConfig {
    /// Set the cycle interval
    #[must_use]
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Set the default per-check timeout
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the consecutive-failure threshold
    #[must_use]
    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures.max(1);
        self
    }

    /// Set the response time thresholds
    #[must_use]
    pub fn with_response_thresholds(mut self, degraded: Duration, critical: Duration) -> Self {
        self.response_time_degraded = degraded;
        self.response_time_critical = critical;
        self
    }

    /// Set resource thresholds
    #[must_use]
    pub fn with_resource_thresholds(mut self, thresholds: ResourceThresholds) -> Self {
        self.resources = thresholds;
        self
    }

    /// Set the wait between a recovery action and its re-check
    #[must_use]
    pub fn with_recovery_wait(mut self, wait: Duration) -> Self {
        self.recovery_wait = wait;
        self
    }

    /// Set the resource history size
    #[must_use]
    pub fn with_history_size(mut self, size: usize) -> Self {
        self.history_size = size.max(1);
        self
    }
}

struct CheckOutcome {
    old_status: HealthStatus,
    new_status: HealthStatus,
    failure: Option<(String, u32)>,
}

/// Periodic service heartbeat checker with resource sampling and self-healing.
///
/// Every cycle checks all registered services concurrently, samples system
/// resources, runs recovery actions for UNHEALTHY/CRITICAL services and
/// publishes a `system.health_check` summary. Registry reads never wait on a
/// running check.
pub struct HealthMonitor {
    config: HealthConfig,
    event_bus: Arc<EventBus>,
    probe: Arc<dyn ServiceProbe>,
    sampler: Arc<dyn SystemSampler>,
    services: RwLock<BTreeMap<String, ServiceHealth>>,
    custom_probes: RwLock<HashMap<String, Arc<dyn ServiceProbe>>>,
    recovery_actions: RwLock<HashMap<String, Vec<RecoveryAction>>>,
    history: Mutex<VecDeque<SystemMetrics>>,
    running: AtomicBool,
}

impl HealthMonitor {
    /// Create a monitor with explicit probe and sampler.
    #[must_use]
    pub fn new(
        config: HealthConfig,
        event_bus: Arc<EventBus>,
        probe: Arc<dyn ServiceProbe>,
        sampler: Arc<dyn SystemSampler>,
    ) -> Self {
        Self {
            config,
            event_bus,
            probe,
            sampler,
            services: RwLock::new(BTreeMap::new()),
            custom_probes: RwLock::new(HashMap::new()),
            recovery_actions: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Create a monitor using HTTP/Redis/TCP probes and `sysinfo` sampling.
    pub fn with_defaults(config: HealthConfig, event_bus: Arc<EventBus>) -> Result<Self> {
        Ok(Self::new(
            config,
            event_bus,
            Arc::new(DefaultProbe::new()?),
            Arc::new(SysinfoSampler::new()),
        ))
    }

    /// Monitor configuration
    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Add a service to the watch list, replacing any previous registration.
    pub fn register_service(
        &self,
        name: impl Into<String>,
        check: ServiceCheck,
        timeout: Option<Duration>,
    ) {
        let name = name.into();
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        info!(
            service = %name,
            check = check.kind(),
            endpoint = check.endpoint(),
            "Registered service for monitoring"
        );
        self.write_services()
            .insert(name.clone(), ServiceHealth::new(name, check, timeout));
    }

    /// Register a service checked by its own probe.
    pub fn register_probe(
        &self,
        name: impl Into<String>,
        probe: Arc<dyn ServiceProbe>,
        timeout: Option<Duration>,
    ) {
        let name = name.into();
        self.custom_probes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.clone(), probe);
        self.register_service(name.clone(), ServiceCheck::Custom(name), timeout);
    }

    /// Remove a service and its probe. Returns false if it was not registered.
    pub fn unregister_service(&self, name: &str) -> bool {
        self.custom_probes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        let removed = self.write_services().remove(name).is_some();
        if removed {
            info!(service = %name, "Unregistered service from monitoring");
        }
        removed
    }

    /// Append a recovery action for `service`. Actions run in registration order.
    pub fn register_recovery_action(
        &self,
        service: impl Into<String>,
        name: impl Into<String>,
        action: RecoveryFn,
    ) {
        let service = service.into();
        let name = name.into();
        info!(service = %service, action = %name, "Registered recovery action");
        self.recovery_actions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(service)
            .or_default()
            .push(RecoveryAction { name, action });
    }

    /// Spawn the monitoring loop. It runs a cycle immediately, then every
    /// `check_interval`, until `shutdown` fires.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Health monitor already running");
            return;
        }
        let monitor = Arc::clone(self);
        info!(
            interval_secs = self.config.check_interval.as_secs(),
            "Health monitor started"
        );
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = monitor.run_cycle() => {}
                    _ = shutdown.cancelled() => break,
                }
                tokio::select! {
                    _ = tokio::time::sleep(monitor.config.check_interval) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
            monitor.running.store(false, Ordering::SeqCst);
            info!("Health monitor stopped");
        });
    }

    /// Whether the monitoring loop is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One monitoring cycle: service checks, resource sample, self-healing,
    /// summary event.
    pub async fn run_cycle(&self) {
        let names: Vec<String> = self.read_services().keys().cloned().collect();
        join_all(names.iter().map(|name| async move {
            if let Err(e) = self.check_service(name).await {
                debug!(service = %name, error = %e, "Skipped health check");
            }
        }))
        .await;

        let metrics = self.sample_system();
        self.check_resource_thresholds(&metrics).await;

        self.perform_self_healing().await;
        self.publish_health_status().await;
    }

    /// Check one service now and apply the result.
    ///
    /// Returns the service's new status, or `NotFound` for an unknown name.
    pub async fn check_service(&self, name: &str) -> Result<HealthStatus> {
        let (check, timeout) = {
            let services = self.read_services();
            let service = services
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("service {}", name)))?;
            (service.check.clone(), service.timeout)
        };
        let probe = self
            .custom_probes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.probe));

        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, probe.check(name, &check, timeout)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "health check exceeded {:.1}s",
                timeout.as_secs_f64()
            ))),
        };
        let elapsed = started.elapsed();

        let outcome = {
            let mut services = self.write_services();
            let service = services
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("service {}", name)))?;
            self.apply_check(service, result, elapsed)
        };

        if let Some((error, consecutive_failures)) = outcome.failure {
            warn!(
                service = %name,
                error = %error,
                consecutive_failures,
                "Service health check failed"
            );
            self.publish(EventPayload::ServiceDown {
                service: name.to_string(),
                error,
                consecutive_failures,
            })
            .await;
        }

        if outcome.new_status != outcome.old_status {
            info!(
                service = %name,
                old_status = %outcome.old_status,
                new_status = %outcome.new_status,
                "Service status changed"
            );
            self.publish(EventPayload::ServiceStatusChanged {
                service: name.to_string(),
                old_status: outcome.old_status,
                new_status: outcome.new_status,
                timestamp: Utc::now(),
            })
            .await;
        }

        Ok(outcome.new_status)
    }

    fn apply_check(
        &self,
        service: &mut ServiceHealth,
        result: Result<()>,
        elapsed: Duration,
    ) -> CheckOutcome {
        let old_status = service.status;
        service.last_check = Some(Utc::now());
        service.response_time = elapsed.as_secs_f64();
        service.total_checks += 1;

        let failure = match result {
            Ok(()) => {
                service.successful_checks += 1;
                service.consecutive_failures = 0;
                service.error_message = None;
                service.status = if elapsed >= self.config.response_time_critical {
                    HealthStatus::Critical
                } else if elapsed >= self.config.response_time_degraded {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                };
                None
            }
            Err(e) => {
                let message = e.to_string();
                service.consecutive_failures += 1;
                service.error_message = Some(message.clone());
                service.status = self.failure_status(service);
                Some((message, service.consecutive_failures))
            }
        };

        CheckOutcome {
            old_status,
            new_status: service.status,
            failure,
        }
    }

    fn failure_status(&self, service: &ServiceHealth) -> HealthStatus {
        if service.consecutive_failures >= self.config.max_consecutive_failures {
            return HealthStatus::Critical;
        }
        let rate = service.success_rate();
        if rate < 0.5 {
            HealthStatus::Unhealthy
        } else if rate < 0.8 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    fn sample_system(&self) -> SystemMetrics {
        let metrics = self.sampler.sample();
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(metrics.clone());
        while history.len() > self.config.history_size {
            history.pop_front();
        }
        metrics
    }

    async fn check_resource_thresholds(&self, metrics: &SystemMetrics) {
        for (resource, level, value, threshold) in self.config.resources.evaluate(metrics) {
            warn!(
                resource,
                level = %level,
                value,
                threshold,
                "Resource threshold exceeded"
            );
            self.publish(EventPayload::ResourceAlert {
                resource: resource.to_string(),
                level,
                value,
                threshold,
                timestamp: metrics.timestamp,
            })
            .await;
        }
    }

    async fn perform_self_healing(&self) {
        let candidates: Vec<ServiceHealth> = self
            .read_services()
            .values()
            .filter(|s| s.status.needs_recovery())
            .cloned()
            .collect();

        for service in candidates {
            let actions: Vec<(String, RecoveryFn)> = self
                .recovery_actions
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&service.name)
                .map(|actions| {
                    actions
                        .iter()
                        .map(|a| (a.name.clone(), Arc::clone(&a.action)))
                        .collect()
                })
                .unwrap_or_default();
            if actions.is_empty() {
                continue;
            }

            info!(service = %service.name, status = %service.status, "Attempting self-healing");
            for (action_name, action) in actions {
                let current = self.get_service_health(&service.name).unwrap_or_else(|| service.clone());
                if let Err(e) = action(current).await {
                    error!(
                        service = %service.name,
                        action = %action_name,
                        error = %e,
                        "Recovery action failed"
                    );
                    continue;
                }

                tokio::time::sleep(self.config.recovery_wait).await;

                match self.check_service(&service.name).await {
                    Ok(HealthStatus::Healthy) => {
                        info!(service = %service.name, action = %action_name, "Self-healing successful");
                        self.publish(EventPayload::ServiceRecovered {
                            service: service.name.clone(),
                            action: action_name,
                            timestamp: Utc::now(),
                        })
                        .await;
                        break;
                    }
                    Ok(status) => {
                        debug!(service = %service.name, status = %status, "Service not yet recovered");
                    }
                    Err(_) => break,
                }
            }
        }
    }

    async fn publish_health_status(&self) {
        let report = self.get_health_status();
        self.publish(EventPayload::HealthCheck {
            overall_status: report.overall_status,
            services: report.services,
            system: report.system,
            timestamp: Utc::now(),
        })
        .await;
    }

    async fn publish(&self, payload: EventPayload) {
        if let Err(e) = self.event_bus.publish_payload(&payload, SOURCE).await {
            warn!(event_type = payload.event_type(), error = %e, "Failed to publish health event");
        }
    }

    /// Worst status across all services; HEALTHY with none registered.
    #[must_use]
    pub fn overall_status(&self) -> HealthStatus {
        self.read_services()
            .values()
            .map(|s| s.status)
            .max()
            .unwrap_or_default()
    }

    /// Latest resource sample
    #[must_use]
    pub fn latest_system_metrics(&self) -> Option<SystemMetrics> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .back()
            .cloned()
    }

    /// Retained resource samples, oldest first
    #[must_use]
    pub fn system_history(&self) -> Vec<SystemMetrics> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Worst resource alert level of the latest sample
    #[must_use]
    pub fn resource_pressure(&self) -> Option<AlertLevel> {
        self.latest_system_metrics()
            .and_then(|m| m.alert_level(&self.config.resources))
    }

    /// Overall status, per-service health and the latest resource sample.
    #[must_use]
    pub fn get_health_status(&self) -> HealthReport {
        let services = self.read_services().clone();
        let system = self.latest_system_metrics();
        let last_system_check: Option<DateTime<Utc>> = system.as_ref().map(|m| m.timestamp);
        HealthReport {
            overall_status: services
                .values()
                .map(|s| s.status)
                .max()
                .unwrap_or_default(),
            services,
            system,
            monitoring_active: self.is_running(),
            check_interval_secs: self.config.check_interval.as_secs(),
            last_system_check,
        }
    }

    /// Health record of one service
    #[must_use]
    pub fn get_service_health(&self, name: &str) -> Option<ServiceHealth> {
        self.read_services().get(name).cloned()
    }

    fn read_services(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, ServiceHealth>> {
        self.services.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_services(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, ServiceHealth>> {
        self.services.write().unwrap_or_else(|e| e.into_inner())
    }
}
