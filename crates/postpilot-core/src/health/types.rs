use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health status of a monitored service, ordered from best to worst.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Answering within the degraded threshold
    #[default]
    Healthy,
    /// Slow or occasionally failing
    Degraded,
    /// Failing most checks
    Unhealthy,
    /// Failed `max_consecutive_failures` checks in a row, or very slow
    Critical,
}

impl HealthStatus {
    /// Whether self-healing should run for a service in this status.
    #[must_use]
    pub fn needs_recovery(self) -> bool {
        matches!(self, Self::Unhealthy | Self::Critical)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Severity of a resource alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Above the degraded threshold
    Degraded,
    /// Above the critical threshold
    Critical,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// How a service is checked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "endpoint")]
pub enum ServiceCheck {
    /// GET the URL, expect 2xx and, for JSON bodies, `status == "healthy"`
    Http(String),
    /// PING a Redis server
    Redis(String),
    /// Open a TCP connection to `host:port` (databases)
    Tcp(String),
    /// Probe supplied through [`HealthMonitor::register_probe`]
    ///
    /// [`HealthMonitor::register_probe`]: super::HealthMonitor::register_probe
    Custom(String),
}

impl ServiceCheck {
    /// Build from a configured `check_type` name; unknown names fall back to HTTP.
    #[must_use]
    pub fn from_kind(kind: &str, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        match kind {
            "redis" => Self::Redis(endpoint),
            "database" | "tcp" => Self::Tcp(endpoint),
            "custom" => Self::Custom(endpoint),
            _ => Self::Http(endpoint),
        }
    }

    /// Short name of the check type
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Redis(_) => "redis",
            Self::Tcp(_) => "tcp",
            Self::Custom(_) => "custom",
        }
    }

    /// Target of the check
    #[must_use]
    pub fn endpoint(&self) -> &str {
        match self {
            Self::Http(e) | Self::Redis(e) | Self::Tcp(e) | Self::Custom(e) => e,
        }
    }
}

/// Health record of one monitored service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    /// Service name
    pub name: String,
    /// Current status
    pub status: HealthStatus,
    /// Check configuration
    pub check: ServiceCheck,
    /// Per-check timeout
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Time of the last check, `None` before the first one
    pub last_check: Option<DateTime<Utc>>,
    /// Duration of the last check in seconds
    pub response_time: f64,
    /// Error of the last failed check
    pub error_message: Option<String>,
    /// Failed checks in a row
    pub consecutive_failures: u32,
    /// Checks performed
    pub total_checks: u64,
    /// Checks that succeeded
    pub successful_checks: u64,
}

impl ServiceHealth {
    pub(crate) fn new(name: impl Into<String>, check: ServiceCheck, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            check,
            timeout,
            last_check: None,
            response_time: 0.0,
            error_message: None,
            consecutive_failures: 0,
            total_checks: 0,
            successful_checks: 0,
        }
    }

    /// Fraction of checks that succeeded; 1.0 before the first check.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_checks == 0 {
            1.0
        } else {
            self.successful_checks as f64 / self.total_checks as f64
        }
    }
}

/// One resource sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// Global CPU usage, percent
    pub cpu_percent: f64,
    /// Used memory, percent of total
    pub memory_percent: f64,
    /// Usage of the fullest mounted disk, percent
    pub disk_usage_percent: f64,
    /// Sample time
    pub timestamp: DateTime<Utc>,
}

impl SystemMetrics {
    /// Worst alert level across the three resources, if any threshold is crossed.
    #[must_use]
    pub fn alert_level(&self, thresholds: &ResourceThresholds) -> Option<AlertLevel> {
        thresholds
            .evaluate(self)
            .into_iter()
            .map(|(_, level, _, _)| level)
            .max()
    }
}

/// Degraded and critical percentages for one resource
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    /// Degraded at or above this percentage
    pub degraded: f64,
    /// Critical at or above this percentage
    pub critical: f64,
}

impl Threshold {
    /// Create a threshold pair
    #[must_use]
    pub const fn new(degraded: f64, critical: f64) -> Self {
        Self { degraded, critical }
    }

    /// Alert level and crossed threshold for `value`.
    #[must_use]
    pub fn level(&self, value: f64) -> Option<(AlertLevel, f64)> {
        if value >= self.critical {
            Some((AlertLevel::Critical, self.critical))
        } else if value >= self.degraded {
            Some((AlertLevel::Degraded, self.degraded))
        } else {
            None
        }
    }
}

/// Resource alert thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceThresholds {
    /// CPU percent
    pub cpu: Threshold,
    /// Memory percent
    pub memory: Threshold,
    /// Disk percent
    pub disk: Threshold,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu: Threshold::new(70.0, 90.0),
            memory: Threshold::new(80.0, 90.0),
            disk: Threshold::new(85.0, 95.0),
        }
    }
}

impl ResourceThresholds {
    /// Every crossed threshold as `(resource, level, value, threshold)`.
    #[must_use]
    pub fn evaluate(&self, metrics: &SystemMetrics) -> Vec<(&'static str, AlertLevel, f64, f64)> {
        [
            ("cpu", self.cpu, metrics.cpu_percent),
            ("memory", self.memory, metrics.memory_percent),
            ("disk", self.disk, metrics.disk_usage_percent),
        ]
        .into_iter()
        .filter_map(|(resource, threshold, value)| {
            threshold
                .level(value)
                .map(|(level, crossed)| (resource, level, value, crossed))
        })
        .collect()
    }
}

/// Snapshot returned by [`HealthMonitor::get_health_status`]
///
/// [`HealthMonitor::get_health_status`]: super::HealthMonitor::get_health_status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst status across all services
    pub overall_status: HealthStatus,
    /// Per-service health
    pub services: std::collections::BTreeMap<String, ServiceHealth>,
    /// Latest resource sample
    pub system: Option<SystemMetrics>,
    /// Whether the monitoring loop is running
    pub monitoring_active: bool,
    /// Seconds between cycles
    pub check_interval_secs: u64,
    /// Time of the last resource sample
    pub last_system_check: Option<DateTime<Utc>>,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
