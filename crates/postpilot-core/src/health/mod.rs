//! Service heartbeats, resource sampling and self-healing
//!
//! [`HealthMonitor`] checks registered services through a [`ServiceProbe`]
//! (HTTP, Redis PING or TCP connect by default), samples CPU, memory and disk
//! through a [`SystemSampler`], and reports status changes, failures and
//! resource alerts on the event bus.

mod monitor;
mod probes;
mod sampler;
mod types;

pub use monitor::{HealthConfig, HealthMonitor, RecoveryFn};
pub use probes::{DefaultProbe, ServiceProbe};
pub use sampler::{SysinfoSampler, SystemSampler};
pub use types::{
    AlertLevel, HealthReport, HealthStatus, ResourceThresholds, ServiceCheck, ServiceHealth,
    SystemMetrics, Threshold,
};

#[cfg(test)]
pub(crate) use probes::MockServiceProbe;
#[cfg(test)]
pub(crate) use sampler::MockSystemSampler;

#[cfg(test)]
mod tests;
