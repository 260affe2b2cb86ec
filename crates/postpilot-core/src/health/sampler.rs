use std::sync::Mutex;

use chrono::Utc;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};

use super::types::SystemMetrics;

/// Source of CPU, memory and disk usage samples.
#[cfg_attr(test, mockall::automock)]
pub trait SystemSampler: Send + Sync {
    /// Take one sample.
    fn sample(&self) -> SystemMetrics;
}

/// [`SystemSampler`] backed by `sysinfo`.
///
/// CPU usage is measured between consecutive refreshes, so the first sample
/// after construction may read low.
pub struct SysinfoSampler {
    system: Mutex<System>,
    disks: Mutex<Disks>,
}

impl SysinfoSampler {
    /// Create a sampler and take the baseline CPU reading
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_with_specifics(
                RefreshKind::nothing()
                    .with_cpu(CpuRefreshKind::everything())
                    .with_memory(MemoryRefreshKind::everything()),
            )),
            disks: Mutex::new(Disks::new_with_refreshed_list()),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

impl SystemSampler for SysinfoSampler {
    fn sample(&self) -> SystemMetrics {
        let (cpu_percent, memory_percent) = {
            let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
            system.refresh_cpu_all();
            system.refresh_memory();
            (
                f64::from(system.global_cpu_usage()),
                percent(system.used_memory(), system.total_memory()),
            )
        };

        let disk_usage_percent = {
            let mut disks = self.disks.lock().unwrap_or_else(|e| e.into_inner());
            disks.refresh(true);
            disks
                .list()
                .iter()
                .map(|disk| {
                    let total = disk.total_space();
                    percent(total.saturating_sub(disk.available_space()), total)
                })
                .fold(0.0_f64, f64::max)
        };

        SystemMetrics {
            cpu_percent,
            memory_percent,
            disk_usage_percent,
            timestamp: Utc::now(),
        }
    }
}
