//! Host probing: RAM, core counts and live memory pressure.

use crate::error::ProbeError;
use parking_lot::Mutex;
use sysinfo::System;

/// Static facts about the machine, sampled once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostStats {
    pub total_memory_bytes: u64,
    pub physical_cores: usize,
    pub logical_cores: usize,
}

impl HostStats {
    /// Total RAM in GiB.
    pub fn total_memory_gb(&self) -> f64 {
        self.total_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

/// Source of host facts and memory pressure.
///
/// Shared between the loader's health check and in-process decoder workers.
pub trait SystemProbe: Send + Sync {
    fn host_stats(&self) -> Result<HostStats, ProbeError>;

    /// Used physical memory as a percentage of total (0.0 - 100.0).
    fn memory_percent(&self) -> f64;
}

/// Probe backed by `sysinfo` and `num_cpus`.
pub struct SysinfoProbe {
    sys: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn host_stats(&self) -> Result<HostStats, ProbeError> {
        let mut sys = self.sys.lock();
        sys.refresh_memory();

        let total_memory_bytes = sys.total_memory();
        if total_memory_bytes == 0 {
            return Err(ProbeError::NoMemoryInfo);
        }

        let logical_cores = num_cpus::get();
        let physical_cores = num_cpus::get_physical();
        if logical_cores == 0 || physical_cores == 0 {
            return Err(ProbeError::NoCoreInfo(format!(
                "logical={logical_cores} physical={physical_cores}"
            )));
        }

        Ok(HostStats {
            total_memory_bytes,
            physical_cores,
            logical_cores,
        })
    }

    fn memory_percent(&self) -> f64 {
        let mut sys = self.sys.lock();
        sys.refresh_memory();

        let total = sys.total_memory();
        if total == 0 {
            return 0.0;
        }
        sys.used_memory() as f64 / total as f64 * 100.0
    }
}

/// Probe returning preset values; memory percent can be changed at runtime.
pub struct FixedProbe {
    stats: Option<HostStats>,
    percent: Mutex<f64>,
}

impl FixedProbe {
    pub fn new(stats: HostStats, memory_percent: f64) -> Self {
        Self {
            stats: Some(stats),
            percent: Mutex::new(memory_percent),
        }
    }

    /// A probe whose host stats always fail.
    pub fn failing(memory_percent: f64) -> Self {
        Self {
            stats: None,
            percent: Mutex::new(memory_percent),
        }
    }

    pub fn set_memory_percent(&self, percent: f64) {
        *self.percent.lock() = percent;
    }
}

impl SystemProbe for FixedProbe {
    fn host_stats(&self) -> Result<HostStats, ProbeError> {
        self.stats.ok_or(ProbeError::NoMemoryInfo)
    }

    fn memory_percent(&self) -> f64 {
        *self.percent.lock()
    }
}
