//! Host resource sampling for admission control and status reporting
//!
//! Samples CPU, memory and disk utilization through sysinfo. Every figure is
//! optional: a measurement the host cannot provide is reported as `None`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::{Disks, System};

/// Point-in-time host utilization, in percent
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: Option<f32>,
    pub memory_percent: Option<f32>,
    /// Usage of the volume that hosts the sampled path
    pub disk_percent: Option<f32>,
}

/// Source of resource samples; the admission gate depends on this seam only.
pub trait ResourceProbe: Send + Sync {
    /// Sample host utilization; `disk_path` selects the volume to measure.
    fn sample(&self, disk_path: &Path) -> ResourceSample;
}

/// [`ResourceProbe`] backed by sysinfo.
///
/// The `System` is kept between calls because CPU usage is computed from the
/// delta of two refreshes; the very first sample may read low.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&self, disk_path: &Path) -> ResourceSample {
        let (cpu_percent, memory_percent) = {
            let mut sys = self.system.lock();
            sys.refresh_cpu_usage();
            sys.refresh_memory();

            let cpu = if sys.cpus().is_empty() {
                None
            } else {
                Some(sys.global_cpu_usage())
            };
            let mem = percent(sys.used_memory(), sys.total_memory());
            (cpu, mem)
        };

        ResourceSample {
            cpu_percent,
            memory_percent,
            disk_percent: disk_usage_percent(disk_path),
        }
    }
}

fn percent(used: u64, total: u64) -> Option<f32> {
    if total == 0 {
        None
    } else {
        Some((used as f64 / total as f64 * 100.0) as f32)
    }
}

/// Usage of the disk whose mount point is the longest prefix of `path`.
pub fn disk_usage_percent(path: &Path) -> Option<f32> {
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())?;

    let total = disk.total_space();
    percent(total.saturating_sub(disk.available_space()), total)
}

/// One-line description of the host, e.g. `Ubuntu 24.04 (x86_64)`.
pub fn system_info() -> String {
    let name = System::name().unwrap_or_else(|| std::env::consts::OS.to_string());
    match System::os_version() {
        Some(version) => format!("{} {} ({})", name, version, std::env::consts::ARCH),
        None => format!("{} ({})", name, std::env::consts::ARCH),
    }
}
