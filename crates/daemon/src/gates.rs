//! Admission gate checked before a new job is created.
//!
//! Checks run in a fixed order: concurrent job count, CPU, memory, then disk
//! usage of the volume hosting the worker binary. A resource the probe cannot
//! measure is skipped. Samples are point-in-time and nothing is reserved, so a
//! burst of simultaneous admissions may overshoot the ceiling slightly.

use crate::metrics::ResourceProbe;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use transcode_daemon_config::LimitsConfig;

/// Reason a job was refused admission.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AdmissionError {
    #[error("Maximum concurrent jobs reached ({active}/{max})")]
    TooManyJobs { active: usize, max: usize },

    #[error("CPU usage too high: {usage:.1}% (threshold {threshold:.1}%)")]
    CpuBusy { usage: f32, threshold: f32 },

    #[error("Memory usage too high: {usage:.1}% (threshold {threshold:.1}%)")]
    MemoryBusy { usage: f32, threshold: f32 },

    #[error("Disk usage too high: {usage:.1}% (threshold {threshold:.1}%)")]
    DiskFull { usage: f32, threshold: f32 },
}

/// Thresholds used by [`AdmissionGate`].
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionLimits {
    pub max_concurrent_jobs: usize,
    pub cpu_threshold_percent: f32,
    pub memory_threshold_percent: f32,
    pub disk_threshold_percent: f32,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            cpu_threshold_percent: 90.0,
            memory_threshold_percent: 85.0,
            disk_threshold_percent: 90.0,
        }
    }
}

impl From<&LimitsConfig> for AdmissionLimits {
    fn from(cfg: &LimitsConfig) -> Self {
        Self {
            max_concurrent_jobs: cfg.max_concurrent_jobs as usize,
            cpu_threshold_percent: cfg.cpu_threshold_percent,
            memory_threshold_percent: cfg.memory_threshold_percent,
            disk_threshold_percent: cfg.disk_threshold_percent,
        }
    }
}

pub struct AdmissionGate {
    probe: Arc<dyn ResourceProbe>,
    limits: AdmissionLimits,
    /// Disk usage is measured on the volume holding this path.
    disk_path: PathBuf,
}

impl AdmissionGate {
    pub fn new(probe: Arc<dyn ResourceProbe>, limits: AdmissionLimits, disk_path: PathBuf) -> Self {
        Self {
            probe,
            limits,
            disk_path,
        }
    }

    pub fn limits(&self) -> &AdmissionLimits {
        &self.limits
    }

    /// Decide whether a new job may start while `processing` jobs are running.
    ///
    /// The concurrency check runs first and needs no sampling, so a full
    /// registry is rejected without touching the host probe.
    pub fn check(&self, processing: usize) -> Result<(), AdmissionError> {
        if processing >= self.limits.max_concurrent_jobs {
            return Err(AdmissionError::TooManyJobs {
                active: processing,
                max: self.limits.max_concurrent_jobs,
            });
        }

        let sample = self.probe.sample(&self.disk_path);

        if let Some(usage) = sample.cpu_percent {
            if usage > self.limits.cpu_threshold_percent {
                return Err(AdmissionError::CpuBusy {
                    usage,
                    threshold: self.limits.cpu_threshold_percent,
                });
            }
        }

        if let Some(usage) = sample.memory_percent {
            if usage > self.limits.memory_threshold_percent {
                return Err(AdmissionError::MemoryBusy {
                    usage,
                    threshold: self.limits.memory_threshold_percent,
                });
            }
        }

        if let Some(usage) = sample.disk_percent {
            if usage > self.limits.disk_threshold_percent {
                return Err(AdmissionError::DiskFull {
                    usage,
                    threshold: self.limits.disk_threshold_percent,
                });
            }
        }

        Ok(())
    }
}
