//! Daemon startup and background task wiring
//!
//! Builds the transcode service from configuration and runs the API server,
//! watch folders, webhook notifier and retention sweeper until Ctrl+C.

use crate::api_server::run_api_server;
use crate::config::{Config, ConfigError};
use crate::jobs::JobRegistry;
use crate::notify::spawn_notifier;
use crate::service::{ServiceError, TranscodeService};
use crate::watch::spawn_watcher;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Service construction failed (worker binary missing)
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Signal handler error: {0}")]
    Signal(#[from] std::io::Error),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    pub service: Arc<TranscodeService>,
}

impl Daemon {
    /// Load configuration from `config_path` and build the service
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::from_config(config)
    }

    /// Build the daemon from an already loaded configuration
    ///
    /// Fails when the worker binary cannot be located.
    pub fn from_config(config: Config) -> Result<Self, DaemonError> {
        let service = TranscodeService::new(config.clone())?;
        Ok(Self::with_service(config, Arc::new(service)))
    }

    pub fn with_service(config: Config, service: Arc<TranscodeService>) -> Self {
        Self { config, service }
    }

    /// Start the HTTP API server, if enabled
    pub fn start_api_server(&self) -> Option<JoinHandle<()>> {
        if !self.config.server.enabled {
            return None;
        }
        let service = self.service.clone();
        let bind = self.config.server.bind.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_api_server(service, &bind).await {
                error!(bind = %bind, error = %e, "API server stopped");
            }
        }))
    }

    /// Start the watch folder poller, if any folders are configured
    pub fn start_watcher(&self) -> Option<JoinHandle<()>> {
        spawn_watcher(self.service.clone(), self.config.watch.clone())
    }

    /// Start webhook delivery, if a webhook URL is configured
    pub fn start_notifier(&self) -> Option<JoinHandle<()>> {
        spawn_notifier(self.service.registry().clone(), &self.config.notifications)
    }

    /// Start the retention sweeper, if a job TTL is configured
    pub fn start_retention_sweeper(&self) -> Option<JoinHandle<()>> {
        let retention = &self.config.retention;
        if retention.job_ttl_secs == 0 {
            return None;
        }
        let ttl = Duration::from_secs(retention.job_ttl_secs);
        let period = Duration::from_secs(retention.sweep_interval_secs.max(1));
        Some(tokio::spawn(sweep_expired_jobs(
            self.service.registry().clone(),
            ttl,
            period,
        )))
    }

    /// Start every enabled background task
    pub fn start_background_tasks(&self) -> Vec<JoinHandle<()>> {
        [
            self.start_api_server(),
            self.start_watcher(),
            self.start_notifier(),
            self.start_retention_sweeper(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Run until Ctrl+C, then stop background tasks
    pub async fn run(&self) -> Result<(), DaemonError> {
        let handles = self.start_background_tasks();
        info!(
            tasks = handles.len(),
            max_concurrent_jobs = self.config.limits.max_concurrent_jobs,
            "Transcode daemon running"
        );

        let result = tokio::signal::ctrl_c().await;
        info!("Shutting down");
        for handle in handles {
            handle.abort();
        }
        result?;
        Ok(())
    }
}

/// Evict expired terminal jobs every `period`
async fn sweep_expired_jobs(registry: Arc<JobRegistry>, ttl: Duration, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let evicted = registry.evict_expired(ttl).await;
        if evicted > 0 {
            info!(evicted, "Evicted expired jobs");
        }
    }
}
