//! Transcode service facade.
//!
//! The single entry point used by the HTTP API, batch callers and the watch
//! folder. Validation and admission happen synchronously inside
//! [`TranscodeService::transcode`]; everything after the job id is returned
//! runs on a background task and is only observable by polling.

use crate::encode::FALLBACK_PRESETS;
use crate::gates::{AdmissionError, AdmissionGate, AdmissionLimits};
use crate::job_executor::{run_job, JobExecutorConfig};
use crate::jobs::{JobRegistry, JobStatusReport, NewJob, ReportedStatus};
use crate::metrics::{system_info, ResourceProbe, SysinfoProbe};
use crate::options::EncoderOptions;
use crate::sanitize::{sanitize_options, secure_path, SanitizeError};
use crate::size_gate::check_size_gate;
use crate::startup::{locate_worker_binary, query_presets, query_version, WorkerError};
use crate::Config;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Minimum time between preset discovery attempts after a failure
const PRESET_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Errors surfaced synchronously by the facade; no job exists when one is returned.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Input file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(#[from] AdmissionError),

    /// Worker binary missing or unusable; fatal at construction
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(#[from] WorkerError),
}

impl From<SanitizeError> for ServiceError {
    fn from(e: SanitizeError) -> Self {
        ServiceError::Validation(e.to_string())
    }
}

/// One transcode request as accepted from callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeRequest {
    pub input_path: String,
    pub output_path: String,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub options: EncoderOptions,
}

impl TranscodeRequest {
    pub fn new(input_path: impl Into<String>, output_path: impl Into<String>) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
            preset: None,
            options: EncoderOptions::new(),
        }
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = Some(preset.into());
        self
    }
}

/// Per-item result of [`TranscodeService::batch_transcode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub job_id: String,
    pub status: ReportedStatus,
    pub input_path: String,
    pub output_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderState {
    Ready,
    Error,
}

/// Aggregated service health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub status: ProviderState,
    pub version: String,
    pub worker_version: Option<String>,
    pub supported_presets: Vec<String>,
    pub system_info: String,
    pub max_concurrent_jobs: usize,
    pub active_jobs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct TranscodeService {
    config: Config,
    registry: Arc<JobRegistry>,
    gate: AdmissionGate,
    executor: JobExecutorConfig,
    presets: OnceCell<Vec<String>>,
    /// When preset discovery last failed
    preset_failure: parking_lot::Mutex<Option<Instant>>,
    worker_version: OnceCell<String>,
}

impl TranscodeService {
    /// Build the service, locating the worker binary.
    ///
    /// A missing binary is fatal: [`ServiceError::WorkerUnavailable`].
    pub fn new(config: Config) -> Result<Self, ServiceError> {
        let binary = locate_worker_binary(&config.worker.binary)?;
        info!(binary = %binary.display(), "Worker binary located");
        Ok(Self::with_probe(config, binary, Arc::new(SysinfoProbe::new())))
    }

    /// Build the service around an already resolved binary and a resource probe.
    pub fn with_probe(config: Config, binary: PathBuf, probe: Arc<dyn ResourceProbe>) -> Self {
        let gate = AdmissionGate::new(probe, AdmissionLimits::from(&config.limits), binary.clone());
        let executor = JobExecutorConfig::new(
            binary,
            Duration::from_secs(config.limits.cancel_grace_secs),
        );

        Self {
            config,
            registry: Arc::new(JobRegistry::new()),
            gate,
            executor,
            presets: OnceCell::new(),
            preset_failure: parking_lot::Mutex::new(None),
            worker_version: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Validate, admit and start a transcode job.
    ///
    /// Steps, in order: input path and existence, output path, input size,
    /// preset, options, admission. The job id is returned as soon as the job
    /// is queued; the worker runs on a background task.
    pub async fn transcode(&self, request: TranscodeRequest) -> Result<String, ServiceError> {
        let input_path = secure_path(&request.input_path)?;
        let metadata = match tokio::fs::metadata(&input_path).await {
            Ok(m) => m,
            Err(_) => return Err(ServiceError::FileNotFound(input_path)),
        };
        if !metadata.is_file() {
            return Err(ServiceError::Validation(format!(
                "Input path is not a file: {}",
                input_path.display()
            )));
        }

        let output_path = secure_path(&request.output_path)?;
        if output_path == input_path {
            return Err(ServiceError::Validation(
                "Output path must differ from input path".to_string(),
            ));
        }

        let limits = &self.config.limits;
        let size = check_size_gate(
            metadata.len(),
            limits.min_file_size_bytes,
            limits.max_file_size_bytes,
        );
        if let Some(reason) = size.reason() {
            return Err(ServiceError::Validation(reason));
        }

        let preset = request
            .preset
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.config.worker.default_preset.clone());
        self.validate_preset(&preset).await?;

        let options = sanitize_options(&request.options);

        let processing = self.registry.processing_count().await;
        self.gate.check(processing)?;

        let entry = self
            .registry
            .insert(NewJob {
                input_path,
                output_path,
                preset,
                options,
            })
            .await;

        tokio::spawn(run_job(entry.clone(), self.executor.clone()));
        Ok(entry.id.clone())
    }

    /// Submit several requests one after another.
    ///
    /// A failing item becomes an `error_<index>` entry with status `failed`;
    /// later items are still submitted.
    pub async fn batch_transcode(
        &self,
        items: Vec<TranscodeRequest>,
        default_preset: Option<String>,
    ) -> Vec<BatchResult> {
        let mut results = Vec::with_capacity(items.len());

        for mut item in items {
            if item.preset.is_none() {
                item.preset = default_preset.clone();
            }
            let input_path = item.input_path.clone();
            let output_path = item.output_path.clone();

            let result = match self.transcode(item).await {
                Ok(job_id) => BatchResult {
                    job_id,
                    status: ReportedStatus::Queued,
                    input_path,
                    output_path,
                    error: None,
                },
                Err(e) => {
                    warn!(input = %input_path, error = %e, "Batch item rejected");
                    BatchResult {
                        job_id: format!("error_{}", results.len()),
                        status: ReportedStatus::Failed,
                        input_path,
                        output_path,
                        error: Some(e.to_string()),
                    }
                }
            };
            results.push(result);
        }

        results
    }

    pub async fn get_job_status(&self, job_id: &str) -> JobStatusReport {
        match self.registry.get(job_id).await {
            Some(entry) => entry.snapshot().into(),
            None => JobStatusReport::not_found(job_id),
        }
    }

    pub async fn cancel_job(&self, job_id: &str) -> bool {
        self.registry.cancel(job_id).await
    }

    pub async fn list_jobs(&self) -> Vec<JobStatusReport> {
        self.registry
            .list()
            .await
            .into_iter()
            .map(JobStatusReport::from)
            .collect()
    }

    /// Preset names known to the worker.
    ///
    /// The first successful discovery is cached. When discovery fails the
    /// fallback list is returned and discovery is not retried for
    /// [`PRESET_RETRY_INTERVAL`].
    pub async fn get_presets(&self) -> Vec<String> {
        match self.discovered_presets().await {
            Some(presets) => presets,
            None => FALLBACK_PRESETS.iter().map(|s| s.to_string()).collect(),
        }
    }

    async fn discovered_presets(&self) -> Option<Vec<String>> {
        if let Some(presets) = self.presets.get() {
            return Some(presets.clone());
        }

        let recently_failed = self
            .preset_failure
            .lock()
            .is_some_and(|at| at.elapsed() < PRESET_RETRY_INTERVAL);
        if recently_failed {
            return None;
        }

        match query_presets(&self.executor.binary).await {
            Ok(presets) => {
                info!(count = presets.len(), "Discovered worker presets");
                *self.preset_failure.lock() = None;
                Some(self.presets.get_or_init(|| async { presets }).await.clone())
            }
            Err(e) => {
                warn!(error = %e, "Preset discovery failed; using fallback list");
                *self.preset_failure.lock() = Some(Instant::now());
                None
            }
        }
    }

    /// Presets are only checked once discovery has succeeded; the fallback
    /// list is too short to reject against.
    async fn validate_preset(&self, preset: &str) -> Result<(), ServiceError> {
        match self.discovered_presets().await {
            Some(presets) if !presets.iter().any(|p| p == preset) => Err(
                ServiceError::Validation(format!("Unknown preset: {}", preset)),
            ),
            Some(_) => Ok(()),
            None => {
                debug!(preset, "Preset not validated; discovery unavailable");
                Ok(())
            }
        }
    }

    /// Worker version string, cached after the first successful parse.
    pub async fn get_worker_version(&self) -> Result<String, WorkerError> {
        self.worker_version
            .get_or_try_init(|| query_version(&self.executor.binary))
            .await
            .cloned()
    }

    pub async fn get_provider_status(&self) -> ProviderStatus {
        let worker_version = self.get_worker_version().await;
        let supported_presets = self.get_presets().await;
        let active_jobs = self.registry.processing_count().await;

        let (status, worker_version, error) = match worker_version {
            Ok(version) => (ProviderState::Ready, Some(version), None),
            Err(e) => (ProviderState::Error, None, Some(e.to_string())),
        };

        ProviderStatus {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            worker_version,
            supported_presets,
            system_info: system_info(),
            max_concurrent_jobs: self.gate.limits().max_concurrent_jobs,
            active_jobs,
            error,
        }
    }
}
