//! Transcode Daemon
//!
//! Background service that validates transcode requests, supervises
//! HandBrakeCLI worker processes and tracks each job through its lifecycle.

pub mod api_server;
pub mod daemon;
pub mod encode;
pub mod gates;
pub mod job_executor;
pub mod jobs;
pub mod metrics;
pub mod notify;
pub mod options;
pub mod sanitize;
pub mod scan;
pub mod service;
pub mod size_gate;
pub mod stability;
pub mod startup;
pub mod watch;

pub use transcode_daemon_config as config;
pub use transcode_daemon_config::Config;
pub use api_server::{create_router, run_api_server, ServerError};
pub use daemon::{Daemon, DaemonError};
pub use encode::{build_worker_command, parse_progress_line, FALLBACK_PRESETS};
pub use gates::{AdmissionError, AdmissionGate, AdmissionLimits};
pub use job_executor::{run_job, JobError, JobExecutorConfig};
pub use jobs::{
    JobEntry, JobEvent, JobEventKind, JobRegistry, JobSnapshot, JobStatus, JobStatusReport,
    ReportedStatus,
};
pub use metrics::{ResourceProbe, ResourceSample, SysinfoProbe};
pub use notify::{spawn_notifier, WebhookNotifier};
pub use options::{EncoderOptions, OptionValue};
pub use sanitize::{sanitize_options, secure_path, SanitizeError};
pub use service::{
    BatchResult, ProviderState, ProviderStatus, ServiceError, TranscodeRequest, TranscodeService,
};
pub use startup::{locate_worker_binary, WorkerError};
pub use watch::{spawn_watcher, FolderWatcher};
