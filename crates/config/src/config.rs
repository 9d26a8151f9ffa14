//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Log levels accepted by `[logging] level`.
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but is out of range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// External transcoder binary configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Executable name (searched in PATH) or absolute path
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Preset used when a request does not name one
    #[serde(default = "default_preset")]
    pub default_preset: String,
}

fn default_binary() -> String {
    "HandBrakeCLI".to_string()
}

fn default_preset() -> String {
    "Fast 1080p30".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            default_preset: default_preset(),
        }
    }
}

/// Admission limits and supervision timings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Maximum number of jobs in `processing` at once
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
    /// Inputs smaller than this are rejected
    #[serde(default = "default_min_file_size_bytes")]
    pub min_file_size_bytes: u64,
    /// Inputs larger than this are rejected
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,
    /// Host CPU utilization above which new jobs are refused
    #[serde(default = "default_cpu_threshold_percent")]
    pub cpu_threshold_percent: f32,
    /// Host memory utilization above which new jobs are refused
    #[serde(default = "default_memory_threshold_percent")]
    pub memory_threshold_percent: f32,
    /// Disk usage (volume hosting the worker binary) above which new jobs are refused
    #[serde(default = "default_disk_threshold_percent")]
    pub disk_threshold_percent: f32,
    /// Seconds between the graceful terminate request and the forced kill
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
}

fn default_max_concurrent_jobs() -> u32 {
    5
}

fn default_min_file_size_bytes() -> u64 {
    1024
}

fn default_max_file_size_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_cpu_threshold_percent() -> f32 {
    90.0
}

fn default_memory_threshold_percent() -> f32 {
    85.0
}

fn default_disk_threshold_percent() -> f32 {
    90.0
}

fn default_cancel_grace_secs() -> u64 {
    5
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            min_file_size_bytes: default_min_file_size_bytes(),
            max_file_size_bytes: default_max_file_size_bytes(),
            cpu_threshold_percent: default_cpu_threshold_percent(),
            memory_threshold_percent: default_memory_threshold_percent(),
            disk_threshold_percent: default_disk_threshold_percent(),
            cancel_grace_secs: default_cancel_grace_secs(),
        }
    }
}

/// Retention of finished jobs in the registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionConfig {
    /// Terminal jobs older than this are evicted (0 = keep forever)
    #[serde(default)]
    pub job_ttl_secs: u64,
    /// How often the sweeper runs
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            job_ttl_secs: 0,
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_true() -> bool {
    true
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
        }
    }
}

/// Watch-folder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchConfig {
    /// Folders scanned recursively for new video files
    #[serde(default)]
    pub folders: Vec<PathBuf>,
    /// Output directory (None = next to the input)
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default = "default_output_suffix")]
    pub output_suffix: String,
    #[serde(default = "default_output_extension")]
    pub output_extension: String,
    /// Preset for watched files (None = worker default)
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Window over which a new file's size must not change
    #[serde(default = "default_stability_secs")]
    pub stability_secs: u64,
    /// Delete the input once its job completes
    #[serde(default)]
    pub delete_original: bool,
}

fn default_output_suffix() -> String {
    "_converted".to_string()
}

fn default_output_extension() -> String {
    "mkv".to_string()
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_stability_secs() -> u64 {
    2
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            folders: Vec::new(),
            output_dir: None,
            output_suffix: default_output_suffix(),
            output_extension: default_output_extension(),
            preset: None,
            poll_interval_secs: default_poll_interval_secs(),
            stability_secs: default_stability_secs(),
            delete_original: false,
        }
    }
}

/// Webhook notification configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Event names delivered to the webhook
    #[serde(default = "default_events")]
    pub events: Vec<String>,
}

fn default_events() -> Vec<String> {
    vec![
        "job_started".to_string(),
        "job_completed".to_string(),
        "job_failed".to_string(),
    ]
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            events: default_events(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Split a comma-separated env value, dropping blanks.
fn split_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - HBB_PATH -> worker.binary
    /// - DEFAULT_PRESET -> worker.default_preset
    /// - MAX_CONCURRENT_JOBS -> limits.max_concurrent_jobs
    /// - WATCH_FOLDERS (comma separated) -> watch.folders
    /// - WEBHOOK_URL -> notifications.webhook_url
    /// - WEBHOOK_EVENTS (comma separated) -> notifications.events
    /// - LOG_LEVEL -> logging.level
    /// - BIND_ADDR -> server.bind
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("HBB_PATH") {
            if !val.trim().is_empty() {
                self.worker.binary = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("DEFAULT_PRESET") {
            if !val.trim().is_empty() {
                self.worker.default_preset = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("MAX_CONCURRENT_JOBS") {
            if let Ok(jobs) = val.trim().parse::<u32>() {
                self.limits.max_concurrent_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("WATCH_FOLDERS") {
            self.watch.folders = split_list(&val).into_iter().map(PathBuf::from).collect();
        }

        if let Ok(val) = env::var("WEBHOOK_URL") {
            let val = val.trim();
            self.notifications.webhook_url = if val.is_empty() {
                None
            } else {
                Some(val.to_string())
            };
        }

        if let Ok(val) = env::var("WEBHOOK_EVENTS") {
            self.notifications.events = split_list(&val);
        }

        if let Ok(val) = env::var("LOG_LEVEL") {
            if !val.trim().is_empty() {
                self.logging.level = val.trim().to_lowercase();
            }
        }

        if let Ok(val) = env::var("BIND_ADDR") {
            if !val.trim().is_empty() {
                self.server.bind = val.trim().to_string();
            }
        }
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.limits;
        if limits.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if limits.min_file_size_bytes > limits.max_file_size_bytes {
            return Err(ConfigError::Invalid(format!(
                "limits.min_file_size_bytes ({}) exceeds limits.max_file_size_bytes ({})",
                limits.min_file_size_bytes, limits.max_file_size_bytes
            )));
        }
        for (name, value) in [
            ("cpu_threshold_percent", limits.cpu_threshold_percent),
            ("memory_threshold_percent", limits.memory_threshold_percent),
            ("disk_threshold_percent", limits.disk_threshold_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ConfigError::Invalid(format!(
                    "limits.{} must be in (0, 100], got {}",
                    name, value
                )));
            }
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "logging.level must be one of {}, got '{}'",
                LOG_LEVELS.join(", "),
                self.logging.level
            )));
        }
        if self.worker.binary.trim().is_empty() {
            return Err(ConfigError::Invalid("worker.binary is empty".to_string()));
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
