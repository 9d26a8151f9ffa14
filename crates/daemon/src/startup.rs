//! Worker binary discovery and one-shot queries
//!
//! Provides the preflight run once at service construction:
//! - Locating the worker executable (absolute path or `PATH` search)
//! - Querying its preset listing and version banner

use crate::encode::{parse_preset_list, parse_worker_version, PRESET_LIST_FLAG, VERSION_FLAG};
use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Error types for worker discovery and queries
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker binary cannot be located; fatal to the service
    #[error("Worker binary not found: {0}")]
    NotFound(String),

    #[error("Worker query `{flag}` failed: {detail}")]
    QueryFailed { flag: String, detail: String },

    #[error("Could not parse worker output for `{0}`")]
    Unparseable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolve the worker binary
///
/// A name containing a path separator is taken as a path and must exist as a
/// file. A bare name is searched for in every `PATH` entry. The result is
/// canonicalized.
pub fn locate_worker_binary(name: &str) -> Result<PathBuf, WorkerError> {
    if name.trim().is_empty() {
        return Err(WorkerError::NotFound("empty binary name".to_string()));
    }

    let candidate = Path::new(name);
    let found = if candidate.components().count() > 1 || candidate.is_absolute() {
        if !is_executable_file(candidate) {
            return Err(WorkerError::NotFound(format!(
                "{} does not exist or is not executable",
                name
            )));
        }
        candidate.to_path_buf()
    } else {
        let path_var = env::var_os("PATH").unwrap_or_default();
        env::split_paths(&path_var)
            .map(|dir| dir.join(name))
            .find(|p| is_executable_file(p))
            .ok_or_else(|| {
                WorkerError::NotFound(format!(
                    "{} not found in PATH; install HandBrakeCLI or set HBB_PATH",
                    name
                ))
            })?
    };

    // Absolute form so the disk gate can match it against mount points.
    Ok(std::fs::canonicalize(&found).unwrap_or(found))
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}

/// Run the worker with a single flag and return its combined output
///
/// HandBrakeCLI writes most informational text to stderr, so stdout and stderr
/// are concatenated.
pub async fn run_worker_query(binary: &Path, flag: &str) -> Result<String, WorkerError> {
    let output = Command::new(binary)
        .arg(flag)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() && text.trim().is_empty() {
        return Err(WorkerError::QueryFailed {
            flag: flag.to_string(),
            detail: format!("exit status {}", output.status),
        });
    }

    debug!(flag, bytes = text.len(), "Worker query finished");
    Ok(text)
}

/// Ask the worker for its preset names
///
/// An empty parse is reported as [`WorkerError::Unparseable`] so the caller
/// can decide on a fallback.
pub async fn query_presets(binary: &Path) -> Result<Vec<String>, WorkerError> {
    let text = run_worker_query(binary, PRESET_LIST_FLAG).await?;
    let presets = parse_preset_list(&text);
    if presets.is_empty() {
        return Err(WorkerError::Unparseable(PRESET_LIST_FLAG.to_string()));
    }
    Ok(presets)
}

/// Ask the worker for its version banner
pub async fn query_version(binary: &Path) -> Result<String, WorkerError> {
    let text = run_worker_query(binary, VERSION_FLAG).await?;
    parse_worker_version(&text).ok_or_else(|| WorkerError::Unparseable(VERSION_FLAG.to_string()))
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Write an executable `/bin/sh` script into `dir` and return its path.
    pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_locate_absolute_path() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "HandBrakeCLI", "exit 0");
        let found = locate_worker_binary(script.to_str().unwrap()).unwrap();
        assert_eq!(found, fs::canonicalize(&script).unwrap());
    }

    #[test]
    fn test_locate_relative_path_is_canonicalized() {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("bin");
        fs::create_dir(&bin).unwrap();
        let script = write_script(&bin, "HandBrakeCLI", "exit 0");

        // Relative to the cwd, via `..` segments from the current directory
        let cwd = env::current_dir().unwrap();
        let mut relative = PathBuf::new();
        for _ in cwd.components().skip(1) {
            relative.push("..");
        }
        let relative = relative.join(script.strip_prefix("/").unwrap());

        let found = locate_worker_binary(relative.to_str().unwrap()).unwrap();
        assert!(found.is_absolute());
        assert_eq!(found, fs::canonicalize(&script).unwrap());
    }

    #[test]
    fn test_locate_missing_absolute_path() {
        let result = locate_worker_binary("/nonexistent/dir/HandBrakeCLI");
        assert!(matches!(result, Err(WorkerError::NotFound(_))));
    }

    #[test]
    fn test_locate_non_executable_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("HandBrakeCLI");
        fs::write(&path, "not a program").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let result = locate_worker_binary(path.to_str().unwrap());
        assert!(matches!(result, Err(WorkerError::NotFound(_))));
    }

    #[test]
    fn test_locate_in_path() {
        // `sh` is present in PATH on every unix test host
        let found = locate_worker_binary("sh").unwrap();
        // May resolve through a symlink, e.g. to `dash`
        assert!(found.is_absolute());
        assert!(is_executable_file(&found));
    }

    #[test]
    fn test_locate_empty_name() {
        assert!(matches!(
            locate_worker_binary("  "),
            Err(WorkerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_query_version_reads_stderr() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            dir.path(),
            "hb",
            "echo 'HandBrake 1.8.2' >&2\necho '[12:00:00] hb_init: starting libhb thread' >&2",
        );

        let version = query_version(&script).await.unwrap();
        assert_eq!(version, "HandBrake 1.8.2");
    }

    #[tokio::test]
    async fn test_query_presets() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            dir.path(),
            "hb",
            "printf 'General/\\n    Fast 1080p30\\n    HQ 1080p30 Surround\\n' >&2",
        );

        let presets = query_presets(&script).await.unwrap();
        assert_eq!(presets, vec!["Fast 1080p30", "HQ 1080p30 Surround"]);
    }

    #[tokio::test]
    async fn test_query_presets_unparseable() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "hb", "echo 'nothing useful'");

        let result = query_presets(&script).await;
        assert!(matches!(result, Err(WorkerError::Unparseable(_))));
    }

    #[tokio::test]
    async fn test_query_fails_silently_exiting_worker() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "hb", "exit 3");

        let result = run_worker_query(&script, "--version").await;
        assert!(matches!(result, Err(WorkerError::QueryFailed { .. })));
    }
}
