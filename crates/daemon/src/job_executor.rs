//! Job executor module for the transcode daemon
//!
//! Supervises one worker process per job: spawns it, streams its stdout into
//! progress updates, and records the terminal state. Cancellation requests
//! arrive through the job's [`ProcessHandle`]; the executor owns the child
//! process and is the only code that signals or reaps it.

use crate::encode::{build_worker_command, parse_progress_line};
use crate::jobs::{CancelRequest, JobEntry, JobStatus, ProcessHandle};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, Signal, System};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Error type for job execution; recorded on the job, never returned to the submitter
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Failed to create output directory: {0}")]
    OutputDir(std::io::Error),

    #[error("Failed to start worker: {0}")]
    Spawn(std::io::Error),

    #[error("Worker {0} was not captured")]
    MissingPipe(&'static str),

    #[error("IO error while supervising worker: {0}")]
    Io(#[from] std::io::Error),
}

/// Settings shared by every job the executor runs
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// Resolved worker executable
    pub binary: PathBuf,
    /// Time allowed between the graceful stop request and a forced kill
    pub cancel_grace: Duration,
}

impl JobExecutorConfig {
    pub fn new(binary: PathBuf, cancel_grace: Duration) -> Self {
        Self {
            binary,
            cancel_grace,
        }
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    CancelRequested(CancelRequest),
}

/// Run one job to a terminal state
///
/// Never returns an error: every failure is recorded on the job as `failed`.
/// No retries are attempted; a new job must be submitted instead.
pub async fn run_job(entry: Arc<JobEntry>, config: JobExecutorConfig) {
    // Errors only escape before the worker is running, so no handle exists yet.
    if let Err(e) = supervise(&entry, &config).await {
        error!(job_id = %entry.id, error = %e, "Job execution failed");
        entry.finish(JobStatus::Failed, Some(e.to_string()));
    }
}

async fn supervise(entry: &JobEntry, config: &JobExecutorConfig) -> Result<(), JobError> {
    if let Some(parent) = entry.output_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(JobError::OutputDir)?;
        }
    }

    let mut cmd = build_worker_command(
        &config.binary,
        &entry.input_path,
        &entry.output_path,
        &entry.preset,
        &entry.options,
    );
    debug!(job_id = %entry.id, command = ?cmd.as_std(), "Spawning worker");

    let mut child = cmd.spawn().map_err(JobError::Spawn)?;
    let stdout = child.stdout.take().ok_or(JobError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(JobError::MissingPipe("stderr"))?;

    // Drained concurrently so a chatty worker never blocks on a full pipe.
    let stderr_task = tokio::spawn(read_all(stderr));

    let (cancel_tx, mut cancel_rx) = oneshot::channel();
    let handle = ProcessHandle::new(child.id(), cancel_tx);
    if entry.start_processing(handle).is_err() {
        warn!(job_id = %entry.id, "Job left the queue before its worker started; stopping worker");
        terminate(&mut child, config.cancel_grace).await;
        return Ok(());
    }
    info!(job_id = %entry.id, pid = ?child.id(), "Worker started");

    let mut cancel_open = true;
    let outcome = {
        let mut reader = BufReader::new(stdout);
        let natural = async {
            // Raw bytes: a non-UTF-8 log line is noise, not a read error.
            let mut buf = Vec::new();
            while reader.read_until(b'\n', &mut buf).await? > 0 {
                let line = String::from_utf8_lossy(&buf);
                match parse_progress_line(&line) {
                    Some(progress) => {
                        entry.update_progress(progress);
                    }
                    None => debug!(job_id = %entry.id, line = %line.trim(), "Worker output"),
                }
                buf.clear();
            }
            child.wait().await
        };
        tokio::pin!(natural);

        loop {
            tokio::select! {
                result = &mut natural => break Outcome::Exited(result),
                request = &mut cancel_rx, if cancel_open => match request {
                    Ok(request) => break Outcome::CancelRequested(request),
                    Err(_) => cancel_open = false,
                },
            }
        }
    };

    match outcome {
        Outcome::CancelRequested(request) => {
            terminate(&mut child, config.cancel_grace).await;
            let _ = request.ack.send(());
            Ok(())
        }
        Outcome::Exited(result) => {
            if entry.take_handle().is_none() {
                // Cancellation took the handle first and decides the outcome.
                if cancel_open {
                    if let Ok(request) = cancel_rx.await {
                        let _ = request.ack.send(());
                    }
                }
                return Ok(());
            }

            match result {
                Ok(status) if status.success() => {
                    entry.finish(JobStatus::Completed, None);
                }
                Ok(status) => {
                    let stderr_text = stderr_task.await.unwrap_or_default();
                    entry.finish(JobStatus::Failed, Some(failure_message(status, &stderr_text)));
                }
                Err(e) => {
                    let _ = child.kill().await;
                    entry.finish(JobStatus::Failed, Some(JobError::Io(e).to_string()));
                }
            }
            Ok(())
        }
    }
}

fn failure_message(status: ExitStatus, stderr: &str) -> String {
    let code = match status.code() {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    };
    format!("HandBrakeCLI failed with code {}: {}", code, stderr.trim())
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!(error = %e, "Failed to read worker stderr");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Stop a worker: graceful request first, forced kill after `grace`
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        if !request_graceful_stop(pid) {
            debug!(pid, "Graceful stop unavailable; waiting for grace period");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(pid = ?child.id(), grace_secs = grace.as_secs(), "Worker ignored stop request; killing");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill worker");
            }
        }
    }
}

/// Send SIGTERM (or the platform equivalent) to `pid`
fn request_graceful_stop(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), ProcessRefreshKind::new());
    system
        .process(pid)
        .and_then(|process| process.kill_with(Signal::Term))
        .unwrap_or(false)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::jobs::{JobRegistry, NewJob};
    use crate::options::{EncoderOptions, OptionValue};
    use crate::startup::tests::write_script;
    use std::path::Path;
    use std::time::Instant;
    use tempfile::TempDir;

    fn config(binary: PathBuf) -> JobExecutorConfig {
        JobExecutorConfig::new(binary, Duration::from_secs(5))
    }

    fn new_job(dir: &Path) -> NewJob {
        NewJob {
            input_path: dir.join("in.mp4"),
            output_path: dir.join("nested/out/out.mkv"),
            preset: "Fast 1080p30".to_string(),
            options: EncoderOptions::new(),
        }
    }

    async fn wait_for_status(entry: &JobEntry, status: JobStatus) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while entry.status() != status {
            assert!(Instant::now() < deadline, "timed out waiting for {}", status);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_progress_then_success() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            dir.path(),
            "hb",
            "echo '{\"Progress\": 25.0}'\necho 'garbage'\necho '{\"Progress\": 100.0}'\nexit 0",
        );
        let registry = JobRegistry::new();
        let entry = registry.insert(new_job(dir.path())).await;

        run_job(entry.clone(), config(script)).await;

        let snap = entry.snapshot();
        assert_eq!(snap.status, JobStatus::Completed);
        assert_eq!(snap.progress, 100.0);
        assert_eq!(snap.error, None);
        assert!(!entry.has_handle());
        assert!(dir.path().join("nested/out").is_dir());
    }

    #[tokio::test]
    async fn test_non_utf8_output_is_ignored() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            dir.path(),
            "hb",
            "echo '{\"Progress\": 25.0}'\nprintf 'Title: caf\\351\\n'\necho '{\"Progress\": 100.0}'\nexit 0",
        );
        let registry = JobRegistry::new();
        let entry = registry.insert(new_job(dir.path())).await;

        run_job(entry.clone(), config(script)).await;

        let snap = entry.snapshot();
        assert_eq!(snap.status, JobStatus::Completed);
        assert_eq!(snap.progress, 100.0);
        assert_eq!(snap.error, None);
    }

    #[tokio::test]
    async fn test_intermediate_progress_observable() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            dir.path(),
            "hb",
            "echo '{\"Progress\": 25.0}'\nsleep 1\necho '{\"Progress\": 100.0}'\nexit 0",
        );
        let registry = JobRegistry::new();
        let entry = registry.insert(new_job(dir.path())).await;

        let task = tokio::spawn(run_job(entry.clone(), config(script)));

        let deadline = Instant::now() + Duration::from_secs(10);
        while entry.progress() < 25.0 {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(entry.status(), JobStatus::Processing);
        assert_eq!(entry.progress(), 25.0);

        task.await.unwrap();
        assert_eq!(entry.status(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_nonzero_exit_records_stderr() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "hb", "echo 'Invalid preset' >&2\nexit 3");
        let registry = JobRegistry::new();
        let entry = registry.insert(new_job(dir.path())).await;

        run_job(entry.clone(), config(script)).await;

        let snap = entry.snapshot();
        assert_eq!(snap.status, JobStatus::Failed);
        assert_eq!(
            snap.error.as_deref(),
            Some("HandBrakeCLI failed with code 3: Invalid preset")
        );
        assert!(!registry.cancel(&entry.id).await);
    }

    #[tokio::test]
    async fn test_spawn_failure_recorded() {
        let dir = TempDir::new().unwrap();
        let registry = JobRegistry::new();
        let entry = registry.insert(new_job(dir.path())).await;

        run_job(entry.clone(), config(dir.path().join("missing-binary"))).await;

        let snap = entry.snapshot();
        assert_eq!(snap.status, JobStatus::Failed);
        assert!(snap.error.unwrap().contains("Failed to start worker"));
    }

    #[tokio::test]
    async fn test_options_reach_worker() {
        let dir = TempDir::new().unwrap();
        let args_file = dir.path().join("args.txt");
        let script = write_script(
            dir.path(),
            "hb",
            &format!("echo \"$@\" > '{}'\nexit 0", args_file.display()),
        );
        let registry = JobRegistry::new();
        let mut job = new_job(dir.path());
        job.options.insert("quality".into(), OptionValue::Int(22));
        job.options.insert("optimize".into(), OptionValue::Bool(true));
        let entry = registry.insert(job).await;

        run_job(entry.clone(), config(script)).await;

        let args = std::fs::read_to_string(&args_file).unwrap();
        assert!(args.contains("--preset Fast 1080p30"));
        assert!(args.contains("--json"));
        assert!(args.contains("--optimize --quality 22"));
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "hb", "echo '{\"Progress\": 5.0}'\nexec sleep 30");
        let registry = Arc::new(JobRegistry::new());
        let entry = registry.insert(new_job(dir.path())).await;

        let task = tokio::spawn(run_job(entry.clone(), config(script)));
        wait_for_status(&entry, JobStatus::Processing).await;

        let started = Instant::now();
        assert!(registry.cancel(&entry.id).await);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(entry.status(), JobStatus::Cancelled);

        task.await.unwrap();
        assert_eq!(entry.status(), JobStatus::Cancelled);
        assert!(!registry.cancel(&entry.id).await);
    }

    #[tokio::test]
    async fn test_cancel_escalates_to_kill() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            dir.path(),
            "hb",
            "trap '' TERM\necho '{\"Progress\": 1.0}'\nwhile true; do sleep 1; done",
        );
        let registry = Arc::new(JobRegistry::new());
        let entry = registry.insert(new_job(dir.path())).await;

        let cfg = JobExecutorConfig::new(script, Duration::from_millis(300));
        let task = tokio::spawn(run_job(entry.clone(), cfg));
        wait_for_status(&entry, JobStatus::Processing).await;

        assert!(registry.cancel(&entry.id).await);
        assert_eq!(entry.status(), JobStatus::Cancelled);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_holding_handle_wins_over_natural_exit() {
        let dir = TempDir::new().unwrap();
        let exited = dir.path().join("exited");
        let script = write_script(
            dir.path(),
            "hb",
            &format!(
                "echo '{{\"Progress\": 50.0}}'\nsleep 0.3\ntouch '{}'\nexit 0",
                exited.display()
            ),
        );
        let registry = JobRegistry::new();
        let entry = registry.insert(new_job(dir.path())).await;

        let task = tokio::spawn(run_job(entry.clone(), config(script)));
        wait_for_status(&entry, JobStatus::Processing).await;

        // Cancel side takes the handle before the worker finishes.
        let handle = entry.take_handle().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while !exited.exists() {
            assert!(Instant::now() < deadline, "worker never exited");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The supervisor saw a clean exit but must not record it.
        assert_eq!(entry.status(), JobStatus::Processing);

        let ack = handle.request_cancel().unwrap();
        tokio::time::timeout(Duration::from_secs(5), ack)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(entry.status(), JobStatus::Completed);

        assert!(entry.finish(JobStatus::Cancelled, None));
        task.await.unwrap();
        assert_eq!(entry.status(), JobStatus::Cancelled);
        assert_eq!(entry.progress(), 50.0);
    }

    #[test]
    fn test_failure_message_format() {
        use std::os::unix::process::ExitStatusExt;
        let status = ExitStatus::from_raw(2 << 8);
        assert_eq!(
            failure_message(status, "bad input\n"),
            "HandBrakeCLI failed with code 2: bad input"
        );
        let signalled = ExitStatus::from_raw(9);
        assert!(failure_message(signalled, "").contains("code signal"));
    }
}
