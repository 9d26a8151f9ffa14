//! Job registry and per-job state machine.
//!
//! The registry is the authoritative `job_id -> job` map and the only place
//! that allocates ids or moves a job to `cancelled`. Each entry keeps its
//! mutable state and its live process handle behind two separate locks so the
//! supervising task and a cancel request can race for the handle without
//! holding the state lock.
//!
//! State machine:
//!
//! ```text
//! queued ──(worker spawned)──> processing ──(exit 0)──────────> completed
//!   │                              ├──────(exit != 0 / error)──> failed
//!   │                              └──────(cancel)─────────────> cancelled
//!   └──(spawn error)──────────────────────────────────────────> failed
//! ```
//!
//! No transition leaves a terminal state. When a process exits on its own at
//! the same moment a cancel arrives, whichever side takes the handle first
//! decides the outcome: cancellation wins iff the handle was still present when
//! `cancel` took it.

use crate::options::EncoderOptions;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, oneshot, RwLock};
use tracing::{info, warn};

/// Capacity of the lifecycle event channel; slow subscribers lag, not block.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether no further transition can occur.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status as reported to pollers, with a sentinel for unknown ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
    NotFound,
}

impl From<JobStatus> for ReportedStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Queued => ReportedStatus::Queued,
            JobStatus::Processing => ReportedStatus::Processing,
            JobStatus::Completed => ReportedStatus::Completed,
            JobStatus::Failed => ReportedStatus::Failed,
            JobStatus::Cancelled => ReportedStatus::Cancelled,
        }
    }
}

/// Lifecycle event kinds, named as they appear in notification payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    JobStarted,
    JobCompleted,
    JobFailed,
    JobCancelled,
}

impl JobEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobEventKind::JobStarted => "job_started",
            JobEventKind::JobCompleted => "job_completed",
            JobEventKind::JobFailed => "job_failed",
            JobEventKind::JobCancelled => "job_cancelled",
        }
    }

    fn for_terminal(status: JobStatus) -> Option<Self> {
        match status {
            JobStatus::Completed => Some(JobEventKind::JobCompleted),
            JobStatus::Failed => Some(JobEventKind::JobFailed),
            JobStatus::Cancelled => Some(JobEventKind::JobCancelled),
            JobStatus::Queued | JobStatus::Processing => None,
        }
    }
}

/// A state transition, broadcast to notification and watch-folder consumers.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job: JobSnapshot,
}

/// Request sent by `cancel` to the task supervising the process.
///
/// The supervisor terminates and reaps the process, then answers on `ack`.
#[derive(Debug)]
pub struct CancelRequest {
    pub ack: oneshot::Sender<()>,
}

/// Ownership handle for a live worker process.
///
/// The supervising task owns the process itself; the handle is the only way
/// to ask it to stop. It is removed from the entry exactly once, through
/// [`JobEntry::take_handle`].
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    cancel_tx: oneshot::Sender<CancelRequest>,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>, cancel_tx: oneshot::Sender<CancelRequest>) -> Self {
        Self { pid, cancel_tx }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the supervisor to stop the process.
    ///
    /// Returns a receiver that resolves once the process has been reaped, or
    /// `None` if the supervisor is already gone.
    pub fn request_cancel(self) -> Option<oneshot::Receiver<()>> {
        let (ack, done) = oneshot::channel();
        self.cancel_tx.send(CancelRequest { ack }).ok()?;
        Some(done)
    }
}

#[derive(Debug, Clone)]
struct JobState {
    status: JobStatus,
    progress: f32,
    error: Option<String>,
    started_at: Option<i64>,
    finished_at: Option<i64>,
}

/// Point-in-time copy of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub preset: String,
    /// Unix timestamps in milliseconds
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

/// Answer to a status poll; unknown ids yield [`ReportedStatus::NotFound`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: String,
    pub status: ReportedStatus,
    pub progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub input_path: String,
    pub output_path: String,
}

impl JobStatusReport {
    pub fn not_found(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: ReportedStatus::NotFound,
            progress: 0.0,
            error: Some("Job not found".to_string()),
            input_path: String::new(),
            output_path: String::new(),
        }
    }
}

impl From<JobSnapshot> for JobStatusReport {
    fn from(snapshot: JobSnapshot) -> Self {
        Self {
            job_id: snapshot.job_id,
            status: snapshot.status.into(),
            progress: snapshot.progress,
            error: snapshot.error,
            input_path: snapshot.input_path.to_string_lossy().into_owned(),
            output_path: snapshot.output_path.to_string_lossy().into_owned(),
        }
    }
}

/// Validated parameters for a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub preset: String,
    pub options: EncoderOptions,
}

/// One job record. Immutable request fields plus locked mutable state.
#[derive(Debug)]
pub struct JobEntry {
    pub id: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub preset: String,
    pub options: EncoderOptions,
    pub created_at: i64,
    seq: u64,
    state: Mutex<JobState>,
    handle: Mutex<Option<ProcessHandle>>,
    events: broadcast::Sender<JobEvent>,
}

impl JobEntry {
    pub fn status(&self) -> JobStatus {
        self.state.lock().status
    }

    pub fn progress(&self) -> f32 {
        self.state.lock().progress
    }

    pub fn has_handle(&self) -> bool {
        self.handle.lock().is_some()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.state.lock().clone();
        JobSnapshot {
            job_id: self.id.clone(),
            status: state.status,
            progress: state.progress,
            error: state.error,
            input_path: self.input_path.clone(),
            output_path: self.output_path.clone(),
            preset: self.preset.clone(),
            created_at: self.created_at,
            started_at: state.started_at,
            finished_at: state.finished_at,
        }
    }

    /// Record a spawned process: stores its handle and moves `queued` to
    /// `processing`.
    ///
    /// If the job is no longer queued the handle is handed back as `Err` so
    /// the caller can stop the process itself.
    pub fn start_processing(&self, handle: ProcessHandle) -> Result<(), ProcessHandle> {
        {
            let mut state = self.state.lock();
            if state.status != JobStatus::Queued {
                return Err(handle);
            }
            state.status = JobStatus::Processing;
            state.started_at = Some(current_timestamp_ms());
            *self.handle.lock() = Some(handle);
        }

        info!(job_id = %self.id, "Job processing");
        self.emit(JobEventKind::JobStarted);
        Ok(())
    }

    /// Remove the process handle. At most one caller ever receives it.
    pub fn take_handle(&self) -> Option<ProcessHandle> {
        self.handle.lock().take()
    }

    /// Apply a progress report from the worker.
    ///
    /// Values are clamped to [0, 100]; reports lower than the current value
    /// or arriving outside `processing` are ignored.
    pub fn update_progress(&self, progress: f32) -> bool {
        if !progress.is_finite() {
            return false;
        }
        let progress = progress.clamp(0.0, 100.0);

        let mut state = self.state.lock();
        if state.status != JobStatus::Processing || progress <= state.progress {
            return false;
        }
        state.progress = progress;
        true
    }

    /// Move the job to a terminal status.
    ///
    /// Ignored (returns `false`) if the job is already terminal. `completed`
    /// pins progress to 100; `error` is kept only for `failed`.
    pub fn finish(&self, status: JobStatus, error: Option<String>) -> bool {
        let Some(kind) = JobEventKind::for_terminal(status) else {
            warn!(job_id = %self.id, %status, "Refusing non-terminal finish");
            return false;
        };

        let recorded_error = {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                return false;
            }
            state.status = status;
            state.finished_at = Some(current_timestamp_ms());
            match status {
                JobStatus::Completed => {
                    state.progress = 100.0;
                    state.error = None;
                }
                JobStatus::Failed => {
                    state.error = Some(
                        error
                            .filter(|e| !e.trim().is_empty())
                            .unwrap_or_else(|| "Unknown error".to_string()),
                    );
                }
                _ => state.error = None,
            }
            state.error.clone()
        };

        match recorded_error {
            Some(error) => warn!(job_id = %self.id, %error, "Job failed"),
            None => info!(job_id = %self.id, %status, "Job finished"),
        }
        self.emit(kind);
        true
    }

    fn finished_at(&self) -> Option<i64> {
        let state = self.state.lock();
        if state.status.is_terminal() {
            state.finished_at
        } else {
            None
        }
    }

    fn emit(&self, kind: JobEventKind) {
        // No subscribers is not an error.
        let _ = self.events.send(JobEvent {
            kind,
            job: self.snapshot(),
        });
    }
}

/// Authoritative map of job id to job entry.
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<JobEntry>>>,
    next_id: AtomicU64,
    events: broadcast::Sender<JobEvent>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            jobs: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    /// Subscribe to lifecycle events of all jobs.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Store a new `queued` job under a fresh `job_<n>_<input-stem>` id.
    ///
    /// Ids come from a monotonic counter and are never reused, even after
    /// eviction.
    pub async fn insert(&self, job: NewJob) -> Arc<JobEntry> {
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("job_{}_{}", seq, file_stem(&job.input_path));

        let entry = Arc::new(JobEntry {
            id: id.clone(),
            input_path: job.input_path,
            output_path: job.output_path,
            preset: job.preset,
            options: job.options,
            created_at: current_timestamp_ms(),
            seq,
            state: Mutex::new(JobState {
                status: JobStatus::Queued,
                progress: 0.0,
                error: None,
                started_at: None,
                finished_at: None,
            }),
            handle: Mutex::new(None),
            events: self.events.clone(),
        });

        self.jobs.write().await.insert(id.clone(), entry.clone());
        info!(job_id = %id, preset = %entry.preset, "Job queued");
        entry
    }

    pub async fn get(&self, job_id: &str) -> Option<Arc<JobEntry>> {
        self.jobs.read().await.get(job_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Snapshots of every job in creation order.
    pub async fn list(&self) -> Vec<JobSnapshot> {
        let mut entries: Vec<Arc<JobEntry>> = self.jobs.read().await.values().cloned().collect();
        entries.sort_by_key(|e| e.seq);
        entries.iter().map(|e| e.snapshot()).collect()
    }

    /// Number of jobs currently in `processing`.
    pub async fn processing_count(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|e| e.status() == JobStatus::Processing)
            .count()
    }

    /// Cancel a job's live process.
    ///
    /// Returns `false` for unknown ids and for jobs without a live process
    /// handle (already terminal, or queued but not yet spawned). Otherwise
    /// waits for the supervisor to terminate and reap the process (graceful
    /// first, forced after the grace period), records `cancelled` and returns
    /// `true`.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let Some(entry) = self.get(job_id).await else {
            return false;
        };
        let Some(handle) = entry.take_handle() else {
            return false;
        };

        info!(job_id = %job_id, pid = ?handle.pid(), "Cancelling job");
        if let Some(done) = handle.request_cancel() {
            // A dropped ack means the supervisor exited; the process is gone either way.
            let _ = done.await;
        }

        entry.finish(JobStatus::Cancelled, None);
        true
    }

    /// Drop terminal jobs that finished more than `ttl` ago.
    ///
    /// Returns the number of evicted entries.
    pub async fn evict_expired(&self, ttl: Duration) -> usize {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let cutoff = current_timestamp_ms().saturating_sub(ttl_ms);
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, entry| match entry.finished_at() {
            Some(finished) => finished > cutoff,
            None => true,
        });
        before - jobs.len()
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string())
}

/// Get current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
