//! Watch-folder ingestion.
//!
//! Polls the configured folders, waits for each new video to stop growing, and
//! submits it through the service. A path is submitted at most once per daemon
//! lifetime. With `delete_original` set, the input is removed after its job
//! completes.

use crate::jobs::{JobEvent, JobEventKind};
use crate::scan::{has_output_suffix, scan_watch_folders};
use crate::service::{ServiceError, TranscodeRequest, TranscodeService};
use crate::stability::{StabilityResult, StabilityTracker};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use transcode_daemon_config::WatchConfig;

/// Output path for a watched input: `<output_dir or parent>/<stem><suffix>.<ext>`.
pub fn output_path_for(config: &WatchConfig, input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let name = format!(
        "{}{}.{}",
        stem,
        config.output_suffix,
        config.output_extension.trim_start_matches('.')
    );

    let dir = match &config.output_dir {
        Some(dir) => dir.clone(),
        None => input.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    dir.join(name)
}

pub struct FolderWatcher {
    service: Arc<TranscodeService>,
    config: WatchConfig,
    tracker: StabilityTracker,
    submitted: HashSet<PathBuf>,
    /// Inputs to delete once their job completes, by job id
    pending_deletes: HashMap<String, PathBuf>,
}

impl FolderWatcher {
    pub fn new(service: Arc<TranscodeService>, config: WatchConfig) -> Self {
        let window = Duration::from_secs(config.stability_secs);
        Self {
            service,
            config,
            tracker: StabilityTracker::new(window),
            submitted: HashSet::new(),
            pending_deletes: HashMap::new(),
        }
    }

    /// Scan once and submit every candidate that has become stable.
    ///
    /// Returns the ids of the jobs created by this pass. Candidates refused
    /// for lack of resources stay eligible for a later pass; other rejections
    /// are final.
    pub async fn poll_once(&mut self) -> Vec<String> {
        let candidates = scan_watch_folders(&self.config.folders);
        let present: Vec<PathBuf> = candidates.iter().map(|c| c.path.clone()).collect();
        self.tracker.retain_present(&present);

        let now = Instant::now();
        let mut created = Vec::new();

        for candidate in candidates {
            if self.submitted.contains(&candidate.path)
                || has_output_suffix(&candidate.path, &self.config.output_suffix)
            {
                continue;
            }

            match self.tracker.observe(&candidate.path, candidate.size_bytes, now) {
                StabilityResult::Stable => {}
                other => {
                    debug!(path = %candidate.path.display(), state = ?other, "Waiting for file to settle");
                    continue;
                }
            }

            let output = output_path_for(&self.config, &candidate.path);
            let mut request = TranscodeRequest::new(
                candidate.path.to_string_lossy(),
                output.to_string_lossy(),
            );
            request.preset = self.config.preset.clone();

            match self.service.transcode(request).await {
                Ok(job_id) => {
                    info!(job_id = %job_id, path = %candidate.path.display(), "Watch folder job submitted");
                    if self.config.delete_original {
                        self.pending_deletes.insert(job_id.clone(), candidate.path.clone());
                    }
                    self.submitted.insert(candidate.path.clone());
                    self.tracker.forget(&candidate.path);
                    created.push(job_id);
                }
                Err(ServiceError::ResourceExhausted(e)) => {
                    debug!(path = %candidate.path.display(), reason = %e, "Deferring watch folder file");
                }
                Err(e) => {
                    warn!(path = %candidate.path.display(), error = %e, "Watch folder file rejected");
                    self.submitted.insert(candidate.path.clone());
                    self.tracker.forget(&candidate.path);
                }
            }
        }

        created
    }

    /// React to a lifecycle event for a watched job.
    pub async fn handle_event(&mut self, event: &JobEvent) {
        match event.kind {
            JobEventKind::JobCompleted => {
                if let Some(input) = self.pending_deletes.remove(&event.job.job_id) {
                    match tokio::fs::remove_file(&input).await {
                        Ok(()) => info!(path = %input.display(), "Deleted original after transcode"),
                        Err(e) => warn!(path = %input.display(), error = %e, "Failed to delete original"),
                    }
                }
            }
            JobEventKind::JobFailed | JobEventKind::JobCancelled => {
                self.pending_deletes.remove(&event.job.job_id);
            }
            JobEventKind::JobStarted => {}
        }
    }

    /// Poll on the configured interval until the task is aborted.
    pub async fn run(mut self) {
        let mut events = self.service.registry().subscribe();
        let mut events_open = true;
        let period = Duration::from_secs(self.config.poll_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(folders = ?self.config.folders, "Watching folders");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                event = events.recv(), if events_open => match event {
                    Ok(event) => self.handle_event(&event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Watch folder missed job events");
                    }
                    Err(RecvError::Closed) => events_open = false,
                },
            }
        }
    }
}

/// Spawn the watcher unless no folders are configured.
pub fn spawn_watcher(
    service: Arc<TranscodeService>,
    config: WatchConfig,
) -> Option<tokio::task::JoinHandle<()>> {
    if config.folders.is_empty() {
        return None;
    }
    Some(tokio::spawn(FolderWatcher::new(service, config).run()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::gates::tests::FixedProbe;
    use crate::jobs::JobStatus;
    use crate::startup::tests::write_script;
    use crate::Config;
    use tempfile::TempDir;

    const FAKE_WORKER: &str = r#"
case "$1" in
  --preset-list|--version) exit 1;;
esac
echo '{"Progress": 100.0}'
exit 0
"#;

    fn setup(delete_original: bool) -> (TempDir, Arc<TranscodeService>, WatchConfig) {
        let dir = TempDir::new().unwrap();
        let binary = write_script(dir.path(), "HandBrakeCLI", FAKE_WORKER);
        let service = Arc::new(TranscodeService::with_probe(
            Config::default(),
            binary,
            Arc::new(FixedProbe::idle()),
        ));

        let watch_dir = dir.path().join("incoming");
        std::fs::create_dir_all(&watch_dir).unwrap();
        let config = WatchConfig {
            folders: vec![watch_dir],
            stability_secs: 0,
            delete_original,
            ..WatchConfig::default()
        };
        (dir, service, config)
    }

    #[test]
    fn test_output_path_beside_input() {
        let config = WatchConfig::default();
        assert_eq!(
            output_path_for(&config, Path::new("/w/movie.mp4")),
            PathBuf::from("/w/movie_converted.mkv")
        );
    }

    #[test]
    fn test_output_path_in_output_dir() {
        let config = WatchConfig {
            output_dir: Some(PathBuf::from("/out")),
            output_suffix: String::new(),
            output_extension: ".mp4".to_string(),
            ..WatchConfig::default()
        };
        assert_eq!(
            output_path_for(&config, Path::new("/w/sub/clip.mov")),
            PathBuf::from("/out/clip.mp4")
        );
    }

    #[tokio::test]
    async fn test_file_submitted_once_after_settling() {
        let (_dir, service, config) = setup(false);
        let input = config.folders[0].join("movie.mp4");
        std::fs::write(&input, vec![0u8; 4096]).unwrap();

        let mut watcher = FolderWatcher::new(service.clone(), config);

        // First pass only records the size.
        assert!(watcher.poll_once().await.is_empty());
        let created = watcher.poll_once().await;
        assert_eq!(created.len(), 1);
        assert!(watcher.poll_once().await.is_empty());

        let job = service.registry().get(&created[0]).await.unwrap();
        assert_eq!(job.output_path.file_name().unwrap(), "movie_converted.mkv");
    }

    #[tokio::test]
    async fn test_outputs_and_rejected_files_not_resubmitted() {
        let (_dir, service, config) = setup(false);
        let folder = config.folders[0].clone();
        std::fs::write(folder.join("done_converted.mkv"), vec![0u8; 4096]).unwrap();
        std::fs::write(folder.join("tiny.mp4"), vec![0u8; 10]).unwrap();

        let mut watcher = FolderWatcher::new(service.clone(), config);
        watcher.poll_once().await;
        assert!(watcher.poll_once().await.is_empty());
        assert!(watcher.poll_once().await.is_empty());
        assert!(service.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_original_deleted_after_completion() {
        let (_dir, service, config) = setup(true);
        let input = config.folders[0].join("movie.mp4");
        std::fs::write(&input, vec![0u8; 4096]).unwrap();

        let mut events = service.registry().subscribe();
        let mut watcher = FolderWatcher::new(service.clone(), config);
        watcher.poll_once().await;
        let created = watcher.poll_once().await;
        assert_eq!(created.len(), 1);

        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .unwrap()
                .unwrap();
            let terminal = event.job.status.is_terminal();
            watcher.handle_event(&event).await;
            if terminal {
                assert_eq!(event.job.status, JobStatus::Completed);
                break;
            }
        }

        assert!(!input.exists());
    }
}
