//! Watch-folder scanning.
//!
//! Recursively lists video files under the configured watch folders. Hidden
//! directories and hidden files are skipped so in-progress copies written by
//! tools that use dot-prefixed temporary names are never picked up.

use crate::sanitize::is_video_file;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// A video file found in a watch folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCandidate {
    pub path: PathBuf,
    /// File size in bytes at discovery time
    pub size_bytes: u64,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

/// Scan `roots` for video files.
///
/// Missing roots are ignored; unreadable entries are skipped.
pub fn scan_watch_folders(roots: &[PathBuf]) -> Vec<ScanCandidate> {
    let mut candidates = Vec::new();

    for root in roots {
        if !root.is_dir() {
            continue;
        }

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !is_hidden(entry));

        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() || !is_video_file(entry.path()) {
                continue;
            }

            if let Ok(metadata) = entry.metadata() {
                candidates.push(ScanCandidate {
                    path: entry.path().to_path_buf(),
                    size_bytes: metadata.len(),
                });
            }
        }
    }

    candidates
}

/// Whether `path`'s file stem ends with `suffix`, i.e. it looks like an output
/// this daemon produced.
pub fn has_output_suffix(path: &Path, suffix: &str) -> bool {
    !suffix.is_empty()
        && path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|stem| stem.ends_with(suffix))
            .unwrap_or(false)
}
