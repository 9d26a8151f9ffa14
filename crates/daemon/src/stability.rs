//! Size-stability tracking for watch-folder candidates.
//!
//! A file is considered fully written once its size has stayed the same for a
//! configured window across consecutive polls.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Result of a stability check on a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityResult {
    /// Size unchanged for at least the stability window.
    Stable,
    /// Size unchanged so far, but not for long enough.
    Settling,
    /// Size changed since the previous observation (or first sighting).
    Unstable {
        initial_size: u64,
        current_size: u64,
    },
}

/// Compare two file sizes.
#[inline]
pub fn compare_sizes(initial_size: u64, current_size: u64) -> StabilityResult {
    if initial_size == current_size {
        StabilityResult::Stable
    } else {
        StabilityResult::Unstable {
            initial_size,
            current_size,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    size: u64,
    since: Instant,
}

/// Remembers the last size seen for each path.
#[derive(Debug, Default)]
pub struct StabilityTracker {
    window: Duration,
    seen: HashMap<PathBuf, Observation>,
}

impl StabilityTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Record `size` for `path` at `now` and report whether it is stable.
    ///
    /// A first sighting is reported as unstable from size 0.
    pub fn observe(&mut self, path: &Path, size: u64, now: Instant) -> StabilityResult {
        let Some(previous) = self.seen.get(path).copied() else {
            self.seen.insert(path.to_path_buf(), Observation { size, since: now });
            return StabilityResult::Unstable {
                initial_size: 0,
                current_size: size,
            };
        };

        match compare_sizes(previous.size, size) {
            StabilityResult::Stable if now.duration_since(previous.since) >= self.window => {
                StabilityResult::Stable
            }
            StabilityResult::Stable => StabilityResult::Settling,
            unstable => {
                self.seen.insert(path.to_path_buf(), Observation { size, since: now });
                unstable
            }
        }
    }

    /// Stop tracking `path`.
    pub fn forget(&mut self, path: &Path) {
        self.seen.remove(path);
    }

    /// Drop entries for paths not in `present`.
    pub fn retain_present(&mut self, present: &[PathBuf]) {
        self.seen.retain(|path, _| present.contains(path));
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_stability_size_comparison(initial_size: u64, current_size: u64) {
            let result = compare_sizes(initial_size, current_size);

            if initial_size == current_size {
                prop_assert_eq!(result, StabilityResult::Stable);
            } else {
                prop_assert_eq!(result, StabilityResult::Unstable { initial_size, current_size });
            }
        }
    }

    #[test]
    fn test_first_sighting_is_unstable() {
        let mut tracker = StabilityTracker::new(Duration::from_secs(2));
        let now = Instant::now();
        assert_eq!(
            tracker.observe(Path::new("/w/a.mkv"), 100, now),
            StabilityResult::Unstable {
                initial_size: 0,
                current_size: 100
            }
        );
    }

    #[test]
    fn test_stable_after_window() {
        let mut tracker = StabilityTracker::new(Duration::from_secs(2));
        let path = Path::new("/w/a.mkv");
        let t0 = Instant::now();

        tracker.observe(path, 100, t0);
        assert_eq!(
            tracker.observe(path, 100, t0 + Duration::from_secs(1)),
            StabilityResult::Settling
        );
        assert_eq!(
            tracker.observe(path, 100, t0 + Duration::from_secs(2)),
            StabilityResult::Stable
        );
    }

    #[test]
    fn test_growth_restarts_window() {
        let mut tracker = StabilityTracker::new(Duration::from_secs(2));
        let path = Path::new("/w/a.mkv");
        let t0 = Instant::now();

        tracker.observe(path, 100, t0);
        assert_eq!(
            tracker.observe(path, 200, t0 + Duration::from_secs(3)),
            StabilityResult::Unstable {
                initial_size: 100,
                current_size: 200
            }
        );
        assert_eq!(
            tracker.observe(path, 200, t0 + Duration::from_secs(4)),
            StabilityResult::Settling
        );
        assert_eq!(
            tracker.observe(path, 200, t0 + Duration::from_secs(5)),
            StabilityResult::Stable
        );
    }

    #[test]
    fn test_retain_and_forget() {
        let mut tracker = StabilityTracker::new(Duration::ZERO);
        let now = Instant::now();
        tracker.observe(Path::new("/w/a.mkv"), 1, now);
        tracker.observe(Path::new("/w/b.mkv"), 1, now);

        tracker.retain_present(&[PathBuf::from("/w/a.mkv")]);
        assert_eq!(tracker.len(), 1);
        tracker.forget(Path::new("/w/a.mkv"));
        assert!(tracker.is_empty());
    }
}
