//! The `ProcessingFile` guard (§4.7, §5): an at-most-one-in-flight map
//! keyed by path, with a cooldown window after completion so the same
//! write burst doesn't re-trigger the pipeline mid-cooldown.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const COOLDOWN: Duration = Duration::from_secs(30);
pub const REAPER_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct Entry {
    end_time: Option<DateTime<Utc>>,
}

/// Concurrent-safe map of in-flight/recently-completed file paths.
#[derive(Default)]
pub struct ProcessingFiles {
    entries: Mutex<HashMap<PathBuf, Entry>>,
}

impl ProcessingFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if this path should be skipped: either still in flight
    /// (`end_time` unset) or within the cooldown window of its last
    /// completion.
    pub fn should_skip(&self, path: &Path) -> bool {
        let entries = self.entries.lock();
        match entries.get(path) {
            Some(Entry { end_time: None }) => true,
            Some(Entry {
                end_time: Some(end),
            }) => Utc::now().signed_duration_since(*end).to_std().unwrap_or(Duration::ZERO) < COOLDOWN,
            None => false,
        }
    }

    /// Mark a path as in-flight. Call before enqueuing the processing job.
    pub fn mark_in_flight(&self, path: PathBuf) {
        self.entries.lock().insert(path, Entry { end_time: None });
    }

    /// Mark a path's processing as finished, starting its cooldown clock.
    pub fn mark_done(&self, path: &Path) {
        if let Some(entry) = self.entries.lock().get_mut(path) {
            entry.end_time = Some(Utc::now());
        }
    }

    /// Remove entries whose cooldown has fully elapsed. Run periodically
    /// by the reaper task.
    pub fn reap(&self) {
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| match entry.end_time {
            None => true,
            Some(end) => {
                Utc::now()
                    .signed_duration_since(end)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    < COOLDOWN
            }
        });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_entries_are_skipped() {
        let files = ProcessingFiles::new();
        let path = PathBuf::from("/data/a.csv");
        files.mark_in_flight(path.clone());
        assert!(files.should_skip(&path));
    }

    #[test]
    fn completed_entry_is_not_skipped_after_cooldown_elapses_conceptually() {
        let files = ProcessingFiles::new();
        let path = PathBuf::from("/data/a.csv");
        files.mark_in_flight(path.clone());
        files.mark_done(&path);
        // Within cooldown, still skipped.
        assert!(files.should_skip(&path));
    }

    #[test]
    fn reap_drops_entries_whose_cooldown_has_expired() {
        let files = ProcessingFiles::new();
        let path = PathBuf::from("/data/a.csv");
        files.entries.lock().insert(
            path.clone(),
            Entry {
                end_time: Some(Utc::now() - chrono::Duration::seconds(31)),
            },
        );
        files.reap();
        assert_eq!(files.len(), 0);
    }

    #[test]
    fn reap_keeps_in_flight_entries() {
        let files = ProcessingFiles::new();
        let path = PathBuf::from("/data/a.csv");
        files.mark_in_flight(path);
        files.reap();
        assert_eq!(files.len(), 1);
    }
}
