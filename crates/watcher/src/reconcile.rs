//! Overflow reconciliation
//!
//! When the kernel drops notifications (inotify `IN_Q_OVERFLOW`, FSEvents
//! `MustScanSubDirs`) the watcher has no idea what happened. The reconciler
//! keeps a baseline of what the controller was last told about, rescans the
//! watch set, and reports the difference as synthetic raw events so they go
//! through the normal coalescing pipeline.

use crate::platform::{RawEvent, RawKind};
use crate::watchset::WatchSet;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};
use treewatch_core::{FileInfo, Op, WatchEvent};

/// Last known state of one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    is_dir: bool,
    size: u64,
    mod_time: Option<DateTime<Utc>>,
}

impl From<&FileInfo> for Entry {
    fn from(info: &FileInfo) -> Self {
        Self {
            is_dir: info.is_dir,
            size: info.size,
            mod_time: info.mod_time,
        }
    }
}

/// Baseline of watched entries, diffed on overflow
#[derive(Debug, Default)]
pub struct Reconciler {
    baseline: HashMap<PathBuf, Entry>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Baseline from a watch set snapshot
    pub fn from_snapshot(snapshot: &[FileInfo]) -> Self {
        Self {
            baseline: snapshot
                .iter()
                .map(|info| (info.path.clone(), Entry::from(info)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.baseline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baseline.is_empty()
    }

    /// Whether the controller has been told `path` exists
    pub fn contains(&self, path: &Path) -> bool {
        self.baseline.contains_key(path)
    }

    /// Keep the baseline in step with events that were resolved normally
    pub fn observe(&mut self, event: &WatchEvent) {
        if let Some(old_path) = &event.old_path {
            self.baseline.remove(old_path);
        }

        match event.op {
            Op::Remove => {
                self.baseline.remove(&event.path);
            }
            Op::Create | Op::Write | Op::Rename | Op::Move => {
                self.baseline.insert(
                    event.path.clone(),
                    Entry {
                        is_dir: event.is_dir,
                        size: event.size,
                        mod_time: event.mod_time,
                    },
                );
            }
        }
    }

    /// Rescan `watch_set` and return raw events for every difference
    ///
    /// The baseline is replaced by the fresh scan.
    pub fn rescan(&mut self, watch_set: &WatchSet) -> Vec<RawEvent> {
        let started = Instant::now();
        let current: HashMap<PathBuf, Entry> = watch_set
            .snapshot()
            .iter()
            .map(|info| (info.path.clone(), Entry::from(info)))
            .collect();

        let now = Instant::now();
        let mut raws = Vec::new();

        for (path, entry) in &current {
            match self.baseline.get(path) {
                None => raws.push(
                    RawEvent::new(path.clone(), RawKind::Create)
                        .with_dir(Some(entry.is_dir))
                        .at(now),
                ),
                Some(old) if old.is_dir != entry.is_dir => {
                    raws.push(
                        RawEvent::new(path.clone(), RawKind::Remove)
                            .with_dir(Some(old.is_dir))
                            .at(now),
                    );
                    raws.push(
                        RawEvent::new(path.clone(), RawKind::Create)
                            .with_dir(Some(entry.is_dir))
                            .at(now),
                    );
                }
                Some(old) if !entry.is_dir && old != entry => raws.push(
                    RawEvent::new(path.clone(), RawKind::Write)
                        .with_dir(Some(false))
                        .at(now),
                ),
                Some(_) => {}
            }
        }

        for (path, old) in &self.baseline {
            if !current.contains_key(path) {
                raws.push(
                    RawEvent::new(path.clone(), RawKind::Remove)
                        .with_dir(Some(old.is_dir))
                        .at(now),
                );
            }
        }

        // Parents before children keeps creates in a sensible order
        raws.sort_by(|a, b| a.path.cmp(&b.path));

        if raws.is_empty() {
            debug!("reconciliation found no missed changes");
        } else {
            info!(
                "reconciliation found {} missed changes in {:?}",
                raws.len(),
                started.elapsed()
            );
        }

        self.baseline = current;
        raws
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ignore::IgnoreRules;
    use crate::watchset::tests::RecordingSource;
    use filetime::{set_file_mtime, FileTime};
    use std::fs;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;
    use treewatch_core::normalize;

    fn setup() -> (TempDir, PathBuf, WatchSet) {
        let temp_dir = TempDir::new().unwrap();
        let root = normalize(temp_dir.path()).unwrap();
        fs::write(root.join("file1.txt"), b"content 1").unwrap();
        fs::write(root.join("file2.txt"), b"content 2").unwrap();

        let set = WatchSet::new(Box::new(RecordingSource::default()), IgnoreRules::new(&root));
        set.add_path(&root, true).unwrap();
        (temp_dir, root, set)
    }

    fn kinds(raws: &[RawEvent]) -> Vec<(String, RawKind)> {
        raws.iter()
            .map(|r| (r.path.file_name().unwrap().to_string_lossy().into_owned(), r.kind))
            .collect()
    }

    #[test]
    fn test_contains_follows_observed_events() {
        let (_temp_dir, root, set) = setup();
        let mut reconciler = Reconciler::from_snapshot(&set.snapshot());
        assert!(reconciler.contains(&root.join("file1.txt")));
        assert!(!reconciler.contains(&root.join("file3.txt")));

        reconciler.observe(&WatchEvent::new(Op::Create, root.join("file3.txt")));
        assert!(reconciler.contains(&root.join("file3.txt")));

        reconciler.observe(
            &WatchEvent::new(Op::Rename, root.join("renamed.txt")).with_old_path(root.join("file3.txt")),
        );
        assert!(!reconciler.contains(&root.join("file3.txt")));
        assert!(reconciler.contains(&root.join("renamed.txt")));

        reconciler.observe(&WatchEvent::new(Op::Remove, root.join("file1.txt")));
        assert!(!reconciler.contains(&root.join("file1.txt")));
    }

    #[test]
    fn test_rescan_finds_missed_changes() {
        let (_temp_dir, root, set) = setup();

        // Backdate so the rewrite is guaranteed to change mtime
        let old_time = SystemTime::now() - Duration::from_secs(600);
        set_file_mtime(root.join("file1.txt"), FileTime::from_system_time(old_time)).unwrap();
        let mut reconciler = Reconciler::from_snapshot(&set.snapshot());

        fs::write(root.join("file1.txt"), b"modified content").unwrap();
        fs::remove_file(root.join("file2.txt")).unwrap();
        fs::write(root.join("file3.txt"), b"new").unwrap();

        let raws = reconciler.rescan(&set);
        assert_eq!(
            kinds(&raws),
            vec![
                ("file1.txt".to_string(), RawKind::Write),
                ("file2.txt".to_string(), RawKind::Remove),
                ("file3.txt".to_string(), RawKind::Create),
            ]
        );

        // Baseline replaced; a second pass is quiet
        assert!(reconciler.rescan(&set).is_empty());
    }

    #[test]
    fn test_rescan_ignores_unchanged_files() {
        let (_temp_dir, _root, set) = setup();
        let mut reconciler = Reconciler::from_snapshot(&set.snapshot());

        assert!(reconciler.rescan(&set).is_empty());
    }

    #[test]
    fn test_observe_tracks_delivered_events() {
        let (_temp_dir, root, set) = setup();
        let mut reconciler = Reconciler::from_snapshot(&set.snapshot());

        fs::rename(root.join("file1.txt"), root.join("renamed.txt")).unwrap();
        let info = FileInfo::from_path(&root.join("renamed.txt"));
        reconciler.observe(
            &WatchEvent::new(Op::Rename, root.join("renamed.txt"))
                .with_old_path(root.join("file1.txt"))
                .with_info(info.as_ref()),
        );

        assert!(reconciler.rescan(&set).is_empty());
    }
}
