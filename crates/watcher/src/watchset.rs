//! Watch Set Manager
//!
//! Owns the [`PathTree`] and the event source. Every structural change
//! (add, ignore, remove, live expansion, cascade on removal) happens under a
//! single `parking_lot` mutex; event delivery never takes it.

use crate::ignore::IgnoreRules;
use crate::platform::EventSource;
use crate::tree::PathTree;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use treewatch_core::{normalize, FileInfo, WatchError};
use walkdir::WalkDir;

/// Outcome of adding or expanding a watch
#[derive(Debug, Default)]
pub struct Expansion {
    /// Directories newly subscribed
    pub added: Vec<PathBuf>,
    /// Entries found while expanding, with their directory flag
    ///
    /// Only collected for live expansion of newly created directories.
    pub discovered: Vec<(PathBuf, bool)>,
    /// Per-path failures; siblings were still watched
    pub failures: Vec<WatchError>,
    collect: bool,
}

impl Expansion {
    fn collecting() -> Self {
        Self {
            collect: true,
            ..Self::default()
        }
    }
}

struct State {
    tree: PathTree,
    source: Box<dyn EventSource>,
}

/// Watched directories plus their subscriptions
pub struct WatchSet {
    state: Mutex<State>,
    ignore: Arc<RwLock<IgnoreRules>>,
    backend: &'static str,
}

impl WatchSet {
    pub fn new(source: Box<dyn EventSource>, ignore: IgnoreRules) -> Self {
        let backend = source.backend_name();
        Self {
            state: Mutex::new(State {
                tree: PathTree::new(),
                source,
            }),
            ignore: Arc::new(RwLock::new(ignore)),
            backend,
        }
    }

    /// Shared handle to the ignore rules (read by the filter stage)
    pub fn ignore_rules(&self) -> Arc<RwLock<IgnoreRules>> {
        Arc::clone(&self.ignore)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend
    }

    /// Number of watched directories
    pub fn len(&self) -> usize {
        self.state.lock().tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().tree.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.state.lock().tree.contains(path)
    }

    /// Path is a watched directory or a direct entry of one
    pub fn is_tracked(&self, path: &Path) -> bool {
        let state = self.state.lock();
        state.tree.contains(path) || path.parent().map_or(false, |p| state.tree.contains(p))
    }

    /// Watched directories with their recursive flag, in path order
    pub fn nodes(&self) -> Vec<(PathBuf, bool)> {
        self.state
            .lock()
            .tree
            .nodes()
            .map(|node| (node.path.clone(), node.recursive))
            .collect()
    }

    /// Start watching `path`
    ///
    /// Fails with `NotFound` if the path does not exist. A path already
    /// covered by a recursive watch is a successful no-op. Recursive watches
    /// enumerate the existing tree breadth-first before returning; a
    /// subdirectory that cannot be subscribed is reported in
    /// [`Expansion::failures`] and skipped.
    pub fn add_path(&self, path: &Path, recursive: bool) -> Result<Expansion, WatchError> {
        let path = normalize(path)?;
        let metadata = std::fs::metadata(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => WatchError::NotFound(path.clone()),
            _ => WatchError::Io(e),
        })?;

        {
            let mut ignore = self.ignore.write();
            if ignore.remove_path(&path) {
                debug!("{} is no longer ignored", path.display());
            }
            if ignore.is_path_ignored(&path) {
                debug!("{} lies under an ignored path, not watching", path.display());
                return Ok(Expansion::default());
            }
        }

        let mut state = self.state.lock();
        let already = match state.tree.get(&path) {
            Some(node) => node.recursive || !recursive || state.tree.recursive_cover(&path).is_some(),
            // Files are seen through their watched parent directory
            None => !metadata.is_dir() && path.parent().map_or(false, |p| state.tree.contains(p)),
        };
        if already {
            debug!("{} is already watched", path.display());
            return Ok(Expansion::default());
        }

        let mut expansion = Expansion::default();
        self.expand(&mut state, &path, recursive, metadata.is_dir(), &mut expansion)?;

        debug!(
            "watching {} ({} directories added, {} failures)",
            path.display(),
            expansion.added.len(),
            expansion.failures.len()
        );
        Ok(expansion)
    }

    /// Subscribe `root` and, for recursive watches, everything below it
    ///
    /// Failure to subscribe `root` itself is returned; failures below it
    /// are collected.
    fn expand(
        &self,
        state: &mut State,
        root: &Path,
        recursive: bool,
        root_is_dir: bool,
        expansion: &mut Expansion,
    ) -> Result<(), WatchError> {
        let ignore = self.ignore.read();
        let mut queue = VecDeque::from([root.to_path_buf()]);

        while let Some(dir) = queue.pop_front() {
            let handle = match state.tree.get(&dir) {
                Some(existing) => existing.handle,
                None => match state.source.subscribe(&dir) {
                    Ok(handle) => {
                        expansion.added.push(dir.clone());
                        handle
                    }
                    Err(e) if dir == root => return Err(e),
                    Err(e) => {
                        warn!("skipping {}: {}", dir.display(), e);
                        expansion.failures.push(e);
                        continue;
                    }
                },
            };
            state.tree.insert(dir.clone(), recursive, handle);

            if dir == root && !root_is_dir {
                continue;
            }

            for entry in WalkDir::new(&dir)
                .min_depth(1)
                .max_depth(1)
                .follow_links(false)
                .sort_by_file_name()
            {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        let path = e.path().unwrap_or(dir.as_path()).to_path_buf();
                        warn!("failed to list {}: {}", path.display(), e);
                        expansion
                            .failures
                            .push(WatchError::subscription_failed(path, e));
                        continue;
                    }
                };

                let child = entry.path();
                let child_is_dir = entry.file_type().is_dir();
                if ignore.should_ignore(child, child_is_dir) {
                    trace!("not expanding ignored {}", child.display());
                    continue;
                }

                if expansion.collect {
                    expansion.discovered.push((child.to_path_buf(), child_is_dir));
                }

                let covered = state.tree.get(child).map_or(false, |node| node.recursive);
                if recursive && child_is_dir && !covered {
                    queue.push_back(child.to_path_buf());
                }
            }
        }

        Ok(())
    }

    /// Stop watching `path` and everything below it, and keep it out
    ///
    /// Returns true if a watch was removed. Paths that were not watched are
    /// still added to the Ignore Set.
    pub fn ignore(&self, path: &Path) -> Result<bool, WatchError> {
        let path = normalize(path)?;
        self.ignore.write().add_path(path.clone());

        let removed = self.unwatch(&path);
        debug!("ignored {} ({} watches removed)", path.display(), removed);
        Ok(removed > 0)
    }

    /// Stop watching `path` and everything below it without ignoring it
    pub fn remove(&self, path: &Path) -> Result<bool, WatchError> {
        let path = normalize(path)?;
        let removed = self.unwatch(&path);
        debug!("unwatched {} ({} watches removed)", path.display(), removed);
        Ok(removed > 0)
    }

    fn unwatch(&self, path: &Path) -> usize {
        let mut state = self.state.lock();
        let removed = state.tree.remove_subtree(path);
        for node in &removed {
            if let Err(e) = state.source.unsubscribe(node.handle) {
                warn!("failed to unsubscribe {}: {}", node.path.display(), e);
            }
        }
        removed.len()
    }

    /// A directory appeared; watch it if a recursive ancestor covers it
    pub fn on_dir_created(&self, path: &Path) -> Expansion {
        let mut expansion = Expansion::collecting();
        let mut state = self.state.lock();

        let covered = path
            .parent()
            .map_or(false, |parent| state.tree.recursive_cover(parent).is_some());
        if !covered || state.tree.contains(path) {
            return expansion;
        }
        if self.ignore.read().should_ignore(path, true) {
            trace!("new directory {} is ignored", path.display());
            return expansion;
        }

        match self.expand(&mut state, path, true, true, &mut expansion) {
            Ok(()) => debug!(
                "auto-watching new directory {} ({} entries inside)",
                path.display(),
                expansion.discovered.len()
            ),
            // Already gone again
            Err(WatchError::NotFound(_)) => trace!("{} vanished before subscribe", path.display()),
            Err(e) => {
                warn!("failed to watch new directory {}: {}", path.display(), e);
                expansion.failures.push(e);
            }
        }
        expansion
    }

    /// A watched directory disappeared; drop it and its descendants
    pub fn on_dir_removed(&self, path: &Path) -> usize {
        let removed = self.unwatch(path);
        if removed > 0 {
            debug!("{} removed, dropped {} watches", path.display(), removed);
        }
        removed
    }

    /// Re-walk recursive watches after events may have been lost
    ///
    /// Drops watches whose directory is gone and subscribes directories
    /// that appeared unnoticed.
    pub fn refresh(&self) -> Expansion {
        let mut expansion = Expansion::default();
        let mut state = self.state.lock();

        let vanished: Vec<PathBuf> = state
            .tree
            .nodes()
            .filter(|node| !node.path.exists())
            .map(|node| node.path.clone())
            .collect();
        for path in vanished {
            for node in state.tree.remove_subtree(&path) {
                // The directory is gone, so the backend may already have dropped it
                if let Err(e) = state.source.unsubscribe(node.handle) {
                    trace!("unsubscribe vanished {}: {}", node.path.display(), e);
                }
            }
        }

        // Each existing node lists only its own entries, so every
        // recursive node is revisited
        let recursive: Vec<PathBuf> = state
            .tree
            .nodes()
            .filter(|node| node.recursive)
            .map(|node| node.path.clone())
            .collect();

        for dir in recursive {
            if let Err(e) = self.expand(&mut state, &dir, true, true, &mut expansion) {
                expansion.failures.push(e);
            }
        }
        expansion
    }

    /// Every watched directory and its direct entries, sorted
    ///
    /// Ignored entries are left out. Reflects every mutation that completed
    /// before the call.
    pub fn snapshot(&self) -> Vec<FileInfo> {
        let dirs: Vec<PathBuf> = self
            .state
            .lock()
            .tree
            .nodes()
            .map(|node| node.path.clone())
            .collect();
        let ignore = self.ignore.read();

        let mut files = BTreeMap::new();
        for dir in dirs {
            let Some(info) = FileInfo::from_path(&dir) else {
                continue;
            };
            let is_dir = info.is_dir;
            files.insert(dir.clone(), info);
            if !is_dir {
                continue;
            }

            for entry in WalkDir::new(&dir)
                .min_depth(1)
                .max_depth(1)
                .follow_links(false)
                .into_iter()
                .filter_map(Result::ok)
            {
                let path = entry.path();
                if ignore.should_ignore(path, entry.file_type().is_dir()) || files.contains_key(path) {
                    continue;
                }
                if let Some(info) = FileInfo::from_path(path) {
                    files.insert(path.to_path_buf(), info);
                }
            }
        }

        files.into_values().collect()
    }

    /// Unsubscribe everything
    pub fn close(&self) {
        let mut state = self.state.lock();
        let roots: Vec<PathBuf> = state.tree.roots().map(|node| node.path.clone()).collect();
        for root in roots {
            for node in state.tree.remove_subtree(&root) {
                if let Err(e) = state.source.unsubscribe(node.handle) {
                    trace!("unsubscribe {} on close: {}", node.path.display(), e);
                }
            }
        }
        debug!("watch set closed");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::platform::SubscriptionHandle;
    use std::collections::HashSet;
    use std::fs;
    use tempfile::TempDir;

    /// Event source that records subscriptions and can refuse paths
    #[derive(Default)]
    pub(crate) struct RecordingSource {
        pub active: Arc<Mutex<BTreeMap<SubscriptionHandle, PathBuf>>>,
        pub refuse: HashSet<PathBuf>,
        next: u64,
    }

    impl EventSource for RecordingSource {
        fn subscribe(&mut self, path: &Path) -> Result<SubscriptionHandle, WatchError> {
            if self.refuse.contains(path) {
                return Err(WatchError::subscription_failed(path, "permission denied"));
            }
            self.next += 1;
            let handle = SubscriptionHandle::new(self.next);
            self.active.lock().insert(handle, path.to_path_buf());
            Ok(handle)
        }

        fn unsubscribe(&mut self, handle: SubscriptionHandle) -> Result<(), WatchError> {
            match self.active.lock().remove(&handle) {
                Some(_) => Ok(()),
                None => Err(WatchError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    "no such subscription",
                ))),
            }
        }

        fn backend_name(&self) -> &'static str {
            "recording"
        }
    }

    fn fixture() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let root = normalize(temp_dir.path()).unwrap();
        fs::create_dir_all(root.join("b/c")).unwrap();
        fs::create_dir_all(root.join("d")).unwrap();
        fs::write(root.join("top.txt"), b"1").unwrap();
        fs::write(root.join("b/one.txt"), b"1").unwrap();
        fs::write(root.join("b/c/two.txt"), b"1").unwrap();
        (temp_dir, root)
    }

    fn watch_set(root: &Path) -> (WatchSet, Arc<Mutex<BTreeMap<SubscriptionHandle, PathBuf>>>) {
        let source = RecordingSource::default();
        let active = Arc::clone(&source.active);
        (WatchSet::new(Box::new(source), IgnoreRules::new(root)), active)
    }

    #[test]
    fn test_recursive_add_covers_existing_tree() {
        let (_temp_dir, root) = fixture();
        let (set, active) = watch_set(&root);

        let expansion = set.add_path(&root, true).unwrap();
        assert_eq!(expansion.added.len(), 4);
        assert!(expansion.failures.is_empty());
        assert_eq!(active.lock().len(), 4);
        assert!(set.contains(&root.join("b/c")));

        let snapshot: Vec<PathBuf> = set.snapshot().into_iter().map(|f| f.path).collect();
        for expected in ["top.txt", "b/one.txt", "b/c/two.txt", "d"] {
            assert!(snapshot.contains(&root.join(expected)), "missing {}", expected);
        }
        let mut sorted = snapshot.clone();
        sorted.sort();
        assert_eq!(snapshot, sorted);
    }

    #[test]
    fn test_non_recursive_add() {
        let (_temp_dir, root) = fixture();
        let (set, _) = watch_set(&root);

        set.add_path(&root, false).unwrap();
        assert_eq!(set.len(), 1);
        let snapshot: Vec<PathBuf> = set.snapshot().into_iter().map(|f| f.path).collect();
        assert!(snapshot.contains(&root.join("b")));
        assert!(!snapshot.contains(&root.join("b/one.txt")));
    }

    #[test]
    fn test_add_missing_path() {
        let (_temp_dir, root) = fixture();
        let (set, _) = watch_set(&root);

        assert!(matches!(
            set.add_path(&root.join("nope"), true),
            Err(WatchError::NotFound(_))
        ));
    }

    #[test]
    fn test_add_covered_path_is_noop() {
        let (_temp_dir, root) = fixture();
        let (set, active) = watch_set(&root);

        set.add_path(&root, true).unwrap();
        let before = active.lock().len();
        let expansion = set.add_path(&root.join("b"), true).unwrap();
        assert!(expansion.added.is_empty());
        assert_eq!(active.lock().len(), before);
    }

    #[test]
    fn test_failed_subdirectory_does_not_abort() {
        let (_temp_dir, root) = fixture();
        let mut source = RecordingSource::default();
        source.refuse.insert(root.join("b"));
        let set = WatchSet::new(Box::new(source), IgnoreRules::new(&root));

        let expansion = set.add_path(&root, true).unwrap();
        assert_eq!(expansion.failures.len(), 1);
        assert_eq!(expansion.failures[0].path(), Some(&root.join("b")));
        assert!(set.contains(&root.join("d")));
        assert!(!set.contains(&root.join("b")));
    }

    #[test]
    fn test_ignore_cascades_and_reports() {
        let (_temp_dir, root) = fixture();
        let (set, active) = watch_set(&root);
        set.add_path(&root, true).unwrap();

        assert!(set.ignore(&root.join("b")).unwrap());
        assert!(!set.contains(&root.join("b")));
        assert!(!set.contains(&root.join("b/c")));
        assert_eq!(active.lock().len(), 2);

        // Not watched any more, still not an error
        assert!(!set.ignore(&root.join("b")).unwrap());
        assert!(!set.ignore(&root.join("never/there")).unwrap());

        let snapshot: Vec<PathBuf> = set.snapshot().into_iter().map(|f| f.path).collect();
        assert!(!snapshot.iter().any(|p| p.starts_with(root.join("b"))));
    }

    #[test]
    fn test_ignored_directory_not_auto_watched() {
        let (_temp_dir, root) = fixture();
        let (set, _) = watch_set(&root);
        set.add_path(&root, true).unwrap();
        set.ignore(&root.join("b")).unwrap();

        fs::create_dir_all(root.join("b/new")).unwrap();
        let expansion = set.on_dir_created(&root.join("b/new"));
        assert!(expansion.added.is_empty());
        assert!(!set.contains(&root.join("b/new")));
    }

    #[test]
    fn test_readding_ignored_path() {
        let (_temp_dir, root) = fixture();
        let (set, _) = watch_set(&root);
        set.add_path(&root, true).unwrap();
        set.ignore(&root.join("b")).unwrap();

        set.add_path(&root.join("b"), true).unwrap();
        assert!(set.contains(&root.join("b/c")));
    }

    #[test]
    fn test_on_dir_created_expands_and_discovers() {
        let (_temp_dir, root) = fixture();
        let (set, _) = watch_set(&root);
        set.add_path(&root, true).unwrap();

        fs::create_dir_all(root.join("fresh/inner")).unwrap();
        fs::write(root.join("fresh/inner/file.txt"), b"x").unwrap();

        let expansion = set.on_dir_created(&root.join("fresh"));
        assert_eq!(expansion.added.len(), 2);
        assert!(expansion
            .discovered
            .contains(&(root.join("fresh/inner/file.txt"), false)));
        assert!(expansion.discovered.contains(&(root.join("fresh/inner"), true)));
        assert!(set.contains(&root.join("fresh/inner")));
    }

    #[test]
    fn test_on_dir_created_without_recursive_ancestor() {
        let (_temp_dir, root) = fixture();
        let (set, _) = watch_set(&root);
        set.add_path(&root, false).unwrap();

        fs::create_dir(root.join("fresh")).unwrap();
        assert!(set.on_dir_created(&root.join("fresh")).added.is_empty());
        assert!(!set.contains(&root.join("fresh")));
    }

    #[test]
    fn test_on_dir_removed_cascades() {
        let (_temp_dir, root) = fixture();
        let (set, active) = watch_set(&root);
        set.add_path(&root, true).unwrap();

        fs::remove_dir_all(root.join("b")).unwrap();
        assert_eq!(set.on_dir_removed(&root.join("b")), 2);
        assert_eq!(active.lock().len(), 2);
    }

    #[test]
    fn test_refresh_picks_up_missed_directories() {
        let (_temp_dir, root) = fixture();
        let (set, _) = watch_set(&root);
        set.add_path(&root, true).unwrap();

        fs::remove_dir_all(root.join("d")).unwrap();
        fs::create_dir(root.join("e")).unwrap();

        let expansion = set.refresh();
        assert_eq!(expansion.added, vec![root.join("e")]);
        assert!(!set.contains(&root.join("d")));
    }

    #[test]
    fn test_refresh_prunes_watch_the_backend_already_dropped() {
        let (_temp_dir, root) = fixture();
        let (set, active) = watch_set(&root);
        set.add_path(&root, true).unwrap();

        // Backends forget a subscription once its directory is deleted
        fs::remove_dir_all(root.join("b")).unwrap();
        active.lock().retain(|_, path| !path.starts_with(root.join("b")));

        let expansion = set.refresh();
        assert!(expansion.failures.is_empty());
        assert!(!set.contains(&root.join("b")));
        assert!(!set.contains(&root.join("b/c")));
        assert!(set.contains(&root.join("d")));
        assert_eq!(active.lock().len(), 2);
    }

    #[test]
    fn test_close_unsubscribes_everything() {
        let (_temp_dir, root) = fixture();
        let (set, active) = watch_set(&root);
        set.add_path(&root, true).unwrap();

        set.close();
        assert!(set.is_empty());
        assert!(active.lock().is_empty());
    }
}
