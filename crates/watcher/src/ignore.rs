//! Ignore rule management
//!
//! Combines three sources of exclusions:
//! 1. The explicit Ignore Set (absolute paths, matching themselves and every
//!    descendant). Grows at runtime through `ignore` commands.
//! 2. Gitignore-style patterns from the configuration, anchored at the watch
//!    root and compiled with the `ignore` crate.
//! 3. Hidden entries (any component below the root starting with `.`) when
//!    `ignoreHiddenFiles` is set.

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use treewatch_core::{normalize, WatchConfig, WatchError};

/// Ignore rule manager
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    /// Watch root; patterns and the hidden rule are relative to it
    root: PathBuf,

    /// Explicitly ignored paths
    paths: BTreeSet<PathBuf>,

    /// Compiled gitignore-style patterns (None when no patterns configured)
    patterns: Option<Gitignore>,

    /// Skip dot-files and dot-directories
    hidden: bool,
}

impl IgnoreRules {
    /// Rules that ignore nothing
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            paths: BTreeSet::new(),
            patterns: None,
            hidden: false,
        }
    }

    /// Load rules for a configuration
    ///
    /// `root` must already be normalized. Relative ignore paths resolve
    /// against the current directory, like every other path.
    pub fn load(root: &Path, config: &WatchConfig) -> Result<Self, WatchError> {
        let mut rules = Self::new(root);
        rules.hidden = config.ignore_hidden_files;

        for path in &config.ignore_paths {
            rules.paths.insert(normalize(path)?);
        }

        if !config.ignore_patterns.is_empty() {
            let mut builder = GitignoreBuilder::new(root);
            for pattern in &config.ignore_patterns {
                builder.add_line(None, pattern).map_err(|e| {
                    WatchError::InvalidConfig(format!("invalid ignore pattern '{}': {}", pattern, e))
                })?;
            }
            let gitignore = builder
                .build()
                .map_err(|e| WatchError::InvalidConfig(format!("ignore patterns: {}", e)))?;
            rules.patterns = Some(gitignore);
        }

        Ok(rules)
    }

    /// Check if path should be ignored
    ///
    /// `is_dir` lets directory-only patterns (`build/`) match.
    pub fn should_ignore(&self, path: &Path, is_dir: bool) -> bool {
        // 1. Explicit ignore set
        if self.is_path_ignored(path) {
            return true;
        }

        // 2. Hidden entries
        if self.hidden && self.is_hidden(path) {
            return true;
        }

        // 3. Patterns (only meaningful below the root they are anchored at)
        if let Some(ref patterns) = self.patterns {
            if path.starts_with(&self.root) && path != self.root {
                return patterns
                    .matched_path_or_any_parents(path, is_dir)
                    .is_ignore();
            }
        }

        false
    }

    /// Path equals or descends from an explicitly ignored path
    pub fn is_path_ignored(&self, path: &Path) -> bool {
        !self.paths.is_empty() && path.ancestors().any(|a| self.paths.contains(a))
    }

    fn is_hidden(&self, path: &Path) -> bool {
        let is_dot = |name: &std::ffi::OsStr| name.to_string_lossy().starts_with('.');

        match path.strip_prefix(&self.root) {
            Ok(relative) => relative.iter().any(is_dot),
            // Outside the root only the entry's own name counts
            Err(_) => path.file_name().map(is_dot).unwrap_or(false),
        }
    }

    /// Add a path to the Ignore Set; returns false if already present
    pub fn add_path(&mut self, path: PathBuf) -> bool {
        self.paths.insert(path)
    }

    /// Drop a path from the Ignore Set so it can be watched again
    pub fn remove_path(&mut self, path: &Path) -> bool {
        self.paths.remove(path)
    }

    /// Explicitly ignored paths in order
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.paths.iter()
    }

    /// Get watch root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get number of active ignore sources
    pub fn active_sources(&self) -> usize {
        let mut count = 0;
        if !self.paths.is_empty() {
            count += 1;
        }
        if self.patterns.is_some() {
            count += 1;
        }
        if self.hidden {
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn config_for(root: &Path) -> WatchConfig {
        WatchConfig::new(root)
    }

    #[test]
    fn test_explicit_paths_cover_descendants() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let mut config = config_for(root);
        config.ignore_paths.push(root.join("cache"));
        let rules = IgnoreRules::load(root, &config).unwrap();

        assert!(rules.should_ignore(&root.join("cache"), true));
        assert!(rules.should_ignore(&root.join("cache/deep/file.bin"), false));
        // Shared string prefix is not a descendant
        assert!(!rules.should_ignore(&root.join("cache2/file.bin"), false));
        assert!(!rules.should_ignore(&root.join("src/main.rs"), false));
    }

    #[test]
    fn test_runtime_additions() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let mut rules = IgnoreRules::new(root);

        assert_eq!(rules.active_sources(), 0);
        assert!(rules.add_path(root.join("b")));
        assert!(!rules.add_path(root.join("b")));
        assert!(rules.should_ignore(&root.join("b/e.txt"), false));

        assert!(rules.remove_path(&root.join("b")));
        assert!(!rules.should_ignore(&root.join("b/e.txt"), false));
    }

    #[test]
    fn test_pattern_matching() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("build")).unwrap();

        let mut config = config_for(root);
        config.ignore_patterns = vec!["*.log".to_string(), "build/".to_string()];
        let rules = IgnoreRules::load(root, &config).unwrap();

        assert!(rules.should_ignore(&root.join("debug.log"), false));
        assert!(rules.should_ignore(&root.join("nested/trace.log"), false));
        assert!(rules.should_ignore(&root.join("build"), true));
        assert!(rules.should_ignore(&root.join("build/output.txt"), false));
        assert!(!rules.should_ignore(&root.join("src/main.rs"), false));

        // Patterns never apply outside the root or to the root itself
        assert!(!rules.should_ignore(Path::new("/elsewhere/debug.log"), false));
        assert!(!rules.should_ignore(root, true));
    }

    #[test]
    fn test_negated_pattern() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let mut config = config_for(root);
        config.ignore_patterns = vec!["*.log".to_string(), "!important.log".to_string()];
        let rules = IgnoreRules::load(root, &config).unwrap();

        assert!(rules.should_ignore(&root.join("debug.log"), false));
        assert!(!rules.should_ignore(&root.join("important.log"), false));
    }

    #[test]
    fn test_hidden_files() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join(".config-root");
        let mut config = config_for(&root);
        config.ignore_hidden_files = true;
        let rules = IgnoreRules::load(&root, &config).unwrap();

        // Root's own dot name does not hide everything below it
        assert!(!rules.should_ignore(&root.join("visible.txt"), false));
        assert!(rules.should_ignore(&root.join(".secret"), false));
        assert!(rules.should_ignore(&root.join(".git/objects/ab"), false));
        assert!(rules.should_ignore(Path::new("/other/.hidden"), false));

        let plain = IgnoreRules::load(&root, &config_for(&root)).unwrap();
        assert!(!plain.should_ignore(&root.join(".secret"), false));
    }

    #[test]
    fn test_active_sources_count() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let mut config = config_for(root);
        config.ignore_hidden_files = true;
        config.ignore_patterns = vec!["*.tmp".to_string()];
        config.ignore_paths = vec![root.join("skip")];
        let rules = IgnoreRules::load(root, &config).unwrap();

        assert_eq!(rules.active_sources(), 3);
        assert_eq!(rules.paths().count(), 1);
    }
}
