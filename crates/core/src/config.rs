//! Watch configuration accepted by `start`

use crate::error::WatchError;
use crate::op::FilterSet;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default coalescing window in milliseconds
pub const DEFAULT_INTERVAL_MS: u64 = 500;

/// Default poll period for the polling backend in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default capacity of the event delivery queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Watch configuration
///
/// Field names are camelCase on the wire. Unknown fields (for example a
/// launcher's `binPath`) are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    /// Root path to watch
    pub path: PathBuf,

    /// Watch subdirectories, including ones created later (default: false)
    #[serde(default)]
    pub recursive: bool,

    /// Operations to deliver (default: all)
    #[serde(default)]
    pub filters: FilterSet,

    /// Absolute paths excluded from subscription and delivery
    #[serde(default, alias = "ignore")]
    pub ignore_paths: Vec<PathBuf>,

    /// Gitignore-style patterns excluded from delivery
    #[serde(default)]
    pub ignore_patterns: Vec<String>,

    /// Skip dot-files and dot-directories below the root (default: false)
    #[serde(default)]
    pub ignore_hidden_files: bool,

    /// Regex hooks every delivered path must match
    #[serde(default)]
    pub filter_hooks: Vec<FilterHook>,

    /// Coalescing window in milliseconds (default: 500)
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Verbose diagnostics
    #[serde(default)]
    pub debug: bool,

    /// Event source backend (default: native)
    #[serde(default)]
    pub backend: BackendKind,

    /// Poll period in milliseconds for the polling backend (default: 1000)
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Capacity of the delivery queue before producers block (default: 1024)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Rename and move inference rules
    #[serde(default)]
    pub rename: RenameRules,
}

impl WatchConfig {
    /// Configuration with defaults for everything but the path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            recursive: false,
            filters: FilterSet::all(),
            ignore_paths: Vec::new(),
            ignore_patterns: Vec::new(),
            ignore_hidden_files: false,
            filter_hooks: Vec::new(),
            interval: DEFAULT_INTERVAL_MS,
            debug: false,
            backend: BackendKind::default(),
            poll_interval: DEFAULT_POLL_INTERVAL_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            rename: RenameRules::default(),
        }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn filters(mut self, filters: FilterSet) -> Self {
        self.filters = filters;
        self
    }

    pub fn interval_ms(mut self, interval: u64) -> Self {
        self.interval = interval;
        self
    }

    /// Coalescing window
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval)
    }

    /// Window within which a remove and a create may pair into a rename
    pub fn rename_window(&self) -> Duration {
        Duration::from_millis(self.rename.window.unwrap_or(self.interval))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), WatchError> {
        if self.path.as_os_str().is_empty() {
            return Err(WatchError::InvalidConfig("path must not be empty".into()));
        }

        if self.interval == 0 {
            return Err(WatchError::InvalidConfig(
                "interval must be at least 1ms".into(),
            ));
        }

        if self.queue_capacity == 0 {
            return Err(WatchError::InvalidConfig(
                "queueCapacity must be at least 1".into(),
            ));
        }

        if self.backend == BackendKind::Poll && self.poll_interval == 0 {
            return Err(WatchError::InvalidConfig(
                "pollInterval must be at least 1ms".into(),
            ));
        }

        for hook in &self.filter_hooks {
            regex::Regex::new(&hook.reg).map_err(|e| {
                WatchError::InvalidConfig(format!("invalid filter hook '{}': {}", hook.reg, e))
            })?;
        }

        Ok(())
    }
}

/// Regex path filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterHook {
    /// Regular expression
    pub reg: String,

    /// Match against the full path instead of the file name
    #[serde(default)]
    pub use_full_path: bool,
}

/// Event source backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Kernel notifications (inotify, FSEvents, kqueue, ReadDirectoryChangesW)
    #[default]
    Native,
    /// Periodic directory scans
    Poll,
}

/// Rename and move inference rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameRules {
    /// Pair a plain remove with a plain create inside one window (default: true)
    #[serde(default = "default_true")]
    pub infer_from_remove_create: bool,

    /// Allow inferred pairs across parent directories (default: true)
    #[serde(default = "default_true")]
    pub cross_directory: bool,

    /// Pairing window in milliseconds (default: the coalescing interval)
    #[serde(default)]
    pub window: Option<u64>,
}

impl Default for RenameRules {
    fn default() -> Self {
        Self {
            infer_from_remove_create: true,
            cross_directory: true,
            window: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_MS
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Op;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: WatchConfig = serde_json::from_str(r#"{"path": "/tmp/a"}"#).unwrap();

        assert_eq!(config.path, PathBuf::from("/tmp/a"));
        assert!(!config.recursive);
        assert!(config.filters.is_empty());
        assert_eq!(config.interval(), Duration::from_millis(500));
        assert_eq!(config.rename_window(), Duration::from_millis(500));
        assert_eq!(config.backend, BackendKind::Native);
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert!(config.rename.infer_from_remove_create);
        assert!(config.rename.cross_directory);
        assert_eq!(config, WatchConfig::new("/tmp/a"));
    }

    #[test]
    fn test_controller_json() {
        let config: WatchConfig = serde_json::from_str(
            r#"{
                "path": "/home/user/Documents",
                "recursive": true,
                "filters": ["create", "write", "rename"],
                "ignore": ["/home/user/Documents/cache"],
                "ignoreHiddenFiles": true,
                "filterHooks": [{"reg": "\\.txt$", "useFullPath": false}],
                "interval": 100,
                "debug": true,
                "binPath": "/opt/treewatch/bin"
            }"#,
        )
        .unwrap();

        assert!(config.recursive);
        assert!(config.filters.allows(Op::Rename));
        assert!(!config.filters.allows(Op::Remove));
        assert_eq!(config.ignore_paths, vec![PathBuf::from("/home/user/Documents/cache")]);
        assert!(config.ignore_hidden_files);
        assert_eq!(config.filter_hooks.len(), 1);
        assert_eq!(config.interval(), Duration::from_millis(100));
        assert!(config.debug);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rename_window_override() {
        let mut config = WatchConfig::new("/tmp/a").interval_ms(200);
        assert_eq!(config.rename_window(), Duration::from_millis(200));

        config.rename.window = Some(50);
        assert_eq!(config.rename_window(), Duration::from_millis(50));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(WatchConfig::new("").validate().is_err());
        assert!(WatchConfig::new("/tmp/a").interval_ms(0).validate().is_err());

        let mut config = WatchConfig::new("/tmp/a");
        config.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = WatchConfig::new("/tmp/a");
        config.filter_hooks.push(FilterHook {
            reg: "([unclosed".into(),
            use_full_path: false,
        });
        assert!(matches!(config.validate(), Err(WatchError::InvalidConfig(_))));
    }
}
