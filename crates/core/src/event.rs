//! Coalesced change events and file info records

use crate::op::Op;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Point-in-time description of one file or directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<DateTime<Utc>>,
    pub is_dir: bool,
}

impl FileInfo {
    /// Stat `path` without following symlinks
    ///
    /// Returns None if the path no longer exists.
    pub fn from_path(path: &Path) -> Option<Self> {
        let metadata = std::fs::symlink_metadata(path).ok()?;
        Some(Self {
            path: path.to_path_buf(),
            name: file_name(path),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            mod_time: metadata.modified().ok().map(DateTime::<Utc>::from),
            is_dir: metadata.is_dir(),
        })
    }
}

/// One change delivered to the controller
///
/// At most one event is produced per path per coalescing window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchEvent {
    pub op: Op,
    pub path: PathBuf,
    /// Prior path for Rename and Move
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<PathBuf>,
    pub is_dir: bool,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<DateTime<Utc>>,
    /// Close of the coalescing window that produced this event
    pub timestamp: DateTime<Utc>,
}

impl WatchEvent {
    pub fn new(op: Op, path: impl Into<PathBuf>) -> Self {
        Self {
            op,
            path: path.into(),
            old_path: None,
            is_dir: false,
            size: 0,
            mod_time: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_old_path(mut self, old_path: impl Into<PathBuf>) -> Self {
        self.old_path = Some(old_path.into());
        self
    }

    pub fn with_dir(mut self, is_dir: bool) -> Self {
        self.is_dir = is_dir;
        self
    }

    /// Fill size and modification time from a fresh stat, when available
    pub fn with_info(mut self, info: Option<&FileInfo>) -> Self {
        if let Some(info) = info {
            self.is_dir = info.is_dir;
            self.size = info.size;
            self.mod_time = info.mod_time;
        }
        self
    }

    /// File name of the event path
    pub fn name(&self) -> String {
        file_name(&self.path)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
