//! Event source adapters
//!
//! Provides a unified interface (EventSource trait) over the OS notification
//! facilities. Every backend subscribes single directories non-recursively;
//! recursion is maintained by the watch set. All backends deliver the same
//! [`RawEvent`] shape on one outbound channel.

pub mod notify_source;

use crossbeam_channel::Sender;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use treewatch_core::{BackendKind, WatchConfig, WatchError};

pub use notify_source::NotifySource;

/// Opaque handle for one directory subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Low-level change reported by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    Create,
    Write,
    Remove,
    /// Old name of a rename reported by the kernel
    RenameFrom,
    /// New name of a rename reported by the kernel
    RenameTo,
}

/// One OS notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub path: PathBuf,
    pub kind: RawKind,
    /// Directory hint when the backend knows it
    pub is_dir: Option<bool>,
    /// Kernel rename cookie linking a RenameFrom to its RenameTo
    pub tracker: Option<usize>,
    pub time: Instant,
}

impl RawEvent {
    pub fn new(path: impl Into<PathBuf>, kind: RawKind) -> Self {
        Self {
            path: path.into(),
            kind,
            is_dir: None,
            tracker: None,
            time: Instant::now(),
        }
    }

    pub fn with_dir(mut self, is_dir: Option<bool>) -> Self {
        self.is_dir = is_dir;
        self
    }

    pub fn with_tracker(mut self, tracker: Option<usize>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn at(mut self, time: Instant) -> Self {
        self.time = time;
        self
    }
}

/// Item on a backend's outbound channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Raw(RawEvent),
    /// Asynchronous backend failure, attributed to a path when known
    Failed {
        path: Option<PathBuf>,
        reason: String,
    },
    /// Kernel queue overflowed; events may have been lost
    Overflow,
}

/// Platform-agnostic subscription interface
pub trait EventSource: Send {
    /// Start receiving notifications for the direct entries of `path`
    fn subscribe(&mut self, path: &Path) -> Result<SubscriptionHandle, WatchError>;

    /// Stop receiving notifications for a subscription
    fn unsubscribe(&mut self, handle: SubscriptionHandle) -> Result<(), WatchError>;

    /// Short backend name for diagnostics
    fn backend_name(&self) -> &'static str;
}

/// Builds an event source wired to the given outbound channel
pub type SourceFactory =
    Box<dyn FnOnce(Sender<SourceEvent>) -> Result<Box<dyn EventSource>, WatchError> + Send>;

/// Create the event source selected by the configuration
pub fn create_event_source(
    config: &WatchConfig,
    tx: Sender<SourceEvent>,
) -> Result<Box<dyn EventSource>, WatchError> {
    match config.backend {
        BackendKind::Native => Ok(Box::new(NotifySource::native(tx)?)),
        BackendKind::Poll => Ok(Box::new(NotifySource::polling(tx, config.poll_interval())?)),
    }
}
