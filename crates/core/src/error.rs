//! Error taxonomy shared by the engine, the protocol and the client

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Errors produced by watch operations
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// Path does not exist at add time
    #[error("path not found: {}", .0.display())]
    NotFound(PathBuf),

    /// OS-level subscription failure for one path (non-fatal)
    #[error("failed to watch {}: {reason}", path.display())]
    SubscriptionFailed { path: PathBuf, reason: String },

    /// Command issued before `start`
    #[error("watcher has not been started")]
    NotStarted,

    /// `start` issued twice
    #[error("watcher is already started")]
    AlreadyStarted,

    /// Command issued after `stop`
    #[error("watcher has already been stopped")]
    AlreadyStopped,

    /// Malformed frame or unexpected message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The engine process or its threads went away
    #[error("engine crashed: {0}")]
    EngineCrashed(String),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WatchError {
    /// Wire-level classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            WatchError::NotFound(_) => ErrorKind::NotFound,
            WatchError::SubscriptionFailed { .. } => ErrorKind::SubscriptionFailed,
            WatchError::NotStarted => ErrorKind::NotStarted,
            WatchError::AlreadyStarted => ErrorKind::AlreadyStarted,
            WatchError::AlreadyStopped => ErrorKind::AlreadyStopped,
            WatchError::Protocol(_) => ErrorKind::ProtocolError,
            WatchError::EngineCrashed(_) => ErrorKind::EngineCrashed,
            WatchError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            WatchError::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the watcher must be treated as stopped after this error
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind(), ErrorKind::ProtocolError | ErrorKind::EngineCrashed)
    }

    /// Path this error refers to, if any
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            WatchError::NotFound(path) => Some(path),
            WatchError::SubscriptionFailed { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn subscription_failed(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        WatchError::SubscriptionFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Error classification carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    SubscriptionFailed,
    NotStarted,
    AlreadyStarted,
    AlreadyStopped,
    ProtocolError,
    EngineCrashed,
    InvalidConfig,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Serializable form of a [`WatchError`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl From<&WatchError> for ErrorFrame {
    fn from(err: &WatchError) -> Self {
        let message = match err {
            // Keep the raw reason so the round trip does not nest the prefix
            WatchError::SubscriptionFailed { reason, .. } => reason.clone(),
            WatchError::Protocol(msg)
            | WatchError::EngineCrashed(msg)
            | WatchError::InvalidConfig(msg) => msg.clone(),
            other => other.to_string(),
        };

        Self {
            kind: err.kind(),
            message,
            path: err.path().cloned(),
        }
    }
}

impl From<ErrorFrame> for WatchError {
    fn from(frame: ErrorFrame) -> Self {
        let path = frame.path.unwrap_or_default();
        match frame.kind {
            ErrorKind::NotFound => WatchError::NotFound(path),
            ErrorKind::SubscriptionFailed => WatchError::SubscriptionFailed {
                path,
                reason: frame.message,
            },
            ErrorKind::NotStarted => WatchError::NotStarted,
            ErrorKind::AlreadyStarted => WatchError::AlreadyStarted,
            ErrorKind::AlreadyStopped => WatchError::AlreadyStopped,
            ErrorKind::ProtocolError => WatchError::Protocol(frame.message),
            ErrorKind::EngineCrashed => WatchError::EngineCrashed(frame.message),
            ErrorKind::InvalidConfig => WatchError::InvalidConfig(frame.message),
            ErrorKind::Io => WatchError::Io(std::io::Error::other(frame.message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(WatchError::NotStarted.kind(), ErrorKind::NotStarted);
        assert_eq!(
            WatchError::Protocol("bad".into()).kind(),
            ErrorKind::ProtocolError
        );
        assert_eq!(
            WatchError::subscription_failed("/tmp/x", "denied").kind(),
            ErrorKind::SubscriptionFailed
        );
    }

    #[test]
    fn test_terminal_errors() {
        assert!(WatchError::Protocol("bad".into()).is_terminal());
        assert!(WatchError::EngineCrashed("gone".into()).is_terminal());
        assert!(!WatchError::subscription_failed("/tmp/x", "denied").is_terminal());
        assert!(!WatchError::NotFound(PathBuf::from("/tmp/x")).is_terminal());
    }

    #[test]
    fn test_frame_keeps_path_and_reason() {
        let err = WatchError::subscription_failed("/srv/locked", "permission denied");
        let frame = ErrorFrame::from(&err);

        assert_eq!(frame.kind, ErrorKind::SubscriptionFailed);
        assert_eq!(frame.message, "permission denied");
        assert_eq!(frame.path, Some(PathBuf::from("/srv/locked")));

        match WatchError::from(frame) {
            WatchError::SubscriptionFailed { path, reason } => {
                assert_eq!(path, PathBuf::from("/srv/locked"));
                assert_eq!(reason, "permission denied");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_frame_wire_shape() {
        let frame = ErrorFrame::from(&WatchError::NotStarted);
        let json = serde_json::to_value(&frame).unwrap();

        assert_eq!(json["kind"], "NotStarted");
        assert!(json.get("path").is_none());
    }
}
