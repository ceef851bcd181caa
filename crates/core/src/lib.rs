//! Shared vocabulary for treewatch
//!
//! This crate provides the types every other crate speaks:
//! - Operation kinds and the filter set
//! - Coalesced change events and file info records
//! - The error taxonomy and its wire form
//! - Watch configuration
//! - Path normalization

pub mod config;
pub mod error;
pub mod event;
pub mod op;
pub mod path;

// Re-exports
pub use config::{BackendKind, FilterHook, RenameRules, WatchConfig};
pub use error::{ErrorFrame, ErrorKind, WatchError};
pub use event::{FileInfo, WatchEvent};
pub use op::{FilterSet, Op};
pub use path::{is_within, normalize};

/// Result type for watch operations
pub type Result<T> = std::result::Result<T, WatchError>;
