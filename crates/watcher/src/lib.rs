//! File system watching engine
//!
//! This crate provides recursive directory watching with:
//! - Non-recursive per-directory subscriptions (notify backends or polling)
//! - A live watch set that follows directory creation and removal
//! - Per-path debouncing over a configurable window
//! - Rename and move inference from remove/create pairs
//! - Operation filters, ignore rules and regex hooks
//! - Overflow recovery by rescan

pub mod coalesce;
pub mod debounce;
pub mod engine;
pub mod filter;
pub mod ignore;
pub mod platform;
pub mod reconcile;
pub mod tree;
pub mod watchset;

pub use coalesce::Resolver;
pub use debounce::{PendingSlot, PendingSlots};
pub use engine::{Engine, Notice};
pub use filter::{apply, FilterHooks};
pub use ignore::IgnoreRules;
pub use platform::{
    EventSource, NotifySource, RawEvent, RawKind, SourceEvent, SourceFactory, SubscriptionHandle,
};
pub use tree::{PathTree, WatchNode};
pub use watchset::{Expansion, WatchSet};

pub use treewatch_core::{FileInfo, FilterSet, Op, WatchConfig, WatchError, WatchEvent};
