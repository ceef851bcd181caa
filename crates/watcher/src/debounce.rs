//! Per-path debouncing
//!
//! Every raw notification lands in a pending slot keyed by its path. A slot
//! remembers how the path's history began and ended within the current
//! window, and its deadline is pushed out on every new notification. Slots
//! live in a `DashMap`, so an append and a flush only ever contend on the
//! shard holding that path.

use crate::platform::{RawEvent, RawKind};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Net effect of one raw notification on a path's existence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Create,
    Write,
    Remove,
}

impl From<RawKind> for Change {
    fn from(kind: RawKind) -> Self {
        match kind {
            RawKind::Create | RawKind::RenameTo => Change::Create,
            RawKind::Write => Change::Write,
            RawKind::Remove | RawKind::RenameFrom => Change::Remove,
        }
    }
}

/// Pending history of one path within the current window
#[derive(Debug, Clone)]
pub struct PendingSlot {
    pub path: PathBuf,
    /// Change of the first notification in the window
    pub first: Change,
    /// Change of the most recent notification
    pub last: Change,
    /// Kind of the most recent notification
    pub last_raw: RawKind,
    /// A write arrived after the path was created in this window
    pub write_after_create: bool,
    /// Directory hint, latest known
    pub is_dir: Option<bool>,
    /// Latest kernel rename cookie seen for this path
    pub tracker: Option<usize>,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub deadline: Instant,
    /// Raw notifications folded into this slot
    pub raw_count: usize,
}

impl PendingSlot {
    pub fn new(raw: &RawEvent, interval: Duration) -> Self {
        let change = Change::from(raw.kind);
        Self {
            path: raw.path.clone(),
            first: change,
            last: change,
            last_raw: raw.kind,
            write_after_create: false,
            is_dir: raw.is_dir,
            tracker: raw.tracker,
            first_seen: raw.time,
            last_seen: raw.time,
            deadline: raw.time + interval,
            raw_count: 1,
        }
    }

    /// Fold a later notification for the same path into this slot
    pub fn absorb(&mut self, raw: &RawEvent, interval: Duration) {
        let change = Change::from(raw.kind);

        tracing::trace!(
            "{}: {:?} superseded by {:?}",
            self.path.display(),
            self.last_raw,
            raw.kind
        );

        if self.first == Change::Create && change == Change::Write {
            self.write_after_create = true;
        }
        // A fresh creation after a removal starts a new write history
        if change == Change::Create {
            self.write_after_create = false;
        }

        self.last = change;
        self.last_raw = raw.kind;
        if raw.is_dir.is_some() {
            self.is_dir = raw.is_dir;
        }
        if raw.tracker.is_some() {
            self.tracker = raw.tracker;
        }
        // Notifications can arrive slightly out of order across backends
        if raw.time > self.last_seen {
            self.last_seen = raw.time;
        }
        self.deadline = self.last_seen + interval;
        self.raw_count += 1;
    }

    /// Net change over the window
    ///
    /// - Create…(Write)* → Create
    /// - Create…Remove → None (the path never existed outside the window)
    /// - Remove…Create/Write → Write (replaced in place)
    /// - Write…Remove → Remove
    /// - otherwise the last change
    pub fn resolve(&self) -> Option<Change> {
        match (self.first, self.last) {
            (Change::Create, Change::Remove) => None,
            (Change::Create, _) => Some(Change::Create),
            (Change::Remove, Change::Create | Change::Write) => Some(Change::Write),
            (_, Change::Remove) => Some(Change::Remove),
            (Change::Write, _) => Some(Change::Write),
            (Change::Remove, Change::Remove) => Some(Change::Remove),
        }
    }

    /// Path is gone at the end of the window
    pub fn is_rename_source(&self) -> bool {
        self.last == Change::Remove
    }

    /// Path came into existence by its latest notification
    pub fn is_rename_target(&self) -> bool {
        matches!(self.last_raw, RawKind::Create | RawKind::RenameTo)
    }

    /// The latest notification was one half of a kernel-reported rename
    pub fn is_kernel_rename(&self) -> bool {
        matches!(self.last_raw, RawKind::RenameFrom | RawKind::RenameTo)
    }

    /// The path was created inside this window (editor temp files)
    pub fn created_in_window(&self) -> bool {
        self.first == Change::Create
    }

    pub fn parent(&self) -> Option<&Path> {
        self.path.parent()
    }
}

/// Pending slots for every path with notifications in flight
#[derive(Debug)]
pub struct PendingSlots {
    slots: DashMap<PathBuf, PendingSlot>,
    interval: Duration,
}

impl PendingSlots {
    pub fn new(interval: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record one raw notification
    pub fn push(&self, raw: RawEvent) {
        let interval = self.interval;
        self.slots
            .entry(raw.path.clone())
            .and_modify(|slot| slot.absorb(&raw, interval))
            .or_insert_with(|| PendingSlot::new(&raw, interval));
    }

    /// Remove and return every slot whose deadline has passed
    pub fn take_due(&self, now: Instant) -> Vec<PendingSlot> {
        let due: Vec<PathBuf> = self
            .slots
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        due.into_iter()
            // Re-check under the shard lock: a push may have extended it
            .filter_map(|path| self.slots.remove_if(&path, |_, slot| slot.deadline <= now))
            .map(|(_, slot)| slot)
            .collect()
    }

    /// Remove and return every slot regardless of deadline
    pub fn take_all(&self) -> Vec<PendingSlot> {
        let paths: Vec<PathBuf> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        paths
            .into_iter()
            .filter_map(|path| self.slots.remove(&path))
            .map(|(_, slot)| slot)
            .collect()
    }

    /// Remove and return the pending slot that best satisfies `score`
    ///
    /// `score` returns None for slots that do not qualify; the lowest score
    /// wins. Used to pull a rename partner out of a window that has not
    /// closed yet.
    pub fn take_best<K, F>(&self, mut score: F) -> Option<PendingSlot>
    where
        K: Ord,
        F: FnMut(&PendingSlot) -> Option<K>,
    {
        let best = self
            .slots
            .iter()
            .filter_map(|entry| score(entry.value()).map(|k| (k, entry.key().clone())))
            .min_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, path)| path)?;

        self.slots.remove(&best).map(|(_, slot)| slot)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Earliest deadline among pending slots
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().map(|entry| entry.deadline).min()
    }
}
