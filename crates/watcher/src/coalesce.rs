//! Window flush and rename resolution
//!
//! Turns closed pending slots into [`WatchEvent`]s. A removed path and a
//! created path that belong to the same rename are paired into one Rename or
//! Move; everything else resolves on its own.

use crate::debounce::{Change, PendingSlot, PendingSlots};
use crate::platform::RawKind;
use std::path::Path;
use std::time::{Duration, Instant};
use treewatch_core::{FileInfo, Op, RenameRules, WatchConfig, WatchEvent};

/// Pairing preference; lower wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Affinity {
    /// Kernel rename cookie matched
    Tracker,
    SameParent,
    OtherParent,
}

type PairScore = (Affinity, Duration);

/// Resolves closed windows into coalesced events
#[derive(Debug, Clone)]
pub struct Resolver {
    rules: RenameRules,
    window: Duration,
}

impl Resolver {
    pub fn new(config: &WatchConfig) -> Self {
        Self {
            rules: config.rename.clone(),
            window: config.rename_window(),
        }
    }

    pub fn with_rules(rules: RenameRules, window: Duration) -> Self {
        Self { rules, window }
    }

    /// Flush every slot whose deadline has passed
    ///
    /// Rename partners whose own window is still open are pulled out early
    /// so both halves are reported together. `known` tells whether the
    /// consumer has already been told a path exists.
    pub fn flush_due(
        &self,
        slots: &PendingSlots,
        now: Instant,
        known: impl Fn(&Path) -> bool,
    ) -> Vec<WatchEvent> {
        let due = slots.take_due(now);
        if due.is_empty() {
            return Vec::new();
        }
        self.resolve(due, Some(slots), known)
    }

    /// Flush everything regardless of deadlines
    pub fn flush_all(&self, slots: &PendingSlots, known: impl Fn(&Path) -> bool) -> Vec<WatchEvent> {
        self.resolve(slots.take_all(), None, known)
    }

    /// Resolve a batch of closed slots, in order of first activity
    pub fn resolve(
        &self,
        mut batch: Vec<PendingSlot>,
        open: Option<&PendingSlots>,
        known: impl Fn(&Path) -> bool,
    ) -> Vec<WatchEvent> {
        batch.sort_by_key(|slot| slot.first_seen);

        let mut taken = vec![false; batch.len()];
        let mut out: Vec<(Instant, WatchEvent)> = Vec::with_capacity(batch.len());

        for i in 0..batch.len() {
            if taken[i] {
                continue;
            }
            taken[i] = true;
            let slot = &batch[i];

            let source_side = slot.is_rename_source();
            let target_side = slot.is_rename_target();

            let partner = if source_side || target_side {
                self.find_partner(slot, source_side, &batch, &taken)
                    .map(|j| {
                        taken[j] = true;
                        batch[j].clone()
                    })
                    .or_else(|| {
                        open.and_then(|open| {
                            open.take_best(|candidate| self.score_either(slot, source_side, candidate))
                        })
                    })
            } else {
                None
            };

            let emitted = match partner {
                Some(other) if source_side => emit_pair(slot, &other, &known),
                Some(other) => emit_pair(&other, slot, &known),
                None => emit_single(slot),
            };
            out.extend(emitted);
        }

        out.sort_by_key(|(key, _)| *key);
        out.into_iter().map(|(_, event)| event).collect()
    }

    fn find_partner(
        &self,
        slot: &PendingSlot,
        source_side: bool,
        batch: &[PendingSlot],
        taken: &[bool],
    ) -> Option<usize> {
        batch
            .iter()
            .enumerate()
            .filter(|(j, _)| !taken[*j])
            .filter_map(|(j, candidate)| {
                self.score_either(slot, source_side, candidate)
                    .map(|score| (score, j))
            })
            .min()
            .map(|(_, j)| j)
    }

    fn score_either(&self, slot: &PendingSlot, source_side: bool, candidate: &PendingSlot) -> Option<PairScore> {
        if source_side {
            candidate
                .is_rename_target()
                .then(|| self.pair_score(slot, candidate))
                .flatten()
        } else {
            candidate
                .is_rename_source()
                .then(|| self.pair_score(candidate, slot))
                .flatten()
        }
    }

    /// Whether `source` and `target` are two halves of one rename
    pub(crate) fn pair_score(&self, source: &PendingSlot, target: &PendingSlot) -> Option<PairScore> {
        if source.path == target.path {
            return None;
        }

        match (source.tracker, target.tracker) {
            (Some(a), Some(b)) => return (a == b).then_some((Affinity::Tracker, Duration::ZERO)),
            (None, None) => {}
            // One half moved in or out of the watched area
            _ => return None,
        }

        let kernel_pair = source.is_kernel_rename() && target.is_kernel_rename();
        if !self.rules.infer_from_remove_create && !kernel_pair {
            return None;
        }

        if target.last_raw == RawKind::Create
            && (!target.created_in_window() || target.write_after_create)
        {
            return None;
        }

        // A created-and-deleted temp file only pairs on an explicit rename
        if source.created_in_window() && source.last_raw != RawKind::RenameFrom {
            return None;
        }

        if let (Some(a), Some(b)) = (source.is_dir, target.is_dir) {
            if a != b {
                return None;
            }
        }

        let gap = if target.first_seen >= source.last_seen {
            target.first_seen - source.last_seen
        } else {
            source.last_seen - target.first_seen
        };
        if gap > self.window {
            return None;
        }

        let same_parent = source.parent() == target.parent();
        if !same_parent && !self.rules.cross_directory {
            return None;
        }

        let affinity = if same_parent {
            Affinity::SameParent
        } else {
            Affinity::OtherParent
        };
        Some((affinity, gap))
    }
}

/// One event for both halves of a rename
///
/// A source that only lived inside the window (an editor temp file or a
/// freshly made directory) did not exist as far as the consumer knows, so
/// the pair reads as the target appearing: a Write if the consumer already
/// knew the target file, a Create otherwise.
fn emit_pair(
    source: &PendingSlot,
    target: &PendingSlot,
    known: impl Fn(&Path) -> bool,
) -> Option<(Instant, WatchEvent)> {
    let info = FileInfo::from_path(&target.path);
    let is_dir = info
        .as_ref()
        .map(|i| i.is_dir)
        .or(target.is_dir)
        .or(source.is_dir)
        .unwrap_or(false);

    let event = if source.created_in_window() {
        let op = if !is_dir && known(&target.path) {
            Op::Write
        } else {
            Op::Create
        };
        tracing::trace!(
            "{} renamed from transient {} reported as {}",
            target.path.display(),
            source.path.display(),
            op
        );
        WatchEvent::new(op, &target.path)
    } else {
        let op = if source.parent() == target.parent() {
            Op::Rename
        } else {
            Op::Move
        };
        WatchEvent::new(op, &target.path).with_old_path(&source.path)
    };

    Some((
        target.last_seen.max(source.last_seen),
        event.with_dir(is_dir).with_info(info.as_ref()),
    ))
}

fn emit_single(slot: &PendingSlot) -> Option<(Instant, WatchEvent)> {
    let Some(change) = slot.resolve() else {
        tracing::trace!(
            "{} created and removed within one window ({} events)",
            slot.path.display(),
            slot.raw_count
        );
        return None;
    };

    let (op, info) = match change {
        Change::Create => (Op::Create, FileInfo::from_path(&slot.path)),
        Change::Write => (Op::Write, FileInfo::from_path(&slot.path)),
        Change::Remove => (Op::Remove, None),
    };

    let is_dir = info
        .as_ref()
        .map(|i| i.is_dir)
        .or(slot.is_dir)
        .unwrap_or(false);

    if op == Op::Write && is_dir {
        tracing::trace!("dropping directory write on {}", slot.path.display());
        return None;
    }

    Some((
        slot.last_seen,
        WatchEvent::new(op, &slot.path)
            .with_dir(is_dir)
            .with_info(info.as_ref()),
    ))
}
