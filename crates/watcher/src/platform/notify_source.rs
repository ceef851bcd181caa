//! Backends built on the `notify` crate
//!
//! `native()` uses the platform's recommended kernel facility (inotify on
//! Linux, FSEvents on macOS, ReadDirectoryChangesW on Windows, kqueue on the
//! BSDs). `polling()` scans directories periodically and suits filesystems
//! that do not deliver kernel notifications.

use super::{EventSource, RawEvent, RawKind, SourceEvent, SubscriptionHandle};
use crossbeam_channel::Sender;
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use treewatch_core::WatchError;

/// Event source backed by a `notify` watcher
pub struct NotifySource<W: Watcher> {
    watcher: W,
    /// Subscribed directory per handle
    handles: HashMap<SubscriptionHandle, PathBuf>,
    next_id: u64,
    name: &'static str,
}

impl NotifySource<RecommendedWatcher> {
    /// Kernel notification backend for the current platform
    pub fn native(tx: Sender<SourceEvent>) -> Result<Self, WatchError> {
        let watcher = RecommendedWatcher::new(event_handler(tx), notify::Config::default())
            .map_err(|e| backend_error(e, None))?;
        Ok(Self::from_watcher(watcher, "native"))
    }
}

impl NotifySource<PollWatcher> {
    /// Polling backend scanning every `interval`
    pub fn polling(tx: Sender<SourceEvent>, interval: Duration) -> Result<Self, WatchError> {
        let config = notify::Config::default().with_poll_interval(interval);
        let watcher =
            PollWatcher::new(event_handler(tx), config).map_err(|e| backend_error(e, None))?;
        Ok(Self::from_watcher(watcher, "poll"))
    }
}

impl<W: Watcher> NotifySource<W> {
    fn from_watcher(watcher: W, name: &'static str) -> Self {
        Self {
            watcher,
            handles: HashMap::new(),
            next_id: 1,
            name,
        }
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.handles.len()
    }
}

impl<W: Watcher + Send> EventSource for NotifySource<W> {
    fn subscribe(&mut self, path: &Path) -> Result<SubscriptionHandle, WatchError> {
        self.watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| backend_error(e, Some(path)))?;

        let handle = SubscriptionHandle::new(self.next_id);
        self.next_id += 1;
        self.handles.insert(handle, path.to_path_buf());

        tracing::trace!("{} subscribed {} ({})", self.name, path.display(), handle);
        Ok(handle)
    }

    fn unsubscribe(&mut self, handle: SubscriptionHandle) -> Result<(), WatchError> {
        let Some(path) = self.handles.remove(&handle) else {
            return Ok(());
        };

        // The kernel drops watches on deleted directories by itself
        match self.watcher.unwatch(&path) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind, notify::ErrorKind::WatchNotFound) || !path.exists() => {
                tracing::trace!("{} already gone: {}", path.display(), e);
                Ok(())
            }
            Err(e) => Err(backend_error(e, Some(&path))),
        }
    }

    fn backend_name(&self) -> &'static str {
        self.name
    }
}

/// Build the callback handed to `notify`
fn event_handler(tx: Sender<SourceEvent>) -> impl FnMut(notify::Result<Event>) + Send + 'static {
    let mut synthetic_tracker = usize::MAX;

    move |result: notify::Result<Event>| match result {
        Ok(event) => {
            for source_event in translate(event, &mut synthetic_tracker) {
                // Receiver gone means the engine is shutting down
                if tx.send(source_event).is_err() {
                    return;
                }
            }
        }
        Err(err) => {
            let _ = tx.send(SourceEvent::Failed {
                path: err.paths.first().cloned(),
                reason: err.to_string(),
            });
        }
    }
}

/// Translate one `notify` event into raw events
///
/// Metadata-only modifications and access events are dropped. A combined
/// rename (`Both`) becomes a From/To pair sharing a tracker; when the backend
/// supplied none, a synthetic one is allocated counting down from
/// `usize::MAX` so it cannot collide with kernel cookies.
pub fn translate(event: Event, synthetic_tracker: &mut usize) -> Vec<SourceEvent> {
    let now = Instant::now();
    let tracker = event.tracker();
    let mut out = Vec::new();

    if event.need_rescan() {
        out.push(SourceEvent::Overflow);
    }

    let raw = |path: &PathBuf, kind: RawKind| RawEvent::new(path.clone(), kind).at(now);

    match event.kind {
        EventKind::Create(create_kind) => {
            let is_dir = match create_kind {
                CreateKind::Folder => Some(true),
                CreateKind::File => Some(false),
                _ => None,
            };
            for path in &event.paths {
                out.push(SourceEvent::Raw(raw(path, RawKind::Create).with_dir(is_dir)));
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => {
                for path in &event.paths {
                    out.push(SourceEvent::Raw(
                        raw(path, RawKind::RenameFrom).with_tracker(tracker),
                    ));
                }
            }
            RenameMode::To => {
                for path in &event.paths {
                    out.push(SourceEvent::Raw(raw(path, RawKind::RenameTo).with_tracker(tracker)));
                }
            }
            RenameMode::Both if event.paths.len() >= 2 => {
                let tracker = tracker.unwrap_or_else(|| {
                    let t = *synthetic_tracker;
                    *synthetic_tracker = synthetic_tracker.wrapping_sub(1);
                    t
                });
                out.push(SourceEvent::Raw(
                    raw(&event.paths[0], RawKind::RenameFrom).with_tracker(Some(tracker)),
                ));
                out.push(SourceEvent::Raw(
                    raw(&event.paths[1], RawKind::RenameTo).with_tracker(Some(tracker)),
                ));
            }
            _ => {
                // Backends that cannot tell the two halves apart (FSEvents)
                for path in &event.paths {
                    let kind = if path.exists() {
                        RawKind::RenameTo
                    } else {
                        RawKind::RenameFrom
                    };
                    out.push(SourceEvent::Raw(raw(path, kind).with_tracker(tracker)));
                }
            }
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => {}
        EventKind::Modify(_) | EventKind::Any => {
            for path in &event.paths {
                out.push(SourceEvent::Raw(raw(path, RawKind::Write)));
            }
        }
        EventKind::Remove(remove_kind) => {
            let is_dir = match remove_kind {
                RemoveKind::Folder => Some(true),
                RemoveKind::File => Some(false),
                _ => None,
            };
            for path in &event.paths {
                out.push(SourceEvent::Raw(raw(path, RawKind::Remove).with_dir(is_dir)));
            }
        }
        EventKind::Access(_) | EventKind::Other => {}
    }

    out
}

fn backend_error(err: notify::Error, path: Option<&Path>) -> WatchError {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| err.paths.first().cloned());

    match (err.kind, path) {
        (notify::ErrorKind::PathNotFound, Some(path)) => WatchError::NotFound(path),
        (notify::ErrorKind::Io(io), None) => WatchError::Io(io),
        (notify::ErrorKind::Io(io), Some(path)) if io.kind() == std::io::ErrorKind::NotFound => {
            WatchError::NotFound(path)
        }
        (kind, Some(path)) => WatchError::subscription_failed(path, describe(&kind)),
        (kind, None) => WatchError::Io(std::io::Error::other(describe(&kind))),
    }
}

fn describe(kind: &notify::ErrorKind) -> String {
    match kind {
        notify::ErrorKind::Generic(msg) => msg.clone(),
        notify::ErrorKind::Io(io) => io.to_string(),
        notify::ErrorKind::PathNotFound => "no such path".to_string(),
        notify::ErrorKind::WatchNotFound => "watch not found".to_string(),
        notify::ErrorKind::InvalidConfig(config) => format!("invalid backend config: {:?}", config),
        notify::ErrorKind::MaxFilesWatch => "OS watch limit reached".to_string(),
    }
}
