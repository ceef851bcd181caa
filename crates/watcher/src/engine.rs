//! Engine orchestration
//!
//! Wires the pieces together:
//!
//! ```text
//! event source ──(unbounded)──▶ pump thread ──▶ pending slots
//!                                 │ watch-set maintenance
//!                                 │ overflow reconciliation
//!                                 ▼
//!                         errors (unbounded)
//!                                 │
//! timer thread: due slots ▶ resolver ▶ filter ──(bounded)──▶ notices()
//! ```
//!
//! The pump never waits on the consumer. Only the timer thread blocks when
//! the bounded delivery queue is full, and it gives up once the engine is
//! dropped.

use crate::coalesce::Resolver;
use crate::debounce::PendingSlots;
use crate::filter::{self, FilterHooks};
use crate::ignore::IgnoreRules;
use crate::platform::{create_event_source, RawEvent, RawKind, SourceEvent, SourceFactory};
use crate::reconcile::Reconciler;
use crate::watchset::{Expansion, WatchSet};
use crossbeam_channel::{bounded, never, select, tick, unbounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use treewatch_core::{normalize, FileInfo, FilterSet, WatchConfig, WatchError, WatchEvent};

/// Item delivered to the consumer
#[derive(Debug)]
pub enum Notice {
    Event(WatchEvent),
    Error(WatchError),
}

struct Running {
    watch_set: Arc<WatchSet>,
    errors: Sender<WatchError>,
    stop_pump: Sender<()>,
    stop_timer: Sender<()>,
    pump: JoinHandle<()>,
    timer: JoinHandle<()>,
}

enum Lifecycle {
    Idle,
    Running(Running),
    Stopped,
}

/// One watcher instance
///
/// Engines share nothing; any number can run in one process.
pub struct Engine {
    config: WatchConfig,
    factory: Mutex<Option<SourceFactory>>,
    lifecycle: Mutex<Lifecycle>,
    /// Handed to the timer thread on start; it is the only producer
    notice_tx: Mutex<Option<Sender<Notice>>>,
    notice_rx: Receiver<Notice>,
    /// Dropped with the engine; disconnects `abandoned` so a blocked
    /// delivery gives up
    abandon: Option<Sender<()>>,
    abandoned: Receiver<()>,
}

impl Engine {
    /// Engine with the backend selected by `config.backend`
    pub fn new(config: WatchConfig) -> Result<Self, WatchError> {
        config.validate()?;
        let (notice_tx, notice_rx) = bounded(config.queue_capacity);
        let (abandon, abandoned) = bounded(0);
        Ok(Self {
            config,
            factory: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle::Idle),
            notice_tx: Mutex::new(Some(notice_tx)),
            notice_rx,
            abandon: Some(abandon),
            abandoned,
        })
    }

    /// Engine with a custom event source
    pub fn with_source(config: WatchConfig, factory: SourceFactory) -> Result<Self, WatchError> {
        let engine = Self::new(config)?;
        *engine.factory.lock() = Some(factory);
        Ok(engine)
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Delivery queue of events and errors
    ///
    /// Closes once the engine has stopped and everything pending was
    /// delivered, or if the delivery thread dies. Must be drained while the
    /// engine runs: when it is full delivery (and `stop`) waits for the
    /// consumer. Dropping the engine instead discards whatever no longer
    /// fits.
    pub fn notices(&self) -> Receiver<Notice> {
        self.notice_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running(_))
    }

    /// Start watching and return the initial snapshot
    pub fn start(&self) -> Result<Vec<FileInfo>, WatchError> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running(_) => return Err(WatchError::AlreadyStarted),
            Lifecycle::Stopped => return Err(WatchError::AlreadyStopped),
            Lifecycle::Idle => {}
        }

        let root = normalize(&self.config.path)?;
        let ignore = IgnoreRules::load(&root, &self.config)?;
        let hooks = FilterHooks::compile(&self.config.filter_hooks)?;

        let (source_tx, source_rx) = unbounded();
        let source = match self.factory.lock().take() {
            Some(factory) => factory(source_tx)?,
            None => create_event_source(&self.config, source_tx)?,
        };

        let watch_set = Arc::new(WatchSet::new(source, ignore));
        let (error_tx, error_rx) = unbounded();

        let expansion = watch_set.add_path(&root, self.config.recursive)?;
        report_failures(&error_tx, expansion.failures);

        let snapshot = watch_set.snapshot();
        let reconciler = Arc::new(Mutex::new(Reconciler::from_snapshot(&snapshot)));
        let slots = Arc::new(PendingSlots::new(self.config.interval()));

        let (stop_pump, pump_stopped) = bounded::<()>(0);
        let (stop_timer, timer_stopped) = bounded::<()>(0);

        let notice_tx = self
            .notice_tx
            .lock()
            .take()
            .ok_or(WatchError::AlreadyStopped)?;

        let pump = Pump {
            root: root.clone(),
            watch_set: Arc::clone(&watch_set),
            slots: Arc::clone(&slots),
            reconciler: Arc::clone(&reconciler),
            errors: error_tx.clone(),
        };
        let pump = thread::Builder::new()
            .name("treewatch-pump".into())
            .spawn(move || pump.run(source_rx, pump_stopped))?;

        let timer = Timer {
            slots,
            resolver: Resolver::new(&self.config),
            filters: self.config.filters.clone(),
            ignore: watch_set.ignore_rules(),
            hooks,
            reconciler,
            notices: notice_tx,
            abandoned: self.abandoned.clone(),
            tick: tick_period(&self.config),
        };
        let timer = thread::Builder::new()
            .name("treewatch-timer".into())
            .spawn(move || timer.run(error_rx, timer_stopped))?;

        info!(
            "watching {} ({} directories, {} entries, {} backend)",
            root.display(),
            watch_set.len(),
            snapshot.len(),
            watch_set.backend_name()
        );

        *lifecycle = Lifecycle::Running(Running {
            watch_set,
            errors: error_tx,
            stop_pump,
            stop_timer,
            pump,
            timer,
        });
        Ok(snapshot)
    }

    fn running<T>(&self, f: impl FnOnce(&Running) -> T) -> Result<T, WatchError> {
        match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => Ok(f(running)),
            Lifecycle::Idle => Err(WatchError::NotStarted),
            Lifecycle::Stopped => Err(WatchError::AlreadyStopped),
        }
    }

    fn watch_set(&self) -> Result<Arc<WatchSet>, WatchError> {
        self.running(|running| Arc::clone(&running.watch_set))
    }

    /// Watch another path
    ///
    /// Subdirectories that could not be subscribed are reported as
    /// `SubscriptionFailed` notices; the call itself still succeeds.
    pub fn add_path(&self, path: &Path, recursive: bool) -> Result<(), WatchError> {
        let (watch_set, errors) =
            self.running(|running| (Arc::clone(&running.watch_set), running.errors.clone()))?;
        let expansion = watch_set.add_path(path, recursive)?;
        report_failures(&errors, expansion.failures);
        Ok(())
    }

    /// Stop watching `path` and keep it out; true if a watch was removed
    pub fn ignore(&self, path: &Path) -> Result<bool, WatchError> {
        self.watch_set()?.ignore(path)
    }

    /// Stop watching `path` without ignoring it; true if a watch was removed
    pub fn remove(&self, path: &Path) -> Result<bool, WatchError> {
        self.watch_set()?.remove(path)
    }

    /// Currently watched directories and their entries
    pub fn watched_files(&self) -> Result<Vec<FileInfo>, WatchError> {
        Ok(self.watch_set()?.snapshot())
    }

    /// Stop watching
    ///
    /// Ingests whatever the backend already queued, unsubscribes
    /// everything, flushes every pending window into the delivery queue,
    /// then closes it. Nothing is delivered after this returns.
    pub fn stop(&self) -> Result<(), WatchError> {
        let running = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(running) => running,
                Lifecycle::Idle => {
                    *lifecycle = Lifecycle::Idle;
                    return Err(WatchError::NotStarted);
                }
                Lifecycle::Stopped => return Err(WatchError::AlreadyStopped),
            }
        };

        // The pump drains the source before exiting, so the watch set must
        // still answer is_tracked until it is gone
        drop(running.stop_pump);
        let pump = running.pump.join();

        running.watch_set.close();
        drop(running.errors);

        drop(running.stop_timer);
        let timer = running.timer.join();

        if pump.is_err() || timer.is_err() {
            error!("engine thread panicked during shutdown");
            return Err(WatchError::EngineCrashed("engine thread panicked".into()));
        }

        info!("stopped watching {}", self.config.path.display());
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Nobody is left to drain a full queue
        drop(self.abandon.take());
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

fn report_failures(errors: &Sender<WatchError>, failures: Vec<WatchError>) {
    for failure in failures {
        let _ = errors.send(failure);
    }
}

/// Timer resolution: fine enough to honor short windows, coarse enough to
/// stay idle-cheap
fn tick_period(config: &WatchConfig) -> Duration {
    let window = config.interval().min(config.rename_window());
    (window / 4).clamp(Duration::from_millis(5), Duration::from_millis(50))
}

/// Ingestion: raw notifications into pending slots
struct Pump {
    root: PathBuf,
    watch_set: Arc<WatchSet>,
    slots: Arc<PendingSlots>,
    reconciler: Arc<Mutex<Reconciler>>,
    errors: Sender<WatchError>,
}

impl Pump {
    fn run(self, source: Receiver<SourceEvent>, stop: Receiver<()>) {
        debug!("pump thread started");
        loop {
            select! {
                recv(source) -> msg => match msg {
                    Ok(event) => self.handle(event),
                    Err(_) => {
                        debug!("event source closed");
                        break;
                    }
                },
                recv(stop) -> _ => {
                    let mut drained = 0usize;
                    for event in source.try_iter() {
                        self.handle(event);
                        drained += 1;
                    }
                    debug!("drained {} queued source events on stop", drained);
                    break;
                }
            }
        }
        debug!("pump thread exiting");
    }

    fn handle(&self, event: SourceEvent) {
        match event {
            SourceEvent::Raw(raw) => self.ingest(raw),
            SourceEvent::Failed { path, reason } => {
                let path = path.unwrap_or_else(|| self.root.clone());
                warn!("backend failure on {}: {}", path.display(), reason);
                let _ = self.errors.send(WatchError::SubscriptionFailed { path, reason });
            }
            SourceEvent::Overflow => self.recover(),
        }
    }

    fn ingest(&self, mut raw: RawEvent) {
        if !self.watch_set.is_tracked(&raw.path) {
            trace!("untracked {:?} on {}", raw.kind, raw.path.display());
            return;
        }

        match raw.kind {
            RawKind::Create | RawKind::RenameTo => {
                let is_dir = *raw.is_dir.get_or_insert_with(|| raw.path.is_dir());
                if is_dir {
                    let synthesize = raw.kind == RawKind::Create;
                    let expansion = self.watch_set.on_dir_created(&raw.path);
                    self.slots.push(raw);
                    self.absorb(expansion, synthesize);
                    return;
                }
            }
            RawKind::Remove | RawKind::RenameFrom => {
                if self.watch_set.on_dir_removed(&raw.path) > 0 {
                    raw.is_dir = Some(true);
                }
            }
            RawKind::Write => {}
        }

        self.slots.push(raw);
    }

    /// Entries found inside a new directory were never announced by the
    /// kernel; report them as created
    fn absorb(&self, expansion: Expansion, synthesize: bool) {
        report_failures(&self.errors, expansion.failures);
        if !synthesize {
            return;
        }
        for (path, is_dir) in expansion.discovered {
            self.slots.push(
                RawEvent::new(path, RawKind::Create)
                    .with_dir(Some(is_dir))
                    .at(Instant::now()),
            );
        }
    }

    fn recover(&self) {
        warn!("event queue overflowed, rescanning watched directories");
        let expansion = self.watch_set.refresh();
        report_failures(&self.errors, expansion.failures);

        let raws = self.reconciler.lock().rescan(&self.watch_set);
        for raw in raws {
            self.slots.push(raw);
        }
    }
}

/// Window flush: pending slots into the delivery queue
struct Timer {
    slots: Arc<PendingSlots>,
    resolver: Resolver,
    filters: FilterSet,
    ignore: Arc<parking_lot::RwLock<IgnoreRules>>,
    hooks: FilterHooks,
    reconciler: Arc<Mutex<Reconciler>>,
    notices: Sender<Notice>,
    abandoned: Receiver<()>,
    tick: Duration,
}

impl Timer {
    fn run(self, errors: Receiver<WatchError>, stop: Receiver<()>) {
        debug!("timer thread started (tick {:?})", self.tick);
        let ticker = tick(self.tick);
        let closed = never();
        let mut errors_open = true;
        loop {
            let errors_rx = if errors_open { &errors } else { &closed };
            select! {
                recv(ticker) -> now => {
                    let now = now.unwrap_or_else(|_| Instant::now());
                    let events = {
                        let reconciler = self.reconciler.lock();
                        self.resolver.flush_due(&self.slots, now, |p| reconciler.contains(p))
                    };
                    self.deliver(events);
                }
                recv(errors_rx) -> err => match err {
                    Ok(err) => self.send(Notice::Error(err)),
                    Err(_) => errors_open = false,
                },
                recv(stop) -> _ => break,
            }
        }

        // Shutdown: everything the pump produced is in by now
        for err in errors.try_iter() {
            self.send(Notice::Error(err));
        }
        let events = {
            let reconciler = self.reconciler.lock();
            self.resolver.flush_all(&self.slots, |p| reconciler.contains(p))
        };
        debug!("flushing {} events on shutdown", events.len());
        self.deliver(events);
        debug!("timer thread exiting");
    }

    fn deliver(&self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }

        {
            let mut reconciler = self.reconciler.lock();
            for event in &events {
                reconciler.observe(event);
            }
        }

        for event in events {
            let passed = {
                let ignore = self.ignore.read();
                filter::apply_with_hooks(event, &self.filters, &ignore, &self.hooks)
            };
            if let Some(event) = passed {
                trace!("{} {}", event.op, event.path.display());
                self.send(Notice::Event(event));
            }
        }
    }

    fn send(&self, notice: Notice) {
        let notice = match self.notices.try_send(notice) {
            Ok(()) => return,
            Err(TrySendError::Full(notice)) => notice,
            Err(TrySendError::Disconnected(_)) => {
                trace!("notice dropped, consumer gone");
                return;
            }
        };

        // Full: wait for the consumer, unless the engine is being dropped
        select! {
            send(self.notices, notice) -> res => {
                if res.is_err() {
                    trace!("notice dropped, consumer gone");
                }
            }
            recv(self.abandoned) -> _ => {
                debug!("delivery queue full while the engine is dropped, discarding");
            }
        }
    }
}
