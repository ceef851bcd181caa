//! Controller side of the protocol
//!
//! A [`Client`] drives one engine connection, usually a `treewatch serve`
//! child process. Commands are request/reply round trips correlated by id;
//! events and errors are pushed to the [`Dispatcher`] as they arrive.

use crate::dispatch::{Dispatcher, Subscription};
use crate::protocol::{decode, encode, Command, Frame, Reply, Request};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command as Process};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use treewatch_core::{FileInfo, Op, WatchConfig, WatchError, WatchEvent};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Replies awaited by in-flight requests
#[derive(Default)]
struct Pending {
    replies: HashMap<u64, oneshot::Sender<Reply>>,
    /// Set once the connection is gone; no new requests are accepted
    closed: bool,
    /// A terminal error was already reported to the error handlers
    reported: bool,
}

struct Shared {
    pending: Mutex<Pending>,
    lifecycle: Mutex<Lifecycle>,
    dispatcher: Dispatcher,
}

pub struct Client {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    child: Option<Child>,
}

impl Client {
    /// Launch `bin_path serve` and connect to its stdio
    pub fn spawn(bin_path: impl AsRef<Path>) -> Result<Self, WatchError> {
        let bin_path = bin_path.as_ref();
        let mut child = Process::new(bin_path)
            .arg("serve")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WatchError::EngineCrashed("engine stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WatchError::EngineCrashed("engine stdout unavailable".into()))?;

        info!("spawned engine {} (pid {:?})", bin_path.display(), child.id());
        let mut client = Self::connect(stdout, stdin);
        client.child = Some(child);
        Ok(client)
    }

    /// Speak the protocol over an existing stream
    ///
    /// Must be called inside a tokio runtime.
    pub fn connect<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending::default()),
            lifecycle: Mutex::new(Lifecycle::Idle),
            dispatcher: Dispatcher::new(),
        });

        let reader = tokio::spawn(read_frames(reader, Arc::clone(&shared)));

        Self {
            shared,
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            next_id: AtomicU64::new(1),
            reader,
            child: None,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    pub fn on_change(
        &self,
        op: Op,
        handler: impl Fn(&WatchEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.dispatcher.on_change(op, handler)
    }

    pub fn on_all(&self, handler: impl Fn(&WatchEvent) + Send + Sync + 'static) -> Subscription {
        self.shared.dispatcher.on_all(handler)
    }

    pub fn on_error(&self, handler: impl Fn(&WatchError) + Send + Sync + 'static) -> Subscription {
        self.shared.dispatcher.on_error(handler)
    }

    pub fn unsubscribe(&self, sub: Subscription) -> bool {
        self.shared.dispatcher.unsubscribe(sub)
    }

    /// Start the engine and return the initial snapshot
    pub async fn start(&self, config: WatchConfig) -> Result<Vec<FileInfo>, WatchError> {
        match *self.shared.lifecycle.lock() {
            Lifecycle::Idle => {}
            Lifecycle::Running => return Err(WatchError::AlreadyStarted),
            Lifecycle::Stopped => return Err(WatchError::AlreadyStopped),
        }

        match self.request(Command::Start(config)).await? {
            Reply::Files(files) => {
                *self.shared.lifecycle.lock() = Lifecycle::Running;
                Ok(files)
            }
            other => Err(unexpected("start", &other)),
        }
    }

    /// Stop the engine; every event emitted before the stop has been
    /// dispatched when this returns
    pub async fn stop(&self) -> Result<(), WatchError> {
        self.ensure_running()?;
        let reply = self.request(Command::Stop).await;
        *self.shared.lifecycle.lock() = Lifecycle::Stopped;

        match reply? {
            Reply::Ack => Ok(()),
            other => Err(unexpected("stop", &other)),
        }
    }

    /// Stop watching `path` and everything below it
    ///
    /// Returns false if `path` was not watched.
    pub async fn ignore(&self, path: impl Into<PathBuf>) -> Result<bool, WatchError> {
        self.ensure_running()?;
        match self.request(Command::Ignore(path.into())).await? {
            Reply::Flag(removed) => Ok(removed),
            other => Err(unexpected("ignore", &other)),
        }
    }

    /// Watch `path` and its direct entries
    pub async fn add(&self, path: impl Into<PathBuf>) -> Result<(), WatchError> {
        self.ensure_running()?;
        self.ack("add", Command::Add(path.into())).await
    }

    /// Watch the whole tree below `path`
    pub async fn add_recursive(&self, path: impl Into<PathBuf>) -> Result<(), WatchError> {
        self.ensure_running()?;
        self.ack("addRecursive", Command::AddRecursive(path.into())).await
    }

    pub async fn remove(&self, path: impl Into<PathBuf>) -> Result<bool, WatchError> {
        self.ensure_running()?;
        match self.request(Command::Remove(path.into())).await? {
            Reply::Flag(removed) => Ok(removed),
            other => Err(unexpected("remove", &other)),
        }
    }

    pub async fn watched_files(&self) -> Result<Vec<FileInfo>, WatchError> {
        self.ensure_running()?;
        match self.request(Command::GetWatchedFiles).await? {
            Reply::Files(files) => Ok(files),
            other => Err(unexpected("getWatchedFiles", &other)),
        }
    }

    /// Close the connection and wait for the engine to exit
    pub async fn close(mut self) -> Result<(), WatchError> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        if (&mut self.reader).await.is_err() {
            warn!("frame reader task panicked");
        }

        if let Some(mut child) = self.child.take() {
            let status = child.wait().await?;
            debug!("engine exited with {}", status);
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), WatchError> {
        match *self.shared.lifecycle.lock() {
            Lifecycle::Idle => Err(WatchError::NotStarted),
            Lifecycle::Running => Ok(()),
            Lifecycle::Stopped => Err(WatchError::AlreadyStopped),
        }
    }

    async fn ack(&self, name: &str, command: Command) -> Result<(), WatchError> {
        match self.request(command).await? {
            Reply::Ack => Ok(()),
            other => Err(unexpected(name, &other)),
        }
    }

    async fn request(&self, command: Command) -> Result<Reply, WatchError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = encode(&Request { id, command })?;

        let rx = {
            let mut pending = self.shared.pending.lock();
            if pending.closed {
                return Err(connection_closed());
            }
            let (tx, rx) = oneshot::channel();
            pending.replies.insert(id, tx);
            rx
        };

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => match writer.write_all(line.as_bytes()).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                },
                None => Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe)),
            }
        };

        if let Err(e) = written {
            self.shared.pending.lock().replies.remove(&id);
            return Err(WatchError::EngineCrashed(format!("failed to send request: {}", e)));
        }

        match rx.await {
            Ok(Reply::Failed(frame)) => Err(WatchError::from(frame)),
            Ok(reply) => Ok(reply),
            Err(_) => Err(connection_closed()),
        }
    }
}

fn connection_closed() -> WatchError {
    WatchError::EngineCrashed("connection to engine closed".into())
}

fn unexpected(command: &str, reply: &Reply) -> WatchError {
    WatchError::Protocol(format!("unexpected reply to {}: {:?}", command, reply))
}

async fn read_frames<R>(reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("failed to read from engine: {}", e);
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match decode::<Frame>(&line) {
            Ok(Frame::Ready { version }) => debug!("engine ready, protocol v{}", version),
            Ok(Frame::Reply { id, reply }) => {
                let waiter = shared.pending.lock().replies.remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => warn!("reply for unknown request {}", id),
                }
            }
            Ok(Frame::Event { event }) => shared.dispatcher.dispatch_event(&event),
            Ok(Frame::Error { error }) => {
                let err = WatchError::from(error);
                if err.is_terminal() {
                    shared.pending.lock().reported = true;
                    *shared.lifecycle.lock() = Lifecycle::Stopped;
                }
                shared.dispatcher.dispatch_error(&err);
            }
            Err(err) => {
                warn!("{}", err);
                shared.pending.lock().reported = true;
                shared.dispatcher.dispatch_error(&err);
                break;
            }
        }
    }

    let (report, abandoned) = {
        let mut pending = shared.pending.lock();
        pending.closed = true;
        let abandoned = std::mem::take(&mut pending.replies);
        (!std::mem::replace(&mut pending.reported, true), abandoned)
    };

    let running = *shared.lifecycle.lock() == Lifecycle::Running;
    if report && (running || !abandoned.is_empty()) {
        warn!("engine connection closed with {} requests in flight", abandoned.len());
        shared.dispatcher.dispatch_error(&connection_closed());
    }

    // Dropping the senders fails every waiting request
    drop(abandoned);
}
