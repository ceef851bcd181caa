//! Engine exposed over a byte stream
//!
//! The binary serves stdin/stdout; tests serve an in-memory duplex. One task
//! owns the writer so replies, events and errors leave in a single FIFO
//! order.

use crate::protocol::{decode, write_frame, Command, Frame, Reply, Request, PROTOCOL_VERSION};
use crossbeam_channel::Receiver;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use watcher::{Engine, Notice, WatchError};

/// Frames buffered between the engine and the writer task
const FRAME_BUFFER: usize = 256;

type DebugHook = Box<dyn Fn(bool) + Send + Sync>;

enum Session {
    Idle,
    Running(Arc<Engine>),
    Stopped,
}

impl Session {
    fn engine(&self) -> Result<Arc<Engine>, WatchError> {
        match self {
            Session::Idle => Err(WatchError::NotStarted),
            Session::Running(engine) => Ok(Arc::clone(engine)),
            Session::Stopped => Err(WatchError::AlreadyStopped),
        }
    }
}

/// Serves one controller connection
#[derive(Default)]
pub struct IpcServer {
    on_debug: Option<DebugHook>,
}

impl IpcServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the `debug` flag of every accepted `start`
    pub fn on_debug(mut self, hook: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_debug = Some(Box::new(hook));
        self
    }

    /// Serve requests from `reader` until EOF or a terminal error
    ///
    /// Returns `Err` after a malformed frame or an engine crash; the matching
    /// error frame has already been written by then.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<(), WatchError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (frames, rx) = mpsc::channel(FRAME_BUFFER);
        let writer = spawn_writer(writer, rx);

        let outcome = self.run(reader, &frames).await;

        drop(frames);
        if writer.await.is_err() {
            error!("frame writer task panicked");
        }
        outcome
    }

    async fn run<R>(&self, reader: R, frames: &mpsc::Sender<Frame>) -> Result<(), WatchError>
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        let mut session = Session::Idle;
        let mut forwarder: Option<JoinHandle<()>> = None;

        send(frames, Frame::Ready { version: PROTOCOL_VERSION }).await;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            debug!("controller closed the connection");
                            shutdown(&mut session, &mut forwarder).await;
                            return Ok(());
                        }
                        Err(e) => {
                            warn!("failed to read from controller: {}", e);
                            shutdown(&mut session, &mut forwarder).await;
                            return Err(WatchError::Io(e));
                        }
                    };

                    if line.trim().is_empty() {
                        continue;
                    }

                    let request: Request = match decode(&line) {
                        Ok(request) => request,
                        Err(err) => {
                            error!("{}", err);
                            shutdown(&mut session, &mut forwarder).await;
                            send(frames, Frame::from(&err)).await;
                            return Err(err);
                        }
                    };

                    debug!("request {} ({})", request.id, request.command.name());
                    let reply = self.handle(&mut session, &mut forwarder, request.command).await;
                    send(frames, Frame::Reply { id: request.id, reply }).await;

                    // Events start flowing only after the snapshot reply
                    if let (Session::Running(engine), None) = (&session, &forwarder) {
                        forwarder = Some(forward(engine.notices(), frames.clone()));
                    }
                }
                _ = wait(&mut forwarder), if forwarder.is_some() => {
                    forwarder = None;
                    let err = WatchError::EngineCrashed("event stream closed unexpectedly".into());
                    error!("{}", err);
                    shutdown(&mut session, &mut forwarder).await;
                    send(frames, Frame::from(&err)).await;
                    return Err(err);
                }
            }
        }
    }

    async fn handle(
        &self,
        session: &mut Session,
        forwarder: &mut Option<JoinHandle<()>>,
        command: Command,
    ) -> Reply {
        let result = match command {
            Command::Start(config) => self.start(session, config).await,
            Command::Stop => stop(session, forwarder).await.map(|()| Reply::Ack),
            Command::Ignore(path) => on_engine(session, move |engine| engine.ignore(&path))
                .await
                .map(Reply::Flag),
            Command::Add(path) => add(session, path, false).await,
            Command::AddRecursive(path) => add(session, path, true).await,
            Command::Remove(path) => on_engine(session, move |engine| engine.remove(&path))
                .await
                .map(Reply::Flag),
            Command::GetWatchedFiles => on_engine(session, |engine| engine.watched_files())
                .await
                .map(Reply::Files),
        };

        if let Err(err) = &result {
            debug!("command failed: {}", err);
        }
        Reply::from(result)
    }

    async fn start(
        &self,
        session: &mut Session,
        config: watcher::WatchConfig,
    ) -> Result<Reply, WatchError> {
        match session {
            Session::Idle => {}
            Session::Running(_) => return Err(WatchError::AlreadyStarted),
            Session::Stopped => return Err(WatchError::AlreadyStopped),
        }

        if let Some(hook) = &self.on_debug {
            hook(config.debug);
        }

        let engine = Arc::new(Engine::new(config)?);
        let files = blocking(Arc::clone(&engine), |engine| engine.start()).await?;

        info!("engine started, {} files watched", files.len());
        *session = Session::Running(engine);
        Ok(Reply::Files(files))
    }
}

async fn add(session: &Session, path: PathBuf, recursive: bool) -> Result<Reply, WatchError> {
    on_engine(session, move |engine| engine.add_path(&path, recursive))
        .await
        .map(|()| Reply::Ack)
}

/// Stop the engine and wait until every pending event frame is queued
async fn stop(
    session: &mut Session,
    forwarder: &mut Option<JoinHandle<()>>,
) -> Result<(), WatchError> {
    let engine = session.engine()?;
    *session = Session::Stopped;

    let stopped = blocking(engine, |engine| engine.stop()).await;
    if let Some(forwarder) = forwarder.take() {
        if forwarder.await.is_err() {
            error!("event forwarder panicked");
        }
    }
    stopped
}

async fn shutdown(session: &mut Session, forwarder: &mut Option<JoinHandle<()>>) {
    if matches!(session, Session::Running(_)) {
        if let Err(e) = stop(session, forwarder).await {
            warn!("engine did not stop cleanly: {}", e);
        }
    }
}

async fn on_engine<T, F>(session: &Session, f: F) -> Result<T, WatchError>
where
    T: Send + 'static,
    F: FnOnce(&Engine) -> Result<T, WatchError> + Send + 'static,
{
    blocking(session.engine()?, f).await
}

/// Engine calls touch the filesystem; keep them off the async workers
async fn blocking<T, F>(engine: Arc<Engine>, f: F) -> Result<T, WatchError>
where
    T: Send + 'static,
    F: FnOnce(&Engine) -> Result<T, WatchError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(engine.as_ref()))
        .await
        .map_err(|e| WatchError::EngineCrashed(format!("engine call panicked: {}", e)))?
}

/// Move notices into the frame queue until the engine closes its channel
fn forward(notices: Receiver<Notice>, frames: mpsc::Sender<Frame>) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        for notice in notices.iter() {
            let frame = match notice {
                Notice::Event(event) => Frame::Event { event },
                Notice::Error(err) => {
                    warn!("{}", err);
                    Frame::from(&err)
                }
            };
            if frames.blocking_send(frame).is_err() {
                break;
            }
        }
    })
}

async fn wait(forwarder: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = forwarder {
        let _ = handle.await;
    }
}

fn spawn_writer<W>(mut writer: W, mut frames: mpsc::Receiver<Frame>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                warn!("failed to write frame: {}", e);
                break;
            }
        }
    })
}

async fn send(frames: &mpsc::Sender<Frame>, frame: Frame) {
    if frames.send(frame).await.is_err() {
        debug!("frame dropped, writer has shut down");
    }
}
