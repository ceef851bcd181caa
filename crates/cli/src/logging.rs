//! Tracing subscriber for the `treewatch` binary
//!
//! Stdout may carry protocol frames, so logs always go to stderr.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

/// Switches the log level of a running process
#[derive(Clone)]
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    /// Raise the level to DEBUG; `false` leaves the configured level alone
    pub fn set_debug(&self, on: bool) {
        if !on {
            return;
        }
        if let Err(e) = self.filter.reload(EnvFilter::new("debug")) {
            tracing::warn!("failed to raise log level: {}", e);
        } else {
            tracing::debug!("debug logging enabled");
        }
    }
}

/// Install the global subscriber
///
/// The level comes from `RUST_LOG`, INFO when unset. Keep the guard alive
/// for the life of the process or buffered lines are lost.
pub fn init() -> Result<(WorkerGuard, LogHandle)> {
    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking).with_target(false))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok((guard, LogHandle { filter: handle }))
}
