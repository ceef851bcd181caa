//! Treewatch protocol, server and client
//!
//! - [`protocol`]: newline-delimited JSON frames
//! - [`ipc`]: serves an engine over any byte stream
//! - [`client`]: drives an engine process and dispatches its events
//! - [`logging`]: subscriber setup shared by the binary's commands

pub mod client;
pub mod dispatch;
pub mod ipc;
pub mod logging;
pub mod protocol;

pub use client::Client;
pub use dispatch::{Dispatcher, Subscription};
pub use ipc::IpcServer;
pub use protocol::{Command, Frame, Reply, Request};
