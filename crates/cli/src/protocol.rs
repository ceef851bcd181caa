//! Wire protocol between a controller and the engine
//!
//! Every message is one JSON document on one line. serde_json escapes
//! embedded newlines, so a line break always ends a frame no matter how large
//! the payload (a snapshot of thousands of files is still one line).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use treewatch_core::{ErrorFrame, FileInfo, WatchConfig, WatchError, WatchEvent};

/// Protocol revision announced in the `ready` frame
pub const PROTOCOL_VERSION: u32 = 1;

/// Controller to engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlates the reply; chosen by the controller
    pub id: u64,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Command {
    Start(WatchConfig),
    Stop,
    Ignore(PathBuf),
    Add(PathBuf),
    AddRecursive(PathBuf),
    Remove(PathBuf),
    GetWatchedFiles,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start(_) => "start",
            Command::Stop => "stop",
            Command::Ignore(_) => "ignore",
            Command::Add(_) => "add",
            Command::AddRecursive(_) => "addRecursive",
            Command::Remove(_) => "remove",
            Command::GetWatchedFiles => "getWatchedFiles",
        }
    }
}

/// Engine to controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    /// First frame on every connection
    Ready { version: u32 },
    Reply { id: u64, reply: Reply },
    Event { event: WatchEvent },
    Error { error: ErrorFrame },
}

impl From<&WatchError> for Frame {
    fn from(err: &WatchError) -> Self {
        Frame::Error {
            error: ErrorFrame::from(err),
        }
    }
}

/// Outcome of one command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "camelCase")]
pub enum Reply {
    /// `start` and `getWatchedFiles`
    Files(Vec<FileInfo>),
    /// `stop`, `add` and `addRecursive`
    Ack,
    /// `ignore` and `remove`
    Flag(bool),
    Failed(ErrorFrame),
}

impl From<Result<Reply, WatchError>> for Reply {
    fn from(result: Result<Reply, WatchError>) -> Self {
        result.unwrap_or_else(|err| Reply::Failed(ErrorFrame::from(&err)))
    }
}

/// Serialize `value` as one newline-terminated line
pub fn encode<T: Serialize>(value: &T) -> Result<String, WatchError> {
    let mut line = serde_json::to_string(value)
        .map_err(|e| WatchError::Protocol(format!("failed to encode frame: {}", e)))?;
    line.push('\n');
    Ok(line)
}

/// Parse one line; surrounding whitespace is ignored
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, WatchError> {
    serde_json::from_str(line.trim())
        .map_err(|e| WatchError::Protocol(format!("malformed frame: {}", e)))
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), WatchError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = encode(value)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
