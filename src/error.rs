use std::io;

use thiserror::Error;

use crate::ipc::IpcError;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that can occur while serving or calling the bridge
///
/// Lookup misses (unknown beacon, unknown worker action) are deliberately absent:
/// they are recovered where they happen and only show up in diagnostics.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("worker creation failed: {0}")]
    WorkerCreation(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("value cannot cross the bridge: {0}")]
    Marshal(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("command failed with exit code {code}: {message}")]
    CommandFailed { code: i32, message: String },

    #[error("process execution failed: {0}")]
    ProcessError(#[from] io::Error),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("call rejected by host: {0}")]
    Rejected(String),

    #[error("bridge disconnected")]
    Disconnected,

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("IPC error: {0}")]
    IpcError(#[from] IpcError),
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Marshal(err.to_string())
    }
}
