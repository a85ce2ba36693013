use std::path::PathBuf;

use thinglog_api::{ApiError, ErrorKind};

use crate::router::RouterState;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("file sink is closed")]
    Closed,

    #[error("invalid entity id '{entity}': {reason}")]
    InvalidEntity { entity: String, reason: &'static str },

    #[error("open {}: {source}", .path.display())]
    Open { path: PathBuf, source: std::io::Error },

    #[error("write {}: {source}", .path.display())]
    Write { path: PathBuf, source: std::io::Error },

    #[error("serialize record: {0}")]
    Serialize(ApiError),
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("log router already started (state: {0})")]
    AlreadyStarted(RouterState),

    #[error("logs folder {}: {source}", .path.display())]
    LogsFolder { path: PathBuf, source: std::io::Error },

    #[error("transport: {0}")]
    Transport(ApiError),
}

impl RouterError {
    /// Kind of the underlying I/O error for folder failures.
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            RouterError::LogsFolder { source, .. } => Some(source.kind()),
            _ => None,
        }
    }

    /// Category reported by the transport for connect/subscribe failures.
    pub fn transport_kind(&self) -> Option<ErrorKind> {
        match self {
            RouterError::Transport(source) => Some(source.kind()),
            _ => None,
        }
    }
}
