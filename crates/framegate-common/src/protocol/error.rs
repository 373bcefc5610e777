use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("worker is dead")]
    WorkerDead,

    #[error("worker is draining")]
    WorkerDraining,

    #[error("no workers available")]
    NoWorkers,

    #[error("worker request timeout after {0:?}")]
    Timeout(Duration),

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("stream error from worker: {0}")]
    Stream(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GateError {
    /// Whether this error indicates the worker went away mid-exchange
    /// (closed pipe, truncated frame). These are the only errors a request
    /// is retried on, after the worker has been restarted.
    ///
    /// Typed `std::io::ErrorKind`s are checked first; the message-substring
    /// match is a fallback for platforms that surface pipe errors as plain
    /// `Other` I/O errors.
    pub fn is_broken_pipe(&self) -> bool {
        match self {
            GateError::UnexpectedEof => true,
            GateError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
            ) || err.to_string().contains("broken pipe"),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, GateError>;
