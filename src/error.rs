//! Crate-wide error type.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The peer violated the wire protocol. The connection must be dropped.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Finalizing a written file produced a hash other than the expected one.
    #[error("hash mismatch finishing write of {path}")]
    HashMismatch { path: String },

    /// A task required a file layout that has not been populated yet.
    #[error("file layout not available")]
    LayoutMissing,

    /// A response arrived for a task that no longer exists.
    #[error("no matching task: {0}")]
    TaskNotFound(String),

    #[error("connection closed")]
    TransportClosed,

    #[error("invalid configuration: {0}")]
    Config(String),
}
