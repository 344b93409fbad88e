//! Error types shared across the cell.

use thiserror::Error;

/// Errors surfaced by cell modules and executors.
///
/// Every lower-level failure is translated into one of these kinds before
/// it reaches a reply channel; the human text travels verbatim into the
/// RPC failure reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CellError {
    /// Parameter shape or range violation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Unknown guest, group, pool or snapshot.
    #[error("not found: {0}")]
    NotFound(String),

    /// The guest is running while the operation requires it stopped, or a
    /// queue is full.
    #[error("busy: {0}")]
    Busy(String),

    /// The guest is stopped while the operation requires it running.
    #[error("not running: {0}")]
    NotRunning(String),

    /// The guest is already running.
    #[error("already running: {0}")]
    AlreadyRunning(String),

    /// Name or UUID collision.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Checksum mismatch on a transferred image.
    #[error("corrupted: {0}")]
    Corrupted(String),

    /// Operation exceeded its allowed time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The remote image service answered with a nonzero error code.
    #[error("remote failed: {0}")]
    RemoteFailed(String),

    /// The image tool exited nonzero; carries its stderr.
    #[error("image tool failed: {0}")]
    ToolFailed(String),

    /// Hypervisor library error, surfaced verbatim.
    #[error("hypervisor failed: {0}")]
    HypervisorFailed(String),

    /// No CPU topology fits the requested core count.
    #[error("no topology fit: {0}")]
    NoFit(String),

    /// Nothing to change (e.g. rename to the current name).
    #[error("no change: {0}")]
    NoChange(String),

    /// Anything that indicates a bug in the cell itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for CellError {
    fn from(err: std::io::Error) -> Self {
        CellError::Internal(err.to_string())
    }
}

/// Result type alias used throughout the cell.
pub type Result<T> = std::result::Result<T, CellError>;
