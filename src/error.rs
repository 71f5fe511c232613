//! Result codes returned by every display-class operation.

/// Errors surfaced to clients and backends.
///
/// Backend implementations return these too; the server passes them
/// through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DcError {
    /// No device at the requested index, or no devices registered at all
    #[error("no display device found")]
    NotFound,

    /// Empty or mismatched arrays, a buffer of the wrong variant, or a
    /// handle used after it was torn down
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// The backend does not implement an optional entry point
    #[error("operation not supported by the display backend")]
    NotSupported,

    /// Transient condition; the caller should re-issue the request later
    #[error("resource temporarily unavailable, retry")]
    Retry,

    /// A queue depth of one can never make forward progress
    #[error("max queue depth must be 0 (unbounded) or at least 2")]
    InvalidMaxDepth,

    #[error("out of memory")]
    OutOfMemory,

    /// A flush was requested while no display contexts exist
    #[error("no display contexts to flush")]
    InvalidContext,

    /// Neither a display heap nor a GPU-local heap is available on the node
    #[error("no usable physical heap for display buffers")]
    InvalidHeap,

    /// Backend-specific failure
    #[error("display backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, DcError>;
