use std::io;
use thiserror::Error;

/// Error kinds produced by the declaration/definition builders, the bit
/// engine, the reader/writer, and the metadata emitter/parser.
///
/// Errors that arise mid-event leave the cursor at the failing event's
/// start; errors mid-packet leave the cursor at the packet start.
/// Validation errors during declaration assembly never mutate the tree.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("mutation attempted on a frozen declaration")]
    Frozen,

    #[error("failed to resolve '{0}': {1}")]
    ResolutionFailed(String, String),

    #[error(
        "read past the end of available content ({requested} bits requested at offset {offset}, content size {content_size})"
    )]
    Overrun {
        offset: usize,
        requested: usize,
        content_size: usize,
    },

    #[error("write would underrun the destination buffer")]
    Underrun,

    #[error("format mismatch: {0}")]
    FormatMismatch(String),

    #[error("clock '{clock}' went backwards: {previous} -> {attempted}")]
    ClockNonMonotonic {
        clock: String,
        previous: u64,
        attempted: u64,
    },

    #[error("io error: {}", .0.kind())]
    Io(#[from] io::Error),

    #[error("out of memory")]
    OutOfMemory,

    #[error("operation interrupted")]
    Interrupted,

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    pub(crate) fn invalid<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn resolution_failed<S: Into<String>, T: Into<String>>(what: S, reason: T) -> Self {
        Error::ResolutionFailed(what.into(), reason.into())
    }

    pub(crate) fn format_mismatch<S: Into<String>>(msg: S) -> Self {
        Error::FormatMismatch(msg.into())
    }

    pub(crate) fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::Unsupported(msg.into())
    }
}
