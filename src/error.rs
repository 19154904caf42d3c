//! Error types for boundzip.
//!
//! Every failure the pipeline can surface is a variant of [`Error`]. Variants
//! that wrap a lower-level failure keep it as their `source()`, so callers can
//! walk the full cause chain. Filter rejections are not errors: an excluded
//! entry is simply left out of the results.

use thiserror::Error;

/// Result type alias for boundzip operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by caller-supplied callbacks and handlers.
///
/// `anyhow::Error` converts into this, as does any `std::error::Error`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for boundzip
#[derive(Debug, Error)]
pub enum Error {
    /// Input is empty, corrupt, or not a recognizable archive. Not retryable.
    #[error("failed to open archive: {reason}")]
    ArchiveOpen {
        /// What was wrong with the input
        reason: String,
        /// Underlying failure, if the problem came from I/O or decoding
        #[source]
        source: Option<BoxError>,
    },

    /// A specific entry's content stream could not be opened.
    ///
    /// Fatal for the whole run: a broken record puts the rest of the
    /// directory in question.
    #[error("failed to open entry {name}")]
    EntryOpen {
        /// Archive-relative name of the entry
        name: String,
        /// Why the entry could not be opened
        #[source]
        source: Box<Error>,
    },

    /// An admission point found the memory budget exhausted.
    #[error("memory budget exceeded: {usage_bytes} bytes in use, limit {limit_bytes} bytes")]
    MemoryBudgetExceeded {
        /// Sampled usage at the time of the check
        usage_bytes: u64,
        /// Configured limit
        limit_bytes: u64,
    },

    /// An I/O or decoding failure while reading entry content.
    #[error("stream error: {context}")]
    Stream {
        /// Where the failure happened
        context: String,
        /// The underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// A caller passed a bad argument (zero chunk size, zero workers, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The run was cancelled through its cancellation token.
    #[error("extraction cancelled")]
    Cancelled,

    /// A caller-supplied callback or entry handler failed.
    #[error("callback failed: {context}")]
    Callback {
        /// Which callback failed
        context: String,
        /// The error the callback returned
        #[source]
        source: BoxError,
    },
}

impl Error {
    pub(crate) fn archive_open(reason: impl Into<String>) -> Self {
        Error::ArchiveOpen {
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn archive_open_io(reason: impl Into<String>, source: std::io::Error) -> Self {
        Error::ArchiveOpen {
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn entry_open(name: impl Into<String>, cause: Error) -> Self {
        Error::EntryOpen {
            name: name.into(),
            source: Box::new(cause),
        }
    }

    pub(crate) fn stream(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Stream {
            context: context.into(),
            source,
        }
    }

    /// Build a stream error from a decoding problem that has no I/O cause.
    pub(crate) fn corrupt(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Stream {
            context: context.into(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, detail.into()),
        }
    }

    /// Wrap a failure raised by caller code (a callback or an entry handler).
    pub fn callback(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::Callback {
            context: context.into(),
            source: source.into(),
        }
    }

    /// The terminal state a run ends in when it fails with this error.
    pub fn terminal_state(&self) -> ExtractionState {
        match self {
            Error::Cancelled => ExtractionState::Cancelled,
            _ => ExtractionState::Failed,
        }
    }

    /// Whether retrying with a larger budget or a smaller workload may help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::MemoryBudgetExceeded { .. })
    }

    /// Whether this error, or the error it wraps, is a budget breach.
    pub fn is_memory_budget_exceeded(&self) -> bool {
        match self {
            Error::MemoryBudgetExceeded { .. } => true,
            Error::EntryOpen { source, .. } => source.is_memory_budget_exceeded(),
            _ => false,
        }
    }
}

/// Terminal state of one extraction run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionState {
    /// Every directory record was consumed
    Completed,
    /// The run stopped on an error
    Failed,
    /// The run observed its cancellation signal
    Cancelled,
}
