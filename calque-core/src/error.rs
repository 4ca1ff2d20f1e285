//! Calque error types.
//!
//! Comprehensive error handling for all Calque core operations.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Calque core operations.
#[derive(Error, Debug)]
pub enum CalqueError {
    /// Caller passed an input value of a kind the converter layer does not
    /// know how to turn into a byte source (§7 `InputConversion`).
    #[error("unsupported input kind: {0}")]
    UnsupportedInputKind(String),

    /// Caller passed an output destination of a kind the converter layer does
    /// not know how to drain a byte source into (§7 `OutputConversion`).
    #[error("unsupported output kind: {0}")]
    UnsupportedOutputKind(String),

    /// A handler's `serve` call returned an error. The core never inspects
    /// or downcasts this; it is forwarded verbatim to the caller of `run`.
    #[error("handler error: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// The request context was cancelled or its deadline elapsed while a
    /// pipe, semaphore, or bus operation was pending.
    #[error("context cancelled")]
    Cancelled,

    /// The request context's deadline elapsed.
    #[error("context deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// A `MetadataBus` operation was attempted after `close()`.
    #[error("metadata bus closed")]
    BusClosed,

    /// The peer side of a pipe was closed (by the reader or the writer),
    /// optionally carrying the error the peer closed with.
    #[error("pipe closed")]
    PipeClosed,

    /// Propagated from an I/O-like operation performed by a caller-supplied
    /// sink or source (e.g. a `std::io::Write` adapter).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias used throughout the Calque core.
pub type Result<T> = std::result::Result<T, CalqueError>;

impl CalqueError {
    /// Wrap an arbitrary handler error.
    pub fn handler(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Handler(Box::new(err))
    }

    /// True for `Cancelled` and `DeadlineExceeded` — the two ways a context
    /// can terminate a pending operation.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded(_))
    }

    /// True when this error originated from a `MetadataBus` after it closed.
    /// Per §7, `BusClosed` is a signal, not fatal to the Flow by itself.
    #[must_use]
    pub const fn is_bus_closed(&self) -> bool {
        matches!(self, Self::BusClosed)
    }

    /// True when this error originated from a pipe close. Per §7, `PipeClose`
    /// is logged/ignored and never surfaced as the Flow's return value.
    #[must_use]
    pub const fn is_pipe_closed(&self) -> bool {
        matches!(self, Self::PipeClosed)
    }

    /// Best-effort duplication for fan-out to multiple observers — e.g. a
    /// pipe's close reason and the Flow's error rendezvous both need their
    /// own copy of the same failure. Preserves every variant exactly
    /// except `Handler`/`Io`, whose inner error is not `Clone`; those are
    /// re-wrapped via their `Display` text.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        match self {
            Self::Cancelled => Self::Cancelled,
            Self::DeadlineExceeded(d) => Self::DeadlineExceeded(*d),
            Self::BusClosed => Self::BusClosed,
            Self::PipeClosed => Self::PipeClosed,
            Self::UnsupportedInputKind(kind) => Self::UnsupportedInputKind(kind.clone()),
            Self::UnsupportedOutputKind(kind) => Self::UnsupportedOutputKind(kind.clone()),
            other => Self::handler(std::io::Error::other(other.to_string())),
        }
    }
}
