// channel error types.

use std::fmt;
use thiserror::Error;


/// Error for a pipeline stage that signalled failure while transforming an offered value
///
/// This is fatal for the channel: the channel closes, and the put that offered the value
/// resolves with this error. The stage's own error is carried opaquely.
#[derive(Debug, Error)]
#[error("pipeline stage failed: {source}")]
pub struct StageError {
    #[from]
    source: anyhow::Error,
}

impl StageError {
    /// The error the stage callable returned
    pub fn inner(&self) -> &anyhow::Error {
        &self.source
    }
}

/// Error for attempting an operation with no blocking, and the operation not completing
/// immediately
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Error)]
#[error("operation would block")]
pub struct WouldBlockError;

/// Error for attempting an operation with bounded blocking, and the operation not
/// completing by the given deadline
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Error)]
#[error("deadline exceeded")]
pub struct DeadlineExceededError;

/// Error for trying to put into a channel
///
/// A put on a closed channel hands the value back. A put whose value made a pipeline
/// stage fail does not: the stage consumed the value.
#[derive(Debug)]
pub enum PutError<T> {
    /// The channel was closed; the value is handed back
    Closed(T),
    /// A pipeline stage failed; the channel is now closed
    Stage(StageError),
}

impl<T> PutError<T> {
    /// Whether this is the closed-channel condition
    pub fn is_closed(&self) -> bool {
        matches!(self, PutError::Closed(_))
    }

    /// Recover the value from a closed-channel failure
    pub fn into_value(self) -> Option<T> {
        match self {
            PutError::Closed(value) => Some(value),
            PutError::Stage(_) => None,
        }
    }
}

impl<T> From<StageError> for PutError<T> {
    fn from(error: StageError) -> Self {
        PutError::Stage(error)
    }
}

impl<T> fmt::Display for PutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PutError::Closed(_) => write!(f, "channel closed"),
            PutError::Stage(error) => write!(f, "{}", error),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for PutError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PutError::Closed(_) => None,
            PutError::Stage(error) => Some(error),
        }
    }
}

/// Error for trying to put into a channel without blocking
#[derive(Debug)]
pub enum TryPutError<T> {
    /// The put completed, but failed
    Terminal(PutError<T>),
    /// The put could not complete immediately; the value is handed back
    WouldBlock(T),
}

impl<T> From<PutError<T>> for TryPutError<T> {
    fn from(cause: PutError<T>) -> Self {
        TryPutError::Terminal(cause)
    }
}

impl<T> fmt::Display for TryPutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TryPutError::Terminal(cause) => write!(f, "{}", cause),
            TryPutError::WouldBlock(_) => write!(f, "operation would block"),
        }
    }
}

impl<T: fmt::Debug + 'static> std::error::Error for TryPutError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TryPutError::Terminal(cause) => Some(cause),
            TryPutError::WouldBlock(_) => None,
        }
    }
}
