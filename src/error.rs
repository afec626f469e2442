//! Error types surfaced by the batch engine.

use std::any::Any;
use thiserror::Error;

/// Failure of a single [`BatchRunner::run`](crate::runner::BatchRunner::run) invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    /// A procedure panicked while consuming its batch.
    ///
    /// `batch` is the zero-based batch index; the serial path reports batch `0`.
    #[error("parallel task for batch {batch} failed: {message}")]
    TaskFailed { batch: usize, message: String },

    /// A task finished without reporting back (its executor dropped the job).
    #[error("executor dropped {missing} of {submitted} submitted tasks")]
    Disconnected { submitted: usize, missing: usize },
}

/// Convenience alias used throughout the engine.
pub type BatchResult<T> = Result<T, BatchError>;

impl BatchError {
    /// Build a [`BatchError::TaskFailed`] from a caught panic payload.
    pub(crate) fn from_panic(batch: usize, payload: &(dyn Any + Send)) -> Self {
        Self::TaskFailed {
            batch,
            message: panic_message(payload),
        }
    }
}

/// Best-effort extraction of the message carried by a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
