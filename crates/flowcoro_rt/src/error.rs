// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use flowcoro_lifecycle::OperationCancelled;
use thiserror::Error;

/// A specialized `Result` type for FlowCoro runtime operations
/// that return a FlowCoro runtime [`Error`][enum@Error] on failure.
pub type Result<T> = std::result::Result<T, Error>;

/// An error originating in the FlowCoro runtime.
///
/// This is an umbrella type for all kinds of errors the runtime can surface, including
/// programming errors (e.g. blocking on a runtime-owned thread) and outcomes of the tasks
/// themselves (cancellation, timeouts, panics).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The task observed its cancellation token and stopped cooperatively.
    #[error(transparent)]
    Cancelled(#[from] OperationCancelled),

    /// A deadline fired before the awaited operation finished.
    #[error(transparent)]
    TimedOut(#[from] flowcoro_time::Error),

    /// We are re-packaging an error from the memory layer
    /// without adding further details in the runtime layer.
    #[error(transparent)]
    Memory(#[from] flowcoro_mem::Error),

    /// The runtime was stopped before (or while) the operation could complete.
    #[error("the runtime is shut down")]
    Shutdown,

    /// The task body panicked. The panic was captured at the task boundary and is delivered
    /// here instead of unwinding through the scheduler.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The caller of some API made a mistake (e.g. supplied invalid arguments or called an
    /// operation out of sequence).
    #[error("{0}")]
    Programming(String),
}

impl Error {
    /// Whether this error represents cooperative cancellation, including timeouts.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::TimedOut(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_classification() {
        assert!(Error::Cancelled(OperationCancelled::new()).is_cancelled());
        assert!(
            Error::TimedOut(flowcoro_time::Error::TimedOut {
                waited: std::time::Duration::from_millis(5),
            })
            .is_cancelled()
        );
        assert!(!Error::Shutdown.is_cancelled());
        assert!(!Error::Panicked(String::from("boom")).is_cancelled());
    }

    #[test]
    fn messages_read_well() {
        assert_eq!(Error::Shutdown.to_string(), "the runtime is shut down");
        assert_eq!(
            Error::Panicked(String::from("boom")).to_string(),
            "task panicked: boom"
        );
    }
}
