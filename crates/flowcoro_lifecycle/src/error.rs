// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// The awaited operation was cancelled through its [`CancellationToken`][crate::CancellationToken].
///
/// Timeout-driven cancellation produces the same error with a message naming the deadline, since
/// a timeout is implemented as a timer that cancels a source.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct OperationCancelled {
    message: String,
}

impl OperationCancelled {
    /// An error with the default message.
    #[must_use]
    pub fn new() -> Self {
        Self {
            message: "operation was cancelled".to_string(),
        }
    }

    /// An error carrying a caller-supplied message, e.g. the deadline that caused it.
    #[must_use]
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Default for OperationCancelled {
    fn default() -> Self {
        Self::new()
    }
}
