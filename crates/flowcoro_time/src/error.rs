// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use thiserror::Error;

/// A specialized `Result` type for time-layer operations
/// that return a time-layer [`Error`][enum@Error] on failure.
pub type Result<T> = std::result::Result<T, Error>;

/// An error originating in the FlowCoro time layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The deadline elapsed before the awaited operation produced a result.
    #[error("operation timed out after {waited:?}")]
    TimedOut {
        /// How long the operation was given before the deadline fired.
        waited: Duration,
    },
}
