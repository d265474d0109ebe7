// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// A specialized `Result` type for memory-layer operations
/// that return a memory-layer [`Error`][enum@Error] on failure.
pub type Result<T> = std::result::Result<T, Error>;

/// An error originating in the FlowCoro memory layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The pool reached its configured block cap and cannot satisfy another allocation.
    #[error("memory pool exhausted: all {max_blocks} permitted blocks are in use")]
    Exhausted {
        /// The configured upper bound on the total block count.
        max_blocks: usize,
    },

    /// A pointer handed to `deallocate` does not belong to any chunk owned by the pool.
    #[error("pointer does not belong to this memory pool")]
    ForeignPointer,
}
