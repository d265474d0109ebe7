// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Lifecycle management for FlowCoro tasks.
//!
//! - [`TaskState`] / [`StateManager`]: the atomic per-task state machine. Transitions are
//!   monotonic toward the terminal states (completed, destroyed, cancelled).
//! - [`CancellationSource`] / [`CancellationToken`]: cooperative cancellation. The source owns
//!   the right to cancel; tokens observe, run callbacks exactly once, and can be combined.
//! - [`LifecycleTracker`]: process-wide task counters and the cancel-all registry.
//! - [`RecordPool`]: reusable per-task bookkeeping records with a background janitor.

// Public API surface.
mod cancellation;
mod error;
mod pool;
mod state;
mod tracker;

pub use cancellation::*;
pub use error::*;
pub use pool::*;
pub use state::*;
pub use tracker::*;

pub(crate) const ERR_POISONED_LOCK: &str = "encountered poisoned lock";
