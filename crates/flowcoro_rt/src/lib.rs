// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The FlowCoro runtime.
//!
//! Schedules very large numbers of cooperatively-suspending tasks on a small thread pool. A task
//! starts executing eagerly on the thread that spawns it and migrates to the driver thread at
//! its first suspension point; timers, channels and the synchronization primitives reschedule it
//! through the driver's lock-free ready queue. CPU-bound work is offloaded to a worker pool (a
//! work-stealing variant is available through the builder).
//!
//! Entry points:
//!
//! - [`Runtime`] / [`RuntimeBuilder`]: an explicit runtime context with deterministic startup
//!   and shutdown.
//! - [`global()`] / [`init_global()`]: the process-wide instance, for code that does not want to
//!   thread a runtime reference through every call.
//! - [`spawn`], [`sleep_for`], [`sync_wait`], [`yield_now`]: free functions over the global
//!   runtime.
//! - [`when_all!`], [`when_any2`]/[`when_any3`], [`join_all`], [`when_all_settled`],
//!   [`when_any`], [`when_race`]: composition of concurrent work.

// Public API surface.
mod builder;
mod combinators;
mod error;
mod join;
mod runtime;
mod workers;

pub use builder::*;
pub use combinators::*;
pub use error::*;
pub use join::*;
pub use runtime::*;
pub use workers::*;

// Internal to the crate but re-exported at crate root for reduced hassle.
mod constants;
mod driver;
mod stealing;
mod task;
mod wakers;
mod yielding;

pub use stealing::*;
pub use yielding::{YieldFuture, yield_now};

pub(crate) use constants::ERR_POISONED_LOCK;
pub(crate) use driver::*;
pub(crate) use task::*;
pub(crate) use wakers::*;

// Not re-exported because the module name is an important identifying factor.
pub mod non_blocking_thread;

#[doc(hidden)]
pub mod __private {
    //! Support for macro expansions; not part of the public API surface.
    pub use futures;
}
