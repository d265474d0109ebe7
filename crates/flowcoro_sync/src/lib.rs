// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Coroutine-aware synchronization primitives.
//!
//! None of these block the OS thread: a contended acquire parks the *task* by storing its waker
//! in a FIFO waiter queue, and the releasing side wakes exactly the waiters it must. Fairness is
//! strict FIFO within each waiter queue; there are no priorities.
//!
//! - [`Mutex`]: asynchronous mutual exclusion with direct lock handoff.
//! - [`Semaphore`]: counting permits.
//! - [`Condvar`]: wait/notify. Users re-check their predicate after waking.
//! - [`Channel`]: bounded, rendezvous or unbounded FIFO with close semantics.
//! - [`once_event`]: single-shot result delivery, the building block for join handles.

// Public API surface.
mod channel;
mod condvar;
mod mutex;
mod semaphore;

pub use channel::*;
pub use condvar::*;
pub use mutex::*;
pub use semaphore::*;

// Not re-exported at the root because the module name is an important identifying factor.
pub mod once_event;

mod waiters;

pub(crate) use waiters::*;

pub(crate) const ERR_POISONED_LOCK: &str = "encountered poisoned lock";
