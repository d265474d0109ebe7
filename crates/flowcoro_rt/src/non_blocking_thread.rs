// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Some FlowCoro runtime APIs block the calling thread (`JoinHandle::wait`, `sync_wait`,
//! `WorkHandle::wait`). They exist for bridging into non-async code and are only safe to call
//! from threads the runtime does not own: a runtime-owned thread that blocks on a task result
//! can deadlock the scheduler that would produce the result.
//!
//! The runtime therefore flags every driver and worker thread at startup, and the blocking
//! entry points assert against the flag. Violations are programming errors and panic.

use std::cell::Cell;

/// Flags the current thread as runtime-owned. Blocking FlowCoro APIs called on this thread will
/// panic.
pub fn flag_current_thread() {
    IS_FLAGGED.with(|flag| flag.set(true));
}

/// Panics if the current thread is runtime-owned.
pub fn assert_not_flagged() {
    IS_FLAGGED.with(|flag| {
        assert!(
            !flag.get(),
            "blocking FlowCoro runtime APIs must not be called from threads owned by the runtime"
        );
    });
}

/// Whether the current thread is runtime-owned.
pub fn is_flagged() -> bool {
    IS_FLAGGED.with(Cell::get)
}

thread_local! {
    // A plain thread-local: this is consulted from arbitrary threads, most of which never run
    // task-context code at all.
    static IS_FLAGGED: Cell<bool> = const { Cell::new(false) };
}
