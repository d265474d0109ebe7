// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::cancellation::CancellationState;
use crate::{CancellationSource, ERR_POISONED_LOCK};

/// Process-wide task statistics and the cancel-all registry.
///
/// Counters are updated through [`TaskGuard`]s taken at task entry and released at exit, so they
/// stay correct on every exit path including panics.
#[derive(Debug, Default)]
pub struct LifecycleTracker {
    created: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
    active: AtomicU64,
    sources: Mutex<Vec<Weak<CancellationState>>>,
}

/// A point-in-time snapshot of the tracker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleStats {
    /// Tasks ever started.
    pub created: u64,
    /// Tasks that finished normally.
    pub completed: u64,
    /// Tasks that finished via cancellation.
    pub cancelled: u64,
    /// Tasks that finished by panicking.
    pub failed: u64,
    /// Tasks currently live.
    pub active: u64,
}

/// How a tracked task ended. Recorded by [`TaskGuard::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEnd {
    /// Finished normally.
    Completed,
    /// Finished via cooperative cancellation.
    Cancelled,
    /// Finished by panicking.
    Failed,
}

impl LifecycleTracker {
    /// A tracker with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a task as started and returns the guard that records its end.
    pub fn task_started(tracker: &Arc<Self>) -> TaskGuard {
        tracker.created.fetch_add(1, Ordering::Relaxed);
        tracker.active.fetch_add(1, Ordering::Relaxed);

        TaskGuard {
            tracker: Arc::clone(tracker),
            end: TaskEnd::Completed,
        }
    }

    /// Registers a cancellation source so [`cancel_all`][Self::cancel_all] reaches it.
    ///
    /// The registry holds the source weakly; a source dropped by its owner simply disappears.
    pub fn register_source(&self, source: &CancellationSource) {
        let mut sources = self.sources.lock().expect(ERR_POISONED_LOCK);
        sources.push(source.state_weak());
    }

    /// Cancels every still-live registered source. Returns how many were reached.
    pub fn cancel_all(&self) -> usize {
        let mut sources = self.sources.lock().expect(ERR_POISONED_LOCK);

        let mut reached = 0;
        sources.retain(|weak| match weak.upgrade() {
            Some(state) => {
                state.request_cancellation();
                reached += 1;
                true
            }
            None => false,
        });

        debug!(reached, "cancel_all swept registered cancellation sources");
        reached
    }

    /// Snapshots the counters.
    pub fn stats(&self) -> LifecycleStats {
        LifecycleStats {
            created: self.created.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
        }
    }
}

/// RAII guard pairing a task's entry with its exit in the tracker counters.
///
/// Defaults to recording a normal completion; call [`record`][Self::record] before drop for the
/// other outcomes.
#[derive(Debug)]
pub struct TaskGuard {
    tracker: Arc<LifecycleTracker>,
    end: TaskEnd,
}

impl TaskGuard {
    /// Overrides the outcome recorded when the guard drops.
    pub fn record(&mut self, end: TaskEnd) {
        self.end = end;
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let counter = match self.end {
            TaskEnd::Completed => &self.tracker.completed,
            TaskEnd::Cancelled => &self.tracker.cancelled,
            TaskEnd::Failed => &self.tracker.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.tracker.active.fetch_sub(1, Ordering::Relaxed);
    }
}
