// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use flowcoro_lifecycle::TaskState;
use flowcoro_mem::MpmcQueue;
use flowcoro_time::runtime::ClockDriver;
use tracing::{debug, warn};

use crate::{TaskCore, ThreadWaker};

/// Upper bound on a single driver sleep when no timer bounds it. A `notify` interrupts the
/// sleep anyway; this only caps how long a lost wakeup could go unnoticed.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// The engine of the runtime: a ready queue of task cores, the timer state and the wakeup
/// mechanism, tied together by [`drive`][Self::drive].
///
/// One pass of `drive()` resumes every ready task and fires every due timer. The dedicated
/// driver thread loops on it; `sync_wait` additionally drives cooperatively from the calling
/// thread. Both may run concurrently: the ready queue is multi-consumer and each task core
/// serializes its own resumption.
pub(crate) struct DriverShared {
    ready: MpmcQueue<Arc<TaskCore>>,
    clock_driver: ClockDriver,
    waker: ThreadWaker,
    stop: AtomicBool,
}

impl DriverShared {
    pub(crate) fn new(clock_driver: ClockDriver) -> Arc<Self> {
        let waker = ThreadWaker::new();

        // A timer registered with a new earliest deadline must shorten the driver's sleep.
        clock_driver.set_wake_hook({
            let waker = waker.clone();
            move || waker.notify()
        });

        Arc::new(Self {
            ready: MpmcQueue::new(),
            clock_driver,
            waker,
            stop: AtomicBool::new(false),
        })
    }

    /// Enqueues a task core for resumption and wakes the driver.
    ///
    /// Terminal tasks are never enqueued, and a core already sitting in the queue is not
    /// enqueued twice.
    pub(crate) fn schedule(&self, core: Arc<TaskCore>) {
        if core.state.state().is_terminal() {
            return;
        }

        if core.mark_scheduled() {
            self.ready.enqueue(core);
            self.waker.notify();
        }
    }

    /// One scheduling pass: resume everything ready, then fire due timers.
    ///
    /// Returns the next timer deadline, if any timers remain.
    #[cfg_attr(test, mutants::skip)] // Tampering here hangs tasks; shows up only as timeouts.
    pub(crate) fn drive(&self) -> Option<Instant> {
        while let Some(core) = self.ready.dequeue() {
            // The task wrapper catches body panics; this is the backstop for panics out of
            // foreign poll implementations, keeping one broken task from killing the loop.
            if catch_unwind(AssertUnwindSafe(|| core.run())).is_err() {
                core.state.force_transition(TaskState::Destroyed);
                warn!(state = %core.state.state(), "task poll panicked outside the task boundary");
            }
        }

        self.clock_driver.advance_timers(Instant::now())
    }

    /// The driver thread entry point: drive, sleep until the next deadline or a wake, repeat.
    #[cfg_attr(test, mutants::skip)] // Loop mutations hang the runtime rather than failing.
    pub(crate) fn run_loop(&self) {
        debug!("driver loop running");

        while !self.is_stopped() {
            let next_deadline = self.drive();

            if !self.ready.is_empty() {
                continue;
            }

            let wait = next_deadline.map_or(IDLE_WAIT, |deadline| {
                deadline
                    .saturating_duration_since(Instant::now())
                    .min(IDLE_WAIT)
            });
            if !wait.is_zero() {
                self.waker.wait(wait);
            }
        }

        self.flush();
        debug!("driver loop stopped");
    }

    /// Asks the driver loop to exit after its current pass.
    pub(crate) fn initiate_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.waker.notify();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Brief sleep used by cooperative drivers between passes.
    pub(crate) fn wait_briefly(&self) {
        self.waker.wait(Duration::from_millis(1));
    }

    /// Shutdown path: abandon everything still ready and cancel pending timers. Abandoned
    /// tasks resolve their join handles with the shutdown error.
    fn flush(&self) {
        let mut discarded = 0_usize;
        while let Some(core) = self.ready.dequeue() {
            core.abandon();
            discarded += 1;
        }

        let timers = self.clock_driver.clear_timers();
        if discarded > 0 || timers > 0 {
            debug!(discarded, timers, "driver flushed outstanding work at shutdown");
        }
    }
}

impl std::fmt::Debug for DriverShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverShared")
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
