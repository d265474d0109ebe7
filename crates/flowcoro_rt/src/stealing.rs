// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::workers::Job;
use crate::{ERR_POISONED_LOCK, Error, WorkHandle, describe_panic, non_blocking_thread};
use flowcoro_mem::{CachePadded, MpmcQueue};

/// How long shutdown waits for in-flight work before detaching stuck workers.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Which stealing pool (if any) owns this thread, and the worker's index in it. Lets
    /// `enqueue` from a worker thread target that worker's local queue.
    static WORKER_IDENTITY: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
}

/// A worker pool where each worker owns a local queue and steals from siblings when idle.
///
/// Work submitted from a worker thread lands in that worker's local queue (cheap, usually
/// uncontended); work from outside lands in a shared global queue. An idle worker scans local,
/// then global, then probes its siblings in a randomized order for one steal attempt, and
/// yields the thread when it finds nothing.
///
/// Shutdown follows the same detach-after-grace policy as [`WorkerPool`][crate::WorkerPool].
#[derive(Debug)]
pub struct WorkStealingPool {
    shared: Arc<StealShared>,
    threads: StdMutex<Vec<thread::JoinHandle<()>>>,
}

#[derive(Debug)]
struct StealShared {
    pool_id: u64,
    slots: Box<[CachePadded<WorkerSlot>]>,
    global: MpmcQueue<Job>,
    stop: AtomicBool,
    active: AtomicUsize,
}

#[derive(Debug)]
struct WorkerSlot {
    local: MpmcQueue<Job>,
    has_work: AtomicBool,
}

impl WorkStealingPool {
    /// Starts a pool with `threads` workers (minimum one).
    #[must_use]
    pub fn new(threads: usize) -> Self {
        let count = threads.max(1);

        let slots = (0..count)
            .map(|_| {
                CachePadded::new(WorkerSlot {
                    local: MpmcQueue::new(),
                    has_work: AtomicBool::new(false),
                })
            })
            .collect();

        let shared = Arc::new(StealShared {
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            slots,
            global: MpmcQueue::new(),
            stop: AtomicBool::new(false),
            active: AtomicUsize::new(count),
        });

        let handles = (0..count)
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("flowcoro-stealer-{index}"))
                    .spawn(move || worker_loop(&shared, index))
                    .expect("spawning a worker thread failed")
            })
            .collect();

        Self {
            shared,
            threads: StdMutex::new(handles),
        }
    }

    /// Submits a callable and returns a handle to its eventual result.
    ///
    /// # Errors
    ///
    /// [`Error::Shutdown`] when the pool has been stopped.
    pub fn enqueue<F, R>(&self, f: F) -> crate::Result<WorkHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_stopped() {
            return Err(Error::Shutdown);
        }

        let (tx, rx) = oneshot::channel();
        self.push(Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(f));
            _ = tx.send(result);
        }));

        Ok(WorkHandle::from_receiver(rx))
    }

    /// Submits a callable whose result nobody needs.
    ///
    /// # Errors
    ///
    /// [`Error::Shutdown`] when the pool has been stopped.
    pub fn enqueue_void<F>(&self, f: F) -> crate::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_stopped() {
            return Err(Error::Shutdown);
        }

        self.push(Box::new(f));
        Ok(())
    }

    fn push(&self, job: Job) {
        let local_index = WORKER_IDENTITY.with(|identity| match identity.get() {
            Some((pool_id, index)) if pool_id == self.shared.pool_id => Some(index),
            _ => None,
        });

        match local_index {
            Some(index) => {
                let slot = &self.shared.slots[index];
                slot.local.enqueue(job);
                slot.has_work.store(true, Ordering::Release);
            }
            None => self.shared.global.enqueue(job),
        }
    }

    /// The number of workers that have not yet exited.
    pub fn active_workers(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Whether [`shutdown`][Self::shutdown] has begun.
    pub fn is_stopped(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    /// Stops the pool, detaching workers that outlive the grace period. Idempotent.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.active_workers() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        let handles: Vec<_> = {
            let mut threads = self.threads.lock().expect(ERR_POISONED_LOCK);
            threads.drain(..).collect()
        };

        if self.active_workers() == 0 {
            for handle in handles {
                _ = handle.join();
            }
        } else {
            warn!(
                stuck = self.active_workers(),
                "work-stealing pool shutdown grace period expired; detaching remaining workers"
            );
        }
    }
}

impl Drop for WorkStealingPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg_attr(test, mutants::skip)] // A worker that stops working hangs the suite, not a test.
fn worker_loop(shared: &Arc<StealShared>, index: usize) {
    non_blocking_thread::flag_current_thread();
    WORKER_IDENTITY.with(|identity| identity.set(Some((shared.pool_id, index))));

    let _active = scopeguard::guard((), |()| {
        shared.active.fetch_sub(1, Ordering::AcqRel);
    });

    debug!(index, "stealing worker running");

    while !shared.stop.load(Ordering::Acquire) {
        if let Some(job) = next_job(shared, index) {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                warn!(
                    index,
                    panic = %describe_panic(payload.as_ref()),
                    "job panicked on a stealing worker thread"
                );
            }
        } else {
            // Yield rather than sleep: stolen workloads tend to be latency-sensitive.
            thread::yield_now();
        }
    }

    debug!(index, "stealing worker exiting");
}

fn next_job(shared: &Arc<StealShared>, index: usize) -> Option<Job> {
    let own = &shared.slots[index];

    // 1. Local queue first.
    if let Some(job) = own.local.dequeue() {
        if own.local.is_empty() {
            own.has_work.store(false, Ordering::Release);
        }
        return Some(job);
    }

    // 2. Global spillover.
    if let Some(job) = shared.global.dequeue() {
        return Some(job);
    }

    // 3. One randomized probe round over the siblings.
    let count = shared.slots.len();
    let start = fastrand::usize(..count);
    for offset in 0..count {
        let victim = (start + offset) % count;
        if victim == index {
            continue;
        }
        let slot = &shared.slots[victim];
        if slot.has_work.load(Ordering::Acquire)
            && let Some(job) = slot.local.dequeue()
        {
            return Some(job);
        }
    }

    None
}
