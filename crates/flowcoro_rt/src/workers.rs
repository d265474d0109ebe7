// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::{ERR_POISONED_LOCK, Error, describe_panic, non_blocking_thread};
use flowcoro_mem::MpmcQueue;

/// How long an idle worker sleeps before re-checking the queue.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// How long shutdown waits for in-flight work before detaching stuck workers.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// A pool of worker threads draining a shared lock-free queue.
///
/// This is the CPU-offload half of the runtime: async tasks run on the driver; blocking or
/// compute-heavy callables go here via [`enqueue`][Self::enqueue]. Workers spin-poll the queue
/// with a short sleep when it is empty.
///
/// # Shutdown policy
///
/// `shutdown` (and drop) sets the stop flag, gives in-flight jobs a 500 ms grace period, joins
/// the workers that exited in time and *detaches* any that are still stuck. A worker wedged in
/// a runaway job would otherwise block process exit forever; trading a leaked thread for
/// process liveness is deliberate. Jobs still queued at shutdown are dropped, not run.
#[derive(Debug)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: StdMutex<Vec<thread::JoinHandle<()>>>,
}

#[derive(Debug)]
struct PoolShared {
    queue: MpmcQueue<Job>,
    stop: AtomicBool,
    active: AtomicUsize,
}

impl WorkerPool {
    /// Starts a pool with `threads` workers (minimum one).
    #[must_use]
    pub fn new(threads: usize) -> Self {
        let count = threads.max(1);
        let shared = Arc::new(PoolShared {
            queue: MpmcQueue::new(),
            stop: AtomicBool::new(false),
            active: AtomicUsize::new(count),
        });

        let handles = (0..count)
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("flowcoro-worker-{index}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("spawning a worker thread failed")
            })
            .collect();

        Self {
            shared,
            threads: StdMutex::new(handles),
        }
    }

    /// Starts a pool sized to the machine's available parallelism.
    #[must_use]
    pub fn with_default_size() -> Self {
        Self::new(default_worker_count())
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
        self.shared.queue.enqueue(Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(f));
            // A dropped handle just means nobody is interested in the result.
            _ = tx.send(result);
        }));

        Ok(WorkHandle { receiver: rx })
    }

    /// Submits a callable whose result nobody needs. The cheapest submission path.
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

        self.shared.queue.enqueue(Box::new(f));
        Ok(())
    }

    /// The number of workers that have not yet exited.
    pub fn active_workers(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Whether [`shutdown`][Self::shutdown] has begun.
    pub fn is_stopped(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    /// Stops the pool; see the type-level shutdown policy. Idempotent.
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
            // Dropping the handles detaches the stuck workers.
            warn!(
                stuck = self.active_workers(),
                "worker pool shutdown grace period expired; detaching remaining workers"
            );
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
        // Dropping the queue discards jobs that never ran.
    }
}

#[cfg_attr(test, mutants::skip)] // A worker that stops working hangs the suite, not a test.
fn worker_loop(shared: &Arc<PoolShared>) {
    non_blocking_thread::flag_current_thread();

    // The exit count must drop even if a job's panic escapes the catch below.
    let _active = scopeguard::guard((), |()| {
        shared.active.fetch_sub(1, Ordering::AcqRel);
    });

    debug!("worker running");

    while !shared.stop.load(Ordering::Acquire) {
        match shared.queue.dequeue() {
            Some(job) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                    // Contained: one panicking job must not take the worker with it.
                    warn!(
                        panic = %describe_panic(payload.as_ref()),
                        "job panicked on a worker thread"
                    );
                }
            }
            None => thread::sleep(IDLE_SLEEP),
        }
    }

    debug!("worker exiting");
}

/// Picks the default worker count from the machine's available parallelism.
pub(crate) fn default_worker_count() -> usize {
    thread::available_parallelism().map_or(4, std::num::NonZero::get)
}

/// A handle to the result of a callable submitted to a worker pool.
///
/// Await it from async code, or [`wait`][Self::wait] from ordinary threads.
#[derive(Debug)]
pub struct WorkHandle<R> {
    receiver: oneshot::Receiver<thread::Result<R>>,
}

impl<R> WorkHandle<R> {
    pub(crate) fn from_receiver(receiver: oneshot::Receiver<thread::Result<R>>) -> Self {
        Self { receiver }
    }

    /// Blocks until the callable has run, returning its result.
    ///
    /// # Panics
    ///
    /// Panics if called from a thread owned by the runtime.
    ///
    /// # Errors
    ///
    /// [`Error::Panicked`] when the callable panicked, [`Error::Shutdown`] when the pool was
    /// torn down before the callable ran.
    pub fn wait(self) -> crate::Result<R> {
        non_blocking_thread::assert_not_flagged();

        match self.receiver.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => Err(Error::Panicked(describe_panic(payload.as_ref()))),
            Err(_) => Err(Error::Shutdown),
        }
    }
}

impl<R> Future for WorkHandle<R> {
    type Output = crate::Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(Ok(value))) => Poll::Ready(Ok(value)),
            Poll::Ready(Ok(Err(payload))) => {
                Poll::Ready(Err(Error::Panicked(describe_panic(payload.as_ref()))))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Shutdown)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(WorkerPool: Send, Sync);
        static_assertions::assert_impl_all!(WorkHandle<usize>: Send);
    }

    #[test]
    fn enqueue_returns_the_result() {
        let pool = WorkerPool::new(2);

        let handle = pool.enqueue(|| 21 * 2).expect("pool is running");
        assert_eq!(handle.wait().expect("job runs to completion"), 42);
    }

    #[test]
    fn enqueue_void_runs_the_job() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicU64::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.enqueue_void(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .expect("pool is running");
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::Relaxed) < 100 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn panicking_job_is_contained() {
        let pool = WorkerPool::new(1);

        let exploding = pool
            .enqueue(|| panic!("deliberate test panic"))
            .expect("pool is running");
        match exploding.wait() {
            Err(Error::Panicked(message)) => assert_eq!(message, "deliberate test panic"),
            other => panic!("expected a captured panic, got {other:?}"),
        }

        // The worker survived and keeps serving.
        let handle = pool.enqueue(|| 7).expect("pool is running");
        assert_eq!(handle.wait().expect("job runs to completion"), 7);
    }

    #[test]
    fn enqueue_after_shutdown_fails() {
        let pool = WorkerPool::new(1);
        pool.shutdown();

        assert!(matches!(pool.enqueue(|| 1), Err(Error::Shutdown)));
        assert!(matches!(pool.enqueue_void(|| ()), Err(Error::Shutdown)));
    }

    #[test]
    fn shutdown_joins_idle_workers() {
        let pool = WorkerPool::new(4);
        pool.shutdown();
        assert_eq!(pool.active_workers(), 0);
    }

    #[test]
    fn worker_threads_are_flagged_non_blocking() {
        let pool = WorkerPool::new(1);

        let handle = pool
            .enqueue(non_blocking_thread::is_flagged)
            .expect("pool is running");
        assert!(handle.wait().expect("job runs to completion"));
    }
}
