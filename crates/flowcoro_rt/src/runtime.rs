// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::thread;
use std::time::Duration;

use flowcoro_lifecycle::{
    CancellationSource, CancellationToken, LifecycleStats, LifecycleTracker, RecordPool,
    RecordPoolStats,
};
use flowcoro_time::{Clock, Delay};
use tracing::debug;

use crate::{
    DriverShared, ERR_POISONED_LOCK, Error, JoinHandle, RuntimeBuilder, WorkHandle,
    WorkStealingPool, WorkerPool, create_task, non_blocking_thread,
};

/// Provides arbitrary code access to an instance of the FlowCoro runtime, allowing the caller
/// to schedule async tasks, offload CPU-bound callables, arm timers and control shutdown.
///
/// Create one via [`Runtime::new`] or customize it through [`RuntimeBuilder`]. For code that
/// cannot thread a runtime reference around, the process-wide instance is reachable through
/// [`global()`].
///
/// When an instance of this type is dropped, the driver is stopped, outstanding tasks resolve
/// with [`Error::Shutdown`], and the worker pool is torn down. This blocks the current thread
/// until shutdown completes, which implies that instances should not be dropped on a thread
/// owned by the runtime itself.
///
/// # Thread safety
///
/// This type is thread-safe. Share it freely (e.g. via `Arc`); all methods take `&self`.
/// Methods that may block the thread must not be called from threads owned by the runtime, or
/// they will panic - see the documentation of individual methods.
#[derive(Debug)]
pub struct Runtime {
    shared: Arc<RuntimeShared>,
    driver_thread: StdMutex<Option<thread::JoinHandle<()>>>,
}

#[derive(Debug)]
pub(crate) struct RuntimeShared {
    pub(crate) driver: Arc<DriverShared>,
    pub(crate) clock: Clock,
    pub(crate) offload: Offload,
    pub(crate) tracker: Arc<LifecycleTracker>,
    pub(crate) records: RecordPool,
}

/// The configured offload pool variant.
#[derive(Debug)]
pub(crate) enum Offload {
    Shared(WorkerPool),
    Stealing(WorkStealingPool),
}

impl Offload {
    fn enqueue<F, R>(&self, f: F) -> crate::Result<WorkHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        match self {
            Self::Shared(pool) => pool.enqueue(f),
            Self::Stealing(pool) => pool.enqueue(f),
        }
    }

    fn enqueue_void<F>(&self, f: F) -> crate::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            Self::Shared(pool) => pool.enqueue_void(f),
            Self::Stealing(pool) => pool.enqueue_void(f),
        }
    }

    fn shutdown(&self) {
        match self {
            Self::Shared(pool) => pool.shutdown(),
            Self::Stealing(pool) => pool.shutdown(),
        }
    }
}

impl Runtime {
    /// Creates and starts a runtime with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        RuntimeBuilder::new().build()
    }

    pub(crate) fn from_parts(
        shared: Arc<RuntimeShared>,
        driver_thread: StdMutex<Option<thread::JoinHandle<()>>>,
    ) -> Self {
        Self {
            shared,
            driver_thread,
        }
    }

    /// Starts a new async task.
    ///
    /// The task begins executing immediately, on the calling thread, up to its first suspension
    /// point; it then migrates to the driver. Dropping the returned handle detaches the task.
    pub fn spawn<F, T>(&self, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_with_token(CancellationToken::none(), future)
    }

    /// Starts a new async task observing `token`.
    ///
    /// The token is checked before every resumption (and once more when the body produces its
    /// value); a cancelled task resolves its handle with [`Error::Cancelled`].
    pub fn spawn_with_token<F, T>(&self, token: CancellationToken, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (core, handle) = create_task(&self.shared.driver, &self.shared.tracker, token, None, future);

        if self.shared.driver.is_stopped() {
            core.abandon();
            return handle;
        }

        // Eager start: run until the first suspension point on the caller's thread.
        core.run();
        handle
    }

    /// Starts a new async task bound to a pooled record carrying `name` for diagnostics.
    ///
    /// The record returns to the pool when the task finishes.
    pub fn spawn_named<F, T>(&self, name: &str, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let record = self.shared.records.acquire(name);
        let (core, handle) = create_task(
            &self.shared.driver,
            &self.shared.tracker,
            CancellationToken::none(),
            Some(record),
            future,
        );

        if self.shared.driver.is_stopped() {
            core.abandon();
            return handle;
        }

        core.run();
        handle
    }

    /// Offloads a CPU-bound callable to the worker pool.
    ///
    /// # Errors
    ///
    /// [`Error::Shutdown`] when the runtime has been stopped.
    pub fn offload<F, R>(&self, f: F) -> crate::Result<WorkHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.shared.offload.enqueue(f)
    }

    /// Offloads a callable whose result nobody needs.
    ///
    /// # Errors
    ///
    /// [`Error::Shutdown`] when the runtime has been stopped.
    pub fn offload_void<F>(&self, f: F) -> crate::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.offload.enqueue_void(f)
    }

    /// The runtime's monotonic clock.
    pub fn clock(&self) -> &Clock {
        &self.shared.clock
    }

    /// A future that completes `duration` from now.
    pub fn sleep_for(&self, duration: Duration) -> Delay {
        Delay::with_clock(&self.shared.clock, duration)
    }

    /// A token that cancels itself once `duration` elapses, with a message naming the deadline.
    ///
    /// This is the standard way to wire a timeout into any cancellable operation: pass the
    /// token to [`spawn_with_token`][Self::spawn_with_token] or check it from task code.
    pub fn timeout_token(&self, duration: Duration) -> CancellationToken {
        let source = CancellationSource::new();
        let token = source.token();
        self.shared.tracker.register_source(&source);

        let delay = self.sleep_for(duration);
        drop(self.spawn(async move {
            delay.await;
            source.cancel_with_reason(format!("deadline of {duration:?} elapsed"));
        }));

        token
    }

    /// Arms a timer that cancels `source` after `duration`, consuming the source.
    ///
    /// Tokens handed out before the call keep observing it.
    pub fn cancel_after(&self, source: CancellationSource, duration: Duration) {
        let delay = self.sleep_for(duration);
        drop(self.spawn(async move {
            delay.await;
            source.cancel_with_reason(format!("deadline of {duration:?} elapsed"));
        }));
    }

    /// The process-wide task statistics tracker.
    pub fn tracker(&self) -> &Arc<LifecycleTracker> {
        &self.shared.tracker
    }

    /// Snapshot of the task lifecycle counters.
    pub fn lifecycle_stats(&self) -> LifecycleStats {
        self.shared.tracker.stats()
    }

    /// Snapshot of the task record pool counters.
    pub fn record_stats(&self) -> RecordPoolStats {
        self.shared.records.stats()
    }

    /// Spawns `future` and blocks until it completes, returning its outcome.
    ///
    /// # Panics
    ///
    /// Panics if called from a thread owned by the runtime. This function is only intended to
    /// be called from a blocking-safe context such as `fn main()` or a `#[test]` entry point.
    ///
    /// # Errors
    ///
    /// Whatever the task produced; see [`JoinHandle::wait`].
    pub fn block_on<F, T>(&self, future: F) -> crate::Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        non_blocking_thread::assert_not_flagged();
        self.spawn(future).wait()
    }

    /// Asks the runtime to shut down: the driver flushes and exits, and the worker pool stops.
    ///
    /// Outstanding tasks resolve their handles with [`Error::Shutdown`]. Safe to call more
    /// than once.
    pub fn stop(&self) {
        debug!("runtime stop requested");
        self.shared.driver.initiate_stop();
        self.shared.offload.shutdown();
    }

    /// Waits for the runtime to shut down.
    ///
    /// It is safe to call this function multiple times.
    ///
    /// # Panics
    ///
    /// Panics if called from a thread owned by the runtime.
    pub fn wait(&self) {
        non_blocking_thread::assert_not_flagged();

        let handle = {
            let mut driver_thread = self.driver_thread.lock().expect(ERR_POISONED_LOCK);
            driver_thread.take()
        };
        if let Some(handle) = handle {
            _ = handle.join();
        }
    }

    /// Whether [`stop`][Self::stop] has begun.
    pub fn is_stopped(&self) -> bool {
        self.shared.driver.is_stopped()
    }

    pub(crate) fn shared(&self) -> &Arc<RuntimeShared> {
        &self.shared
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
        self.wait();
    }
}

static GLOBAL: OnceLock<Runtime> = OnceLock::new();

/// Installs a custom-configured runtime as the process-wide instance.
///
/// Must run before the first [`global()`] access.
///
/// # Errors
///
/// [`Error::Programming`] when a global runtime already exists; the freshly built runtime is
/// shut down again in that case.
pub fn init_global(builder: RuntimeBuilder) -> crate::Result<()> {
    GLOBAL.set(builder.build()).map_err(|_rejected| {
        Error::Programming(String::from("the global runtime is already initialized"))
    })
}

/// The process-wide runtime, started on first use with the default configuration.
pub fn global() -> &'static Runtime {
    GLOBAL.get_or_init(Runtime::new)
}

/// Starts a new async task on the [`global()`] runtime. See [`Runtime::spawn`].
pub fn spawn<F, T>(future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    global().spawn(future)
}

/// A future that completes `duration` from now, on the [`global()`] runtime's clock.
pub fn sleep_for(duration: Duration) -> Delay {
    global().sleep_for(duration)
}

/// Spawns `future` on the [`global()`] runtime and drives the scheduler from the calling
/// thread until it completes.
///
/// This is the blocking bridge from non-coroutine code into coroutine code: the calling thread
/// lends itself to the driver loop instead of merely parking, so `sync_wait` works even while
/// the dedicated driver thread is saturated.
///
/// # Panics
///
/// Panics if called from a thread owned by the runtime (a driver or worker thread); blocking
/// there is a programming error that could deadlock the scheduler.
///
/// # Errors
///
/// Whatever the task produced; see [`JoinHandle::wait`].
pub fn sync_wait<F, T>(future: F) -> crate::Result<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    non_blocking_thread::assert_not_flagged();

    let runtime = global();
    let mut handle = runtime.spawn(future);

    loop {
        if let Some(result) = handle.try_result() {
            return result;
        }

        _ = runtime.shared().driver.drive();

        if let Some(result) = handle.try_result() {
            return result;
        }

        runtime.shared().driver.wait_briefly();
    }
}
