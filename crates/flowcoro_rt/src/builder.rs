// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::{Arc, Mutex as StdMutex};
use std::thread;

use flowcoro_lifecycle::{LifecycleTracker, RecordPool, RecordPoolOptions};
use flowcoro_time::runtime::InactiveClock;
use tracing::debug;

use crate::{
    DriverShared, Offload, Runtime, RuntimeShared, WorkStealingPool, WorkerPool,
    default_worker_count, non_blocking_thread,
};

/// Configures and starts a [`Runtime`].
///
/// All options have defaults; `RuntimeBuilder::new().build()` is equivalent to
/// [`Runtime::new`].
///
/// ```
/// use flowcoro_rt::RuntimeBuilder;
///
/// let runtime = RuntimeBuilder::new()
///     .worker_threads(2)
///     .work_stealing(true)
///     .build();
///
/// let result = runtime.block_on(async { 2 + 2 });
/// assert_eq!(result.unwrap(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeBuilder {
    worker_threads: Option<usize>,
    work_stealing: bool,
    record_pool: RecordPoolOptions,
}

impl RuntimeBuilder {
    /// A builder with every option at its default.
    #[must_use]
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            work_stealing: false,
            record_pool: RecordPoolOptions::default(),
        }
    }

    /// The number of offload worker threads. Defaults to the machine's available parallelism.
    #[must_use]
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = Some(count);
        self
    }

    /// Use the work-stealing worker pool instead of the shared-queue pool.
    #[must_use]
    pub fn work_stealing(mut self, enabled: bool) -> Self {
        self.work_stealing = enabled;
        self
    }

    /// Configuration for the task record pool.
    #[must_use]
    pub fn record_pool(mut self, options: RecordPoolOptions) -> Self {
        self.record_pool = options;
        self
    }

    /// Starts the runtime: activates the clock, launches the driver thread and the worker
    /// pool, and returns the handle that owns them all.
    #[must_use]
    pub fn build(self) -> Runtime {
        let worker_count = self.worker_threads.unwrap_or_else(default_worker_count);

        let (clock, clock_driver) = InactiveClock::default().activate();
        let driver = DriverShared::new(clock_driver);

        let offload = if self.work_stealing {
            Offload::Stealing(WorkStealingPool::new(worker_count))
        } else {
            Offload::Shared(WorkerPool::new(worker_count))
        };

        let shared = Arc::new(RuntimeShared {
            driver: Arc::clone(&driver),
            clock,
            offload,
            tracker: Arc::new(LifecycleTracker::new()),
            records: RecordPool::new(self.record_pool),
        });

        let driver_thread = thread::Builder::new()
            .name(String::from("flowcoro-driver"))
            .spawn(move || {
                non_blocking_thread::flag_current_thread();
                driver.run_loop();
            })
            .expect("spawning the driver thread failed");

        debug!(
            workers = worker_count,
            stealing = self.work_stealing,
            "runtime started"
        );

        Runtime::from_parts(shared, StdMutex::new(Some(driver_thread)))
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
