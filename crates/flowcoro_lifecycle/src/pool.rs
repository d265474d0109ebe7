// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::ERR_POISONED_LOCK;

/// Configuration for a [`RecordPool`].
#[derive(Debug, Clone)]
pub struct RecordPoolOptions {
    /// Idle records preserved even when the janitor evicts.
    pub min_records: usize,
    /// Idle records kept at most; releases beyond this are dropped instead of pooled.
    pub max_records: usize,
    /// How long a record may sit idle before the janitor evicts it.
    pub idle_timeout: Duration,
    /// How often the janitor sweeps.
    pub sweep_interval: Duration,
}

impl Default for RecordPoolOptions {
    fn default() -> Self {
        Self {
            min_records: 10,
            max_records: 1000,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Per-task bookkeeping that is worth reusing across task invocations.
///
/// Records carry their own telemetry: creation time, last-use time and how often they were
/// handed out again.
#[derive(Debug)]
pub struct TaskRecord {
    created_at: Instant,
    last_used: Instant,
    reuse_count: u64,
    name: String,
}

impl TaskRecord {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            created_at: now,
            last_used: now,
            reuse_count: 0,
            name: String::new(),
        }
    }

    /// When this record was first allocated.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// How often the record has been handed out from the pool after its first use.
    pub fn reuse_count(&self) -> u64 {
        self.reuse_count
    }

    /// The debug name bound at acquisition.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }
}

/// Occupancy and cache-effectiveness counters for a [`RecordPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPoolStats {
    /// Records in existence (pooled + handed out).
    pub total: usize,
    /// Records currently handed out.
    pub active: usize,
    /// Records sitting idle in the pool.
    pub pooled: usize,
    /// Acquisitions served from the pool.
    pub hits: u64,
    /// Acquisitions that had to allocate.
    pub misses: u64,
}

impl RecordPoolStats {
    /// Fraction of acquisitions served from the pool, as a percentage.
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64 * 100.0
        }
    }

    /// Rough estimate of allocation traffic avoided by reuse.
    pub fn bytes_saved(&self) -> u64 {
        self.hits * std::mem::size_of::<TaskRecord>() as u64
    }
}

struct PoolShared {
    idle: Mutex<VecDeque<TaskRecord>>,
    active: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    options: RecordPoolOptions,
    stop: Mutex<bool>,
    stop_signal: Condvar,
}

impl PoolShared {
    #[cfg_attr(test, mutants::skip)] // Sweep cadence mutations only stall the janitor.
    fn sweep(&self) {
        let now = Instant::now();
        let mut idle = self.idle.lock().expect(ERR_POISONED_LOCK);

        let mut evicted = 0_usize;
        while idle.len() > self.options.min_records {
            let Some(front) = idle.front() else { break };
            if front.idle_for(now) <= self.options.idle_timeout {
                // The queue is released-order, so everything behind the front is fresher.
                break;
            }
            idle.pop_front();
            evicted += 1;
        }

        if evicted > 0 {
            debug!(evicted, remaining = idle.len(), "record pool janitor evicted idle records");
        }
    }
}

impl std::fmt::Debug for PoolShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolShared")
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A pool of reusable [`TaskRecord`]s with a background janitor.
///
/// Acquisition pops an idle record when one exists (a cache hit) and allocates otherwise.
/// Releasing the [`PooledGuard`] returns the record unless the pool is already at
/// `max_records`. The janitor thread evicts records idle past `idle_timeout`, never shrinking
/// below `min_records`.
#[derive(Debug)]
pub struct RecordPool {
    shared: Arc<PoolShared>,
    janitor: Option<thread::JoinHandle<()>>,
}

impl RecordPool {
    /// Creates a pool, pre-filling `min_records` records and starting the janitor thread.
    #[must_use]
    pub fn new(options: RecordPoolOptions) -> Self {
        let mut idle = VecDeque::with_capacity(options.min_records);
        for _ in 0..options.min_records {
            idle.push_back(TaskRecord::new());
        }

        let shared = Arc::new(PoolShared {
            idle: Mutex::new(idle),
            active: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            options,
            stop: Mutex::new(false),
            stop_signal: Condvar::new(),
        });

        let janitor = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("flowcoro-record-janitor".to_string())
                .spawn(move || Self::janitor_loop(&shared))
                .expect("spawning the janitor thread failed")
        };

        Self {
            shared,
            janitor: Some(janitor),
        }
    }

    /// Creates a pool with the default options.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RecordPoolOptions::default())
    }

    /// Takes a record from the pool (or allocates one) and binds the given debug name.
    pub fn acquire(&self, name: impl Into<String>) -> PooledGuard {
        let reused = {
            let mut idle = self.shared.idle.lock().expect(ERR_POISONED_LOCK);
            idle.pop_back()
        };

        let mut record = match reused {
            Some(mut record) => {
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                record.reuse_count += 1;
                record
            }
            None => {
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                TaskRecord::new()
            }
        };

        record.name = name.into();
        record.last_used = Instant::now();
        self.shared.active.fetch_add(1, Ordering::Relaxed);

        PooledGuard {
            record: Some(record),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Snapshots occupancy and cache counters.
    pub fn stats(&self) -> RecordPoolStats {
        let pooled = self.shared.idle.lock().expect(ERR_POISONED_LOCK).len();
        let active = self.shared.active.load(Ordering::Relaxed);
        RecordPoolStats {
            total: pooled + active,
            active,
            pooled,
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
        }
    }

    #[cfg_attr(test, mutants::skip)] // An immortal janitor only shows up as a hung test run.
    fn janitor_loop(shared: &Arc<PoolShared>) {
        let mut stopped = shared.stop.lock().expect(ERR_POISONED_LOCK);
        loop {
            let (guard, timeout) = shared
                .stop_signal
                .wait_timeout(stopped, shared.options.sweep_interval)
                .expect(ERR_POISONED_LOCK);
            stopped = guard;

            if *stopped {
                return;
            }
            if timeout.timed_out() {
                drop(stopped);
                shared.sweep();
                stopped = shared.stop.lock().expect(ERR_POISONED_LOCK);
            }
        }
    }
}

impl Drop for RecordPool {
    fn drop(&mut self) {
        {
            let mut stopped = self.shared.stop.lock().expect(ERR_POISONED_LOCK);
            *stopped = true;
        }
        self.shared.stop_signal.notify_all();

        if let Some(janitor) = self.janitor.take() {
            _ = janitor.join();
        }
    }
}

/// Holds a borrowed [`TaskRecord`]; returns it to the pool on drop.
#[derive(Debug)]
pub struct PooledGuard {
    record: Option<TaskRecord>,
    shared: Arc<PoolShared>,
}

impl Deref for PooledGuard {
    type Target = TaskRecord;

    fn deref(&self) -> &TaskRecord {
        self.record.as_ref().expect("record is present until drop")
    }
}

impl DerefMut for PooledGuard {
    fn deref_mut(&mut self) -> &mut TaskRecord {
        self.record.as_mut().expect("record is present until drop")
    }
}

impl Drop for PooledGuard {
    fn drop(&mut self) {
        self.shared.active.fetch_sub(1, Ordering::Relaxed);

        let Some(mut record) = self.record.take() else {
            return;
        };
        record.last_used = Instant::now();

        let mut idle = self.shared.idle.lock().expect(ERR_POISONED_LOCK);
        if idle.len() < self.shared.options.max_records {
            idle.push_back(record);
        }
        // A full pool simply drops the record.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_options() -> RecordPoolOptions {
        RecordPoolOptions {
            min_records: 2,
            max_records: 4,
            idle_timeout: Duration::from_millis(20),
            sweep_interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(RecordPool: Send, Sync);
        static_assertions::assert_impl_all!(PooledGuard: Send);
    }

    #[test]
    fn acquire_prefilled_record_is_a_hit() {
        let pool = RecordPool::new(quick_options());

        let guard = pool.acquire("first");
        assert_eq!(guard.name(), "first");

        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.active, 1);
    }

    #[test]
    fn release_returns_record_for_reuse() {
        let pool = RecordPool::new(RecordPoolOptions {
            min_records: 0,
            ..quick_options()
        });

        {
            let _guard = pool.acquire("a");
        }
        assert_eq!(pool.stats().misses, 1);

        let guard = pool.acquire("b");
        assert_eq!(guard.reuse_count(), 1);
        assert_eq!(pool.stats().hits, 1);
    }

    #[test]
    fn full_pool_drops_released_records() {
        let pool = RecordPool::new(RecordPoolOptions {
            min_records: 0,
            max_records: 1,
            idle_timeout: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(3600),
        });

        let a = pool.acquire("a");
        let b = pool.acquire("b");
        drop(a);
        drop(b);

        assert_eq!(pool.stats().pooled, 1);
    }

    #[test]
    fn janitor_evicts_idle_records_down_to_minimum() {
        let pool = RecordPool::new(RecordPoolOptions {
            min_records: 1,
            max_records: 16,
            idle_timeout: Duration::from_millis(10),
            sweep_interval: Duration::from_millis(5),
        });

        let guards: Vec<_> = (0..6).map(|i| pool.acquire(format!("task-{i}"))).collect();
        drop(guards);

        // Give the janitor a few sweep intervals to notice the idle records.
        std::thread::sleep(Duration::from_millis(100));

        let stats = pool.stats();
        assert_eq!(stats.pooled, 1, "janitor must preserve min_records");
    }

    #[test]
    fn hit_ratio_and_bytes_saved() {
        let stats = RecordPoolStats {
            total: 0,
            active: 0,
            pooled: 0,
            hits: 3,
            misses: 1,
        };

        assert!((stats.hit_ratio() - 75.0).abs() < f64::EPSILON);
        assert_eq!(
            stats.bytes_saved(),
            3 * std::mem::size_of::<TaskRecord>() as u64
        );

        let empty = RecordPoolStats {
            total: 0,
            active: 0,
            pooled: 0,
            hits: 0,
            misses: 0,
        };
        assert!(empty.hit_ratio().abs() < f64::EPSILON);
    }
}
