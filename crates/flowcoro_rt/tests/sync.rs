// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg(not(miri))] // The runtime talks to the real OS, which Miri cannot do.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::time::Duration;

use flowcoro_rt::{Runtime, join_all, yield_now};
use flowcoro_sync::{Condvar, Mutex, Semaphore};

#[test]
fn mutex_increments_stay_exclusive_across_tasks() {
    let runtime = Runtime::new();
    let counter = Arc::new(Mutex::new(0_u64));
    let holders = Arc::new(AtomicI32::new(0));

    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let counter = Arc::clone(&counter);
            let holders = Arc::clone(&holders);
            runtime.spawn(async move {
                for _ in 0..1000 {
                    let mut guard = counter.lock().await;
                    assert_eq!(holders.fetch_add(1, Ordering::AcqRel), 0, "two holders at once");
                    *guard += 1;
                    flowcoro_rt::sleep_for(Duration::ZERO).await;
                    holders.fetch_sub(1, Ordering::AcqRel);
                    drop(guard);
                    yield_now().await;
                }
            })
        })
        .collect();

    for task in tasks {
        task.wait().expect("incrementing task completes");
    }

    let runtime_check = runtime.block_on(async move { *counter.lock().await });
    assert_eq!(runtime_check.expect("task completes"), 3000);
}

#[test]
fn semaphore_bounds_concurrency() {
    let runtime = Runtime::new();
    let semaphore = Arc::new(Semaphore::new(2));
    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let semaphore = Arc::clone(&semaphore);
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            runtime.spawn(async move {
                let permit = semaphore.acquire().await;
                let now = concurrent.fetch_add(1, Ordering::AcqRel) + 1;
                peak.fetch_max(now, Ordering::AcqRel);

                flowcoro_rt::sleep_for(Duration::from_millis(5)).await;

                concurrent.fetch_sub(1, Ordering::AcqRel);
                drop(permit);
            })
        })
        .collect();

    for task in tasks {
        task.wait().expect("permit-holding task completes");
    }

    assert!(peak.load(Ordering::Acquire) <= 2, "permit bound was violated");
}

#[test]
fn condvar_notify_one_releases_a_single_waiter() {
    let runtime = Runtime::new();
    let condvar = Arc::new(Condvar::new());
    let released = Arc::new(AtomicUsize::new(0));

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let condvar = Arc::clone(&condvar);
            let released = Arc::clone(&released);
            runtime.spawn(async move {
                condvar.wait().await;
                released.fetch_add(1, Ordering::AcqRel);
            })
        })
        .collect();

    // Let all three park first.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while condvar.waiter_count() < 3 {
        assert!(std::time::Instant::now() < deadline, "waiters failed to park");
        std::thread::sleep(Duration::from_millis(1));
    }

    condvar.notify_one();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(released.load(Ordering::Acquire), 1);

    condvar.notify_all();
    for waiter in waiters {
        waiter.wait().expect("waiter completes");
    }
    assert_eq!(released.load(Ordering::Acquire), 3);
}

#[test]
fn join_all_collects_spawned_results() {
    let runtime = Runtime::new();

    let handles: Vec<_> = (0..10_u64)
        .map(|i| {
            let delay = runtime.sleep_for(Duration::from_millis(i));
            runtime.spawn(async move {
                delay.await;
                i * i
            })
        })
        .collect();

    let results = runtime
        .block_on(async move { join_all(handles).await })
        .expect("outer task completes")
        .expect("all children succeed");

    assert_eq!(results, (0..10_u64).map(|i| i * i).collect::<Vec<_>>());
}
