// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg(not(miri))] // The runtime talks to the real OS, which Miri cannot do.

use std::time::{Duration, Instant};

use flowcoro_rt::{Either3, Runtime, sync_wait, when_any3};
use flowcoro_time::{FutureExt, Stopwatch};

#[test]
fn sleep_for_is_never_early() {
    let started = Instant::now();

    let finished = sync_wait(async {
        flowcoro_rt::sleep_for(Duration::from_millis(100)).await;
        Instant::now()
    })
    .expect("task completes");

    assert!(finished.duration_since(started) >= Duration::from_millis(100));
    // Generous upper bound; this only catches a driver that stopped advancing timers.
    assert!(finished.duration_since(started) < Duration::from_secs(5));
}

#[test]
fn sequential_sleeps_accumulate() {
    let runtime = Runtime::new();
    let watch = Stopwatch::with_clock(runtime.clock());

    runtime
        .block_on({
            let first = runtime.sleep_for(Duration::from_millis(20));
            let second = runtime.sleep_for(Duration::from_millis(30));
            async move {
                first.await;
                second.await;
            }
        })
        .expect("task completes");

    assert!(watch.elapsed() >= Duration::from_millis(50));
}

#[test]
fn when_any_returns_the_fastest_task() {
    let runtime = Runtime::new();
    let started = Instant::now();

    let fast = {
        let delay = runtime.sleep_for(Duration::from_millis(50));
        runtime.spawn(async move {
            delay.await;
            1_i32
        })
    };
    let slow = {
        let delay = runtime.sleep_for(Duration::from_millis(500));
        runtime.spawn(async move {
            delay.await;
            "x"
        })
    };
    let medium = {
        let delay = runtime.sleep_for(Duration::from_millis(200));
        runtime.spawn(async move {
            delay.await;
            3.14_f64
        })
    };

    let (index, value) = runtime
        .block_on(when_any3(fast, slow, medium))
        .expect("the outer task itself completes")
        .expect("a task wins the race");

    assert_eq!(index, 0);
    assert_eq!(value, Either3::First(1));
    // The race ends with the winner, long before the stragglers would finish.
    assert!(started.elapsed() < Duration::from_millis(450));
}

#[test]
fn timeout_cuts_off_a_slow_future() {
    let runtime = Runtime::new();
    let clock = runtime.clock().clone();

    let result = runtime.block_on({
        let slow = runtime.sleep_for(Duration::from_secs(30));
        async move { slow.with_timeout(&clock, Duration::from_millis(20)).await }
    });

    let timed_out = result.expect("the outer task itself completes");
    assert!(matches!(
        timed_out,
        Err(flowcoro_time::Error::TimedOut { waited }) if waited == Duration::from_millis(20)
    ));
}

#[test]
fn timeout_passes_a_fast_future_through() {
    let runtime = Runtime::new();
    let clock = runtime.clock().clone();

    let result = runtime.block_on({
        let quick = runtime.sleep_for(Duration::from_millis(5));
        async move {
            quick
                .with_timeout(&clock, Duration::from_secs(30))
                .await
                .map(|()| "made it")
        }
    });

    assert_eq!(result.expect("task completes").expect("no timeout"), "made it");
}

#[test]
fn timers_fire_in_deadline_order() {
    let runtime = Runtime::new();

    let order = runtime
        .block_on({
            let long = runtime.sleep_for(Duration::from_millis(60));
            let short = runtime.sleep_for(Duration::from_millis(10));
            let medium = runtime.sleep_for(Duration::from_millis(30));
            async move {
                let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

                let record = |label: &'static str| {
                    let order = std::sync::Arc::clone(&order);
                    move || order.lock().expect("no poisoning in test").push(label)
                };

                let (on_long, on_short, on_medium) = (record("long"), record("short"), record("medium"));
                futures::join!(
                    async move {
                        long.await;
                        on_long();
                    },
                    async move {
                        short.await;
                        on_short();
                    },
                    async move {
                        medium.await;
                        on_medium();
                    },
                );

                std::sync::Arc::try_unwrap(order)
                    .expect("all clones dropped")
                    .into_inner()
                    .expect("no poisoning in test")
            }
        })
        .expect("task completes");

    assert_eq!(order, vec!["short", "medium", "long"]);
}
