// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg(not(miri))] // The runtime talks to the real OS, which Miri cannot do.

use std::sync::Arc;

use flowcoro_mem::{MpmcQueue, RingBuffer};
use flowcoro_rt::{Runtime, yield_now};

#[test]
fn queue_carries_ten_thousand_items_between_tasks() {
    let runtime = Runtime::new();
    let queue = Arc::new(MpmcQueue::new());

    let producer = runtime.spawn({
        let queue = Arc::clone(&queue);
        async move {
            for i in 0..10_000_u32 {
                queue.enqueue(i);
                if i % 256 == 0 {
                    yield_now().await;
                }
            }
        }
    });

    let consumer = runtime.spawn({
        let queue = Arc::clone(&queue);
        async move {
            let mut collected = Vec::with_capacity(10_000);
            while collected.len() < 10_000 {
                match queue.dequeue() {
                    Some(value) => collected.push(value),
                    None => yield_now().await,
                }
            }
            collected
        }
    });

    producer.wait().expect("producer completes");
    let collected = consumer.wait().expect("consumer completes");

    // Single producer: strict FIFO, not merely a permutation.
    assert_eq!(collected, (0..10_000).collect::<Vec<u32>>());
}

#[test]
fn ring_buffer_bridges_a_task_and_a_thread() {
    let runtime = Runtime::new();
    let ring = Arc::new(RingBuffer::new(16));

    let producer = runtime.spawn({
        let ring = Arc::clone(&ring);
        async move {
            for i in 0..1_000_u32 {
                let mut item = i;
                loop {
                    match ring.push(item) {
                        Ok(()) => break,
                        Err(back) => {
                            item = back;
                            yield_now().await;
                        }
                    }
                }
            }
        }
    });

    let mut expected = 0_u32;
    while expected < 1_000 {
        if let Some(value) = ring.pop() {
            assert_eq!(value, expected);
            expected += 1;
        } else {
            std::thread::yield_now();
        }
    }

    producer.wait().expect("producer completes");
}
