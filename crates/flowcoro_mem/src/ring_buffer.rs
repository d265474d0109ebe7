// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::CachePadded;

struct Slot<T> {
    valid: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded lock-free single-producer single-consumer FIFO.
///
/// Capacity must be a power of two so indices can be masked instead of divided. One slot is kept
/// as a separator, so a ring created with capacity `N` holds at most `N - 1` items:
/// `head == tail` means empty and `(tail + 1) & mask == head` means full.
///
/// The producer writes the slot and then releases its `valid` flag; the consumer acquires the
/// flag before reading. Head and tail indices live on separate cache lines.
///
/// # Thread safety
///
/// Exactly one thread may push and exactly one thread may pop at a time. The two roles may be
/// (and usually are) different threads.
pub struct RingBuffer<T> {
    mask: usize,
    slots: Box<[Slot<T>]>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

// SAFETY: each element is written by the single producer and read by the single consumer, with
// the per-slot valid flag providing the release/acquire edge.
unsafe impl<T: Send> Send for RingBuffer<T> {}
// SAFETY: see above; shared access is limited to the producer/consumer pair.
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Creates a ring with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two or is less than 2.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity >= 2,
            "ring buffer capacity must be a power of two >= 2"
        );

        let slots = (0..capacity)
            .map(|_| Slot {
                valid: AtomicBool::new(false),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Self {
            mask: capacity - 1,
            slots,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// The configured capacity. The ring holds at most `capacity() - 1` items.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Appends an item, returning it back if the ring is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = (tail + 1) & self.mask;

        if next == self.head.load(Ordering::Acquire) {
            return Err(item);
        }

        let slot = &self.slots[tail];
        // SAFETY: the slot between head and tail is owned by the producer, and `valid` is false,
        // so the consumer is not reading it.
        unsafe { (*slot.value.get()).write(item) };
        slot.valid.store(true, Ordering::Release);
        self.tail.store(next, Ordering::Release);

        Ok(())
    }

    /// Removes and returns the item at the front of the ring.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);

        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }

        let slot = &self.slots[head];
        if !slot.valid.load(Ordering::Acquire) {
            return None;
        }

        // SAFETY: `valid` is set, so the producer finished writing this slot and will not touch
        // it again until the consumer advances the head.
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.valid.store(false, Ordering::Release);
        self.head.store((head + 1) & self.mask, Ordering::Release);

        Some(value)
    }

    /// Appends as many items from the slice as fit, returning how many were taken.
    ///
    /// Wrap-around within the batch is handled internally; callers never need to split.
    pub fn push_batch(&self, items: &[T]) -> usize
    where
        T: Clone,
    {
        let mut pushed = 0;
        for item in items {
            if self.push(item.clone()).is_err() {
                break;
            }
            pushed += 1;
        }
        pushed
    }

    /// Pops up to `max` items into `out`, returning how many were moved.
    ///
    /// Wrap-around within the batch is handled internally; callers never need to split.
    pub fn pop_batch(&self, out: &mut Vec<T>, max: usize) -> usize {
        let mut popped = 0;
        while popped < max {
            let Some(value) = self.pop() else { break };
            out.push(value);
            popped += 1;
        }
        popped
    }

    /// Whether the ring is momentarily empty.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Whether the ring is momentarily full.
    pub fn is_full(&self) -> bool {
        let tail = self.tail.load(Ordering::Acquire);
        (tail + 1) & self.mask == self.head.load(Ordering::Acquire)
    }

    /// The number of items momentarily buffered.
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head) & self.mask
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

impl<T> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}
