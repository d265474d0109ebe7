// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::{CACHE_LINE_SIZE, CachePadded, SlabPool, SlabPoolOptions};

/// How many node blocks a fresh queue's pool carves out up front.
const INITIAL_NODE_BLOCKS: usize = 64;

/// A node and its payload storage, allocated together as one slab block.
struct Node<T> {
    /// Points into this node's own `storage` while the element is in flight; null once a
    /// consumer has claimed it (and always null for the dummy head).
    data: AtomicPtr<T>,
    next: AtomicPtr<Node<T>>,
    storage: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Node<T> {
    const fn empty() -> Self {
        Self {
            data: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            storage: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// An unbounded lock-free multi-producer multi-consumer FIFO.
///
/// This is a Michael-Scott style linked queue with a permanent dummy head. Producers append by
/// swapping the tail pointer; consumers race for an element by exchanging its node's data
/// pointer and the winner advances the head. Head and tail sit on separate cache lines.
///
/// # Shutdown behavior
///
/// Once the queue's destructor has started, a `destroyed` flag is visible to all threads:
/// subsequent [`enqueue`][Self::enqueue] calls drop their item silently and
/// [`dequeue`][Self::dequeue] returns `None`. This lets producers race benignly against runtime
/// shutdown instead of touching freed memory.
///
/// # Memory reclamation
///
/// Every node (with its payload storage inline) is one block from a [`SlabPool`] owned by the
/// queue itself. When the winning consumer unlinks a node, its block goes back to that pool
/// immediately - never to the global allocator - and the pool's chunks live as long as the
/// queue does. A consumer that raced with the winner may therefore read from a block that was
/// just recycled, but the memory it touches is still resident and still node-shaped; the
/// re-read of `head` afterwards detects the race and discards whatever was read. Freed blocks
/// are only ever reused for other nodes of this same queue, so no type confusion is possible.
pub struct MpmcQueue<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    destroyed: CachePadded<AtomicBool>,
    pool: SlabPool,
    _marker: PhantomData<T>,
}

// SAFETY: elements cross threads through raw pointers; the queue hands each element to exactly
// one consumer, so T: Send suffices.
unsafe impl<T: Send> Send for MpmcQueue<T> {}
// SAFETY: all shared mutation happens through atomics; see the reclamation notes above.
unsafe impl<T: Send> Sync for MpmcQueue<T> {}

impl<T> MpmcQueue<T> {
    /// Creates an empty queue.
    ///
    /// # Panics
    ///
    /// Panics if `T` demands alignment beyond [`CACHE_LINE_SIZE`]; slab blocks cannot satisfy
    /// over-aligned payloads.
    pub fn new() -> Self {
        assert!(
            align_of::<Node<T>>() <= CACHE_LINE_SIZE,
            "queue elements must not require alignment beyond a cache line"
        );

        let pool = SlabPool::new(SlabPoolOptions {
            block_size: size_of::<Node<T>>(),
            initial_blocks: INITIAL_NODE_BLOCKS,
            expansion_factor: 2.0,
            max_blocks: usize::MAX,
        });

        let dummy = Self::allocate_node(&pool);

        Self {
            head: CachePadded::new(AtomicPtr::new(dummy)),
            tail: CachePadded::new(AtomicPtr::new(dummy)),
            destroyed: CachePadded::new(AtomicBool::new(false)),
            pool,
            _marker: PhantomData,
        }
    }

    /// Appends an item to the queue.
    ///
    /// If the queue destructor has already begun, the item is dropped silently.
    pub fn enqueue(&self, item: T) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }

        let node = Self::allocate_node(&self.pool);
        // SAFETY: the block was just allocated and initialized; nothing else can reach it yet.
        unsafe {
            let slot = (*node).storage.get().cast::<T>();
            slot.write(item);
            (*node).data.store(slot, Ordering::Release);
        }

        let prev = self.tail.swap(node, Ordering::AcqRel);
        // SAFETY: `prev` cannot have been recycled yet: a node's block is only released after
        // the head advances past it, and the head cannot advance past the most recent tail
        // until its `next` pointer (stored here) is published.
        unsafe { (*prev).next.store(node, Ordering::Release) };
    }

    /// Removes and returns the item at the front of the queue.
    ///
    /// Returns `None` when the queue is momentarily empty, already destroyed, or when another
    /// consumer won the race for the front element. Callers that poll in a loop treat all three
    /// identically.
    #[cfg_attr(test, mutants::skip)] // Liveness-critical; mutations hang the stress tests.
    pub fn dequeue(&self) -> Option<T> {
        if self.destroyed.load(Ordering::Acquire) {
            return None;
        }

        loop {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: `head` points into this queue's pool, whose chunks stay resident for the
            // queue's whole life. Worst case the block was recycled by a faster consumer and
            // this reads a stale or unrelated `next` value; the re-check below discards it.
            let next = unsafe { (*head).next.load(Ordering::Acquire) };

            if self.head.load(Ordering::Acquire) != head {
                // The head advanced under us; whatever we read belongs to a dead node.
                continue;
            }

            if next.is_null() {
                return None;
            }

            // SAFETY: `next` is reachable from the still-current head, so it is a live node;
            // it cannot be released before the head advances past it, which only this thread
            // can do (below) after winning the data race.
            let data = unsafe { (*next).data.swap(ptr::null_mut(), Ordering::AcqRel) };
            if data.is_null() {
                // Another consumer claimed this element first.
                return None;
            }

            // SAFETY: the swap above made this thread the unique owner of the payload, and the
            // node holding the storage stays live until our own CAS below.
            let value = unsafe { data.read() };

            // Only the consumer that claimed the element advances the head, so this CAS cannot
            // race with another advancement of the same node.
            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // The old head is unlinked; recycle its block into the queue's pool.
                self.release_node(head);
            }

            return Some(value);
        }
    }

    /// Whether the queue is momentarily empty.
    pub fn is_empty(&self) -> bool {
        loop {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: same pool-residency argument as in `dequeue`: a recycled block yields a
            // stale value, and the re-check below discards it.
            let next = unsafe { (*head).next.load(Ordering::Acquire) };

            if self.head.load(Ordering::Acquire) == head {
                return next.is_null();
            }
        }
    }

    fn allocate_node(pool: &SlabPool) -> *mut Node<T> {
        let block = pool
            .allocate()
            .expect("the queue pool has no block cap, so allocation cannot be refused");
        let node = block.as_ptr().cast::<Node<T>>();
        // SAFETY: the block is at least size_of::<Node<T>> bytes (the pool rounds the block
        // size up, never down) and alignment was checked at construction.
        unsafe { node.write(Node::empty()) };
        node
    }

    fn release_node(&self, node: *mut Node<T>) {
        let Some(block) = NonNull::new(node.cast::<u8>()) else {
            return;
        };
        // The pool only rejects foreign pointers, and every node block came from it.
        _ = self.pool.deallocate(block);
    }
}

impl<T> Default for MpmcQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for MpmcQueue<T> {
    fn drop(&mut self) {
        // Late producers observe this flag and drop their items instead of appending.
        self.destroyed.store(true, Ordering::Release);

        let mut current = *self.head.get_mut();
        while !current.is_null() {
            // SAFETY: drop has exclusive access; every node in the chain is a live block from
            // the pool, and undelivered payloads are dropped exactly once here.
            let next = unsafe {
                let data = *(*current).data.get_mut();
                if !data.is_null() {
                    data.drop_in_place();
                }
                *(*current).next.get_mut()
            };
            self.release_node(current);
            current = next;
        }
        // The pool field drops after this body runs, releasing the backing chunks.
    }
}

impl<T> std::fmt::Debug for MpmcQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpmcQueue")
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(MpmcQueue<usize>: Send, Sync);
    }

    #[test]
    fn fifo_in_single_threaded_use() {
        let queue = MpmcQueue::new();
        assert!(queue.is_empty());

        for i in 0..100 {
            queue.enqueue(i);
        }
        assert!(!queue.is_empty());

        for i in 0..100 {
            assert_eq!(queue.dequeue(), Some(i));
        }
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn node_blocks_are_recycled_through_the_pool() {
        let queue = MpmcQueue::new();

        // Far more traffic than the initial pool size; steady-state churn must be served from
        // recycled blocks instead of growing the pool without bound.
        for round in 0..10_000_u32 {
            queue.enqueue(round);
            assert_eq!(queue.dequeue(), Some(round));
        }

        let stats = queue.pool.stats();
        assert!(
            stats.total_blocks <= INITIAL_NODE_BLOCKS * 2,
            "alternating enqueue/dequeue grew the pool to {} blocks",
            stats.total_blocks
        );
    }

    #[test]
    fn single_producer_preserves_order() {
        let queue = Arc::new(MpmcQueue::new());

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..10_000_u32 {
                    queue.enqueue(i);
                }
            })
        };

        let mut collected = Vec::with_capacity(10_000);
        while collected.len() < 10_000 {
            if let Some(v) = queue.dequeue() {
                collected.push(v);
            } else {
                thread::yield_now();
            }
        }

        producer.join().unwrap();

        let expected: Vec<u32> = (0..10_000).collect();
        assert_eq!(collected, expected);
    }

    #[test]
    fn multiple_producers_multiple_consumers_lose_nothing() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 2_500;

        let queue = Arc::new(MpmcQueue::new());
        let popped = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.enqueue(p * PER_PRODUCER + i);
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let popped = Arc::clone(&popped);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while popped.load(Ordering::Relaxed) < PRODUCERS * PER_PRODUCER {
                        if let Some(v) = queue.dequeue() {
                            popped.fetch_add(1, Ordering::Relaxed);
                            seen.push(v);
                        } else {
                            thread::yield_now();
                        }
                    }
                    seen
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }

        let mut all = HashSet::new();
        for c in consumers {
            for v in c.join().unwrap() {
                assert!(all.insert(v), "element {v} delivered twice");
            }
        }

        assert_eq!(all.len(), PRODUCERS * PER_PRODUCER);
    }

    #[test]
    fn drop_releases_undelivered_items() {
        struct CountsDrops(Arc<AtomicUsize>);

        impl Drop for CountsDrops {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));

        {
            let queue = MpmcQueue::new();
            for _ in 0..10 {
                queue.enqueue(CountsDrops(Arc::clone(&drops)));
            }
            let taken = queue.dequeue().expect("queue has elements");
            drop(taken);
            assert_eq!(drops.load(Ordering::Relaxed), 1);
        }

        assert_eq!(drops.load(Ordering::Relaxed), 10);
    }
}
