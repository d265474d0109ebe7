// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::{CACHE_LINE_SIZE, Error, Result};

const ERR_POISONED_LOCK: &str = "encountered poisoned lock";

/// Configuration for a [`SlabPool`].
///
/// All fields have usable defaults; construct via `SlabPoolOptions::default()` and override what
/// you need.
#[derive(Debug, Clone)]
pub struct SlabPoolOptions {
    /// Size of each block in bytes. Rounded up to a multiple of [`CACHE_LINE_SIZE`] so that every
    /// block in a chunk starts on a cache-line boundary.
    pub block_size: usize,

    /// Number of blocks allocated up front.
    pub initial_blocks: usize,

    /// Growth factor applied when the free list runs dry. Clamped to `[1.1, 5.0]`.
    pub expansion_factor: f64,

    /// Hard cap on the total number of blocks the pool may own.
    pub max_blocks: usize,
}

impl Default for SlabPoolOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            initial_blocks: 128,
            expansion_factor: 2.0,
            max_blocks: 128 * 32,
        }
    }
}

/// A point-in-time snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabPoolStats {
    /// Size of each block in bytes (after alignment rounding).
    pub block_size: usize,
    /// Total blocks owned by the pool across all chunks.
    pub total_blocks: usize,
    /// Blocks currently sitting on the free list.
    pub free_blocks: usize,
    /// Blocks currently handed out.
    pub allocated_blocks: usize,
    /// Number of backing chunks.
    pub chunks: usize,
    /// Total bytes of backing memory.
    pub total_bytes: usize,
}

/// A fixed-block allocator with dynamic expansion.
///
/// The pool carves large chunks into equally-sized, cache-line-aligned blocks and hands them out
/// from a free list. When the free list runs dry the pool grows by `expansion_factor`, up to
/// `max_blocks`; past the cap, [`allocate`][Self::allocate] fails with [`Error::Exhausted`].
///
/// Ownership of every chunk is retained by the pool, which allows
/// [`deallocate`][Self::deallocate] to reject pointers that did not come from this pool. The
/// ownership check is a linear scan over the chunk list, which stays cheap because expansion
/// produces few, large chunks.
///
/// # Thread safety
///
/// This type is thread-safe. A single mutex guards the free list and the chunk list; the pool is
/// intended for allocation-rate workloads where that mutex is not the bottleneck.
#[derive(Debug)]
pub struct SlabPool {
    block_size: usize,
    initial_blocks: usize,
    expansion_factor: f64,
    max_blocks: usize,
    inner: Mutex<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    free: Vec<NonNull<u8>>,
    chunks: Vec<Chunk>,
    total_blocks: usize,
    allocated: usize,
}

#[derive(Debug)]
struct Chunk {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Chunk {
    fn contains(&self, ptr: NonNull<u8>) -> bool {
        let start = self.ptr.as_ptr() as usize;
        let end = start + self.layout.size();
        let p = ptr.as_ptr() as usize;
        p >= start && p < end
    }
}

// SAFETY: the raw pointers inside are only ever dereferenced while holding the inner mutex or by
// the block's current owner, and the backing chunks live as long as the pool itself.
unsafe impl Send for SlabPool {}
// SAFETY: all shared access goes through the inner mutex.
unsafe impl Sync for SlabPool {}

impl SlabPool {
    /// Creates a pool from the given options, allocating the initial chunk immediately.
    pub fn new(options: SlabPoolOptions) -> Self {
        let block_size = options.block_size.max(1).next_multiple_of(CACHE_LINE_SIZE);
        let expansion_factor = options.expansion_factor.clamp(1.1, 5.0);
        let max_blocks = options.max_blocks.max(options.initial_blocks);

        let pool = Self {
            block_size,
            initial_blocks: options.initial_blocks,
            expansion_factor,
            max_blocks,
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                chunks: Vec::new(),
                total_blocks: 0,
                allocated: 0,
            }),
        };

        {
            let mut inner = pool.inner.lock().expect(ERR_POISONED_LOCK);
            Self::expand(&pool, &mut inner, options.initial_blocks);
        }

        pool
    }

    /// Creates a pool with the default options.
    pub fn with_defaults() -> Self {
        Self::new(SlabPoolOptions::default())
    }

    /// Size of each block in bytes, after alignment rounding.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Takes one block from the pool, growing it if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Exhausted`] once the pool holds `max_blocks` blocks and all of them are
    /// in use.
    pub fn allocate(&self) -> Result<NonNull<u8>> {
        let mut inner = self.inner.lock().expect(ERR_POISONED_LOCK);

        if inner.free.is_empty() {
            // Grow geometrically, but never by less than a quarter of the initial size.
            let growth = ((inner.total_blocks as f64 * (self.expansion_factor - 1.0)) as usize)
                .max(self.initial_blocks / 4);
            let capped = growth.min(self.max_blocks.saturating_sub(inner.total_blocks));
            if capped > 0 {
                Self::expand(self, &mut inner, capped);
            }
        }

        if inner.free.is_empty() && inner.total_blocks < self.max_blocks {
            // The geometric step rounded to zero; take the smallest possible step instead.
            Self::expand(self, &mut inner, 1);
        }

        let Some(ptr) = inner.free.pop() else {
            return Err(Error::Exhausted {
                max_blocks: self.max_blocks,
            });
        };

        inner.allocated += 1;
        Ok(ptr)
    }

    /// Returns a block to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ForeignPointer`] if `ptr` does not lie within a chunk owned by this pool.
    /// Foreign pointers indicate a caller bug and are never silently accepted.
    pub fn deallocate(&self, ptr: NonNull<u8>) -> Result<()> {
        let mut inner = self.inner.lock().expect(ERR_POISONED_LOCK);

        if !inner.chunks.iter().any(|chunk| chunk.contains(ptr)) {
            return Err(Error::ForeignPointer);
        }

        inner.free.push(ptr);
        inner.allocated = inner.allocated.saturating_sub(1);
        Ok(())
    }

    /// Snapshots the current occupancy counters.
    pub fn stats(&self) -> SlabPoolStats {
        let inner = self.inner.lock().expect(ERR_POISONED_LOCK);
        SlabPoolStats {
            block_size: self.block_size,
            total_blocks: inner.total_blocks,
            free_blocks: inner.free.len(),
            allocated_blocks: inner.allocated,
            chunks: inner.chunks.len(),
            total_bytes: inner.total_blocks * self.block_size,
        }
    }

    fn expand(&self, inner: &mut PoolInner, additional_blocks: usize) {
        if additional_blocks == 0 {
            return;
        }

        let layout = Layout::from_size_align(self.block_size * additional_blocks, CACHE_LINE_SIZE)
            .expect("block size and count were validated at construction");

        // SAFETY: the layout has non-zero size because block_size >= CACHE_LINE_SIZE and
        // additional_blocks > 0.
        let raw = unsafe { alloc::alloc(layout) };
        let Some(base) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };

        for i in 0..additional_blocks {
            // SAFETY: the offset stays within the freshly allocated chunk.
            let block = unsafe { base.add(i * self.block_size) };
            inner.free.push(block);
        }

        inner.total_blocks += additional_blocks;
        inner.chunks.push(Chunk { ptr: base, layout });
    }
}

impl Drop for SlabPool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().expect(ERR_POISONED_LOCK);
        for chunk in inner.chunks.drain(..) {
            // SAFETY: the chunk was allocated with exactly this layout and is freed once, here.
            unsafe { alloc::dealloc(chunk.ptr.as_ptr(), chunk.layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool() -> SlabPool {
        SlabPool::new(SlabPoolOptions {
            block_size: 64,
            initial_blocks: 4,
            expansion_factor: 2.0,
            max_blocks: 16,
        })
    }

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(SlabPool: Send, Sync);
    }

    #[test]
    fn allocate_and_deallocate_round_trip() {
        let pool = small_pool();

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a, b);

        pool.deallocate(a).unwrap();
        pool.deallocate(b).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.allocated_blocks, 0);
        assert_eq!(stats.free_blocks, stats.total_blocks);
    }

    #[test]
    fn blocks_are_cache_line_aligned() {
        let pool = SlabPool::new(SlabPoolOptions {
            block_size: 100, // deliberately not a multiple of 64
            ..SlabPoolOptions::default()
        });

        assert_eq!(pool.block_size() % CACHE_LINE_SIZE, 0);

        let block = pool.allocate().unwrap();
        assert_eq!(block.as_ptr() as usize % CACHE_LINE_SIZE, 0);
        pool.deallocate(block).unwrap();
    }

    #[test]
    fn expands_until_cap_then_fails() {
        let pool = small_pool();

        let mut held = Vec::new();
        for _ in 0..16 {
            held.push(pool.allocate().unwrap());
        }

        assert!(matches!(
            pool.allocate(),
            Err(Error::Exhausted { max_blocks: 16 })
        ));

        for ptr in held {
            pool.deallocate(ptr).unwrap();
        }
    }

    #[test]
    fn foreign_pointer_is_rejected() {
        let pool = small_pool();

        let mut outside = 0_u8;
        let foreign = NonNull::from(&mut outside);

        assert!(matches!(
            pool.deallocate(foreign),
            Err(Error::ForeignPointer)
        ));
    }

    #[test]
    fn recycling_does_not_grow_resident_chunks() {
        let pool = small_pool();

        let chunks_before = pool.stats().chunks;
        for _ in 0..1000 {
            let ptr = pool.allocate().unwrap();
            pool.deallocate(ptr).unwrap();
        }
        let stats = pool.stats();

        assert_eq!(stats.chunks, chunks_before);
        assert!(stats.total_blocks <= 16);
    }

    #[test]
    fn expansion_factor_is_clamped() {
        // A pathological factor must not cause runaway growth on the first expansion.
        let pool = SlabPool::new(SlabPoolOptions {
            block_size: 64,
            initial_blocks: 4,
            expansion_factor: 1000.0,
            max_blocks: 64,
        });

        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(pool.allocate().unwrap());
        }

        // factor clamps to 5.0, so the first expansion adds at most 4 * 4 = 16 blocks.
        assert!(pool.stats().total_blocks <= 20);

        for ptr in held {
            pool.deallocate(ptr).unwrap();
        }
    }

    #[test]
    fn concurrent_allocate_deallocate() {
        use std::sync::Arc;

        let pool = Arc::new(SlabPool::new(SlabPoolOptions {
            block_size: 64,
            initial_blocks: 32,
            expansion_factor: 2.0,
            max_blocks: 1024,
        }));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let ptr = pool.allocate().unwrap();
                        pool.deallocate(ptr).unwrap();
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(pool.stats().allocated_blocks, 0);
    }
}
