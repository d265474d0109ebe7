// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Memory primitives underpinning the FlowCoro runtime.
//!
//! - [`SlabPool`]: a fixed-block allocator with dynamic expansion and cache-line alignment.
//! - [`MpmcQueue`]: an unbounded lock-free multi-producer multi-consumer FIFO.
//! - [`RingBuffer`]: a bounded lock-free single-producer single-consumer FIFO.
//! - [`CachePadded`]: cache-line alignment for hot atomics.
//!
//! These types are deliberately low-level; the scheduling and synchronization layers build their
//! cross-thread conduits on top of them. Nothing here is coroutine-aware.

// Public API surface.
mod cache_padded;
mod error;
mod mpmc_queue;
mod ring_buffer;
mod slab_pool;

pub use cache_padded::*;
pub use error::*;
pub use mpmc_queue::*;
pub use ring_buffer::*;
pub use slab_pool::*;
