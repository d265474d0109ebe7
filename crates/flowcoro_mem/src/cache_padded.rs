// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::ops::{Deref, DerefMut};

/// The assumed size of a cache line, in bytes.
///
/// 64 is correct for contemporary x86-64 and most AArch64 parts; over-alignment on other
/// architectures merely wastes a little space.
pub const CACHE_LINE_SIZE: usize = 64;

/// Aligns the wrapped value to a cache-line boundary so that two frequently-mutated atomics
/// placed in adjacent struct fields do not share a line.
///
/// Used for the head/tail indices of the lock-free conduits and for per-worker slots in the
/// work-stealing pool.
#[derive(Debug, Default)]
#[repr(align(64))]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    /// Wraps a value, padding it to [`CACHE_LINE_SIZE`].
    pub const fn new(value: T) -> Self {
        Self { value }
    }

    /// Consumes the wrapper, returning the inner value.
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

#[cfg(test)]
mod tests {
    use std::mem::{align_of, size_of};
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn alignment_is_cache_line() {
        assert_eq!(align_of::<CachePadded<AtomicUsize>>(), CACHE_LINE_SIZE);
        assert!(size_of::<CachePadded<AtomicUsize>>() >= CACHE_LINE_SIZE);
    }

    #[test]
    fn adjacent_fields_do_not_share_a_line() {
        struct TwoCounters {
            a: CachePadded<AtomicUsize>,
            b: CachePadded<AtomicUsize>,
        }

        let counters = TwoCounters {
            a: CachePadded::new(AtomicUsize::new(0)),
            b: CachePadded::new(AtomicUsize::new(0)),
        };

        let a_addr = std::ptr::from_ref(&counters.a) as usize;
        let b_addr = std::ptr::from_ref(&counters.b) as usize;
        assert!(a_addr.abs_diff(b_addr) >= CACHE_LINE_SIZE);
    }

    #[test]
    fn deref_round_trip() {
        let mut padded = CachePadded::new(7_usize);
        assert_eq!(*padded, 7);
        *padded = 9;
        assert_eq!(padded.into_inner(), 9);
    }
}
