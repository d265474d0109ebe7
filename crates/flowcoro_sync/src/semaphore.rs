// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use crate::{ERR_POISONED_LOCK, WaitNode, pop_front_waiter, remove_waiter};

/// An asynchronous counting semaphore.
///
/// The fast path decrements the permit count with a compare-and-swap loop. When no permits are
/// available the acquiring task parks in a FIFO queue; a release hands its permit directly to
/// the front waiter without the count ever going positive, so queued tasks cannot be starved by
/// fast-path newcomers.
#[derive(Debug)]
pub struct Semaphore {
    permits: AtomicI32,
    waiters: StdMutex<VecDeque<Arc<WaitNode>>>,
}

impl Semaphore {
    /// Creates a semaphore with the given number of permits.
    #[must_use]
    pub fn new(permits: i32) -> Self {
        Self {
            permits: AtomicI32::new(permits),
            waiters: StdMutex::new(VecDeque::new()),
        }
    }

    /// Acquires one permit, suspending the calling task until one is available.
    pub fn acquire(&self) -> AcquireFuture<'_> {
        AcquireFuture {
            semaphore: self,
            node: None,
            completed: false,
        }
    }

    /// Attempts to take a permit without suspending.
    pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
        if self.try_take_permit() {
            Some(SemaphorePermit { semaphore: self })
        } else {
            None
        }
    }

    /// Permits currently available to the fast path.
    pub fn available(&self) -> i32 {
        self.permits.load(Ordering::Relaxed).max(0)
    }

    fn try_take_permit(&self) -> bool {
        let mut current = self.permits.load(Ordering::Relaxed);
        while current > 0 {
            match self.permits.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Returns one permit, or hands it directly to the front waiter if any task is parked.
    ///
    /// [`SemaphorePermit`] calls this on drop; call it manually only for permits obtained
    /// outside the RAII flow (e.g. to widen the semaphore at runtime).
    pub fn release(&self) {
        let handoff = {
            let mut waiters = self.waiters.lock().expect(ERR_POISONED_LOCK);
            let next = pop_front_waiter(&mut waiters);
            if next.is_none() {
                self.permits.fetch_add(1, Ordering::Release);
            }
            next
        };

        if let Some(node) = handoff {
            node.grant();
        }
    }
}

/// A permit taken from a [`Semaphore`]. Released on drop.
#[must_use = "the permit is returned as soon as it is dropped"]
#[derive(Debug)]
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Future returned by [`Semaphore::acquire`].
#[derive(Debug)]
pub struct AcquireFuture<'a> {
    semaphore: &'a Semaphore,
    node: Option<Arc<WaitNode>>,
    completed: bool,
}

impl<'a> Future for AcquireFuture<'a> {
    type Output = SemaphorePermit<'a>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        assert!(!self.completed, "AcquireFuture polled after completion");

        let semaphore = self.semaphore;

        if let Some(node) = &self.node {
            if node.is_granted() {
                self.completed = true;
                return Poll::Ready(SemaphorePermit { semaphore });
            }
            node.set_waker(cx.waker());
            if node.is_granted() {
                self.completed = true;
                return Poll::Ready(SemaphorePermit { semaphore });
            }
            return Poll::Pending;
        }

        if semaphore.try_take_permit() {
            self.completed = true;
            return Poll::Ready(SemaphorePermit { semaphore });
        }

        let node = {
            let mut waiters = semaphore.waiters.lock().expect(ERR_POISONED_LOCK);
            // Re-check while holding the queue lock so a release racing with us either sees the
            // incremented count (we take it here) or sees us queued (it grants us).
            if semaphore.try_take_permit() {
                self.completed = true;
                return Poll::Ready(SemaphorePermit { semaphore });
            }
            let node = WaitNode::new(cx.waker().clone());
            waiters.push_back(Arc::clone(&node));
            node
        };

        self.node = Some(node);
        Poll::Pending
    }
}

impl Drop for AcquireFuture<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        let Some(node) = self.node.take() else {
            return;
        };

        let removed = {
            let mut waiters = self.semaphore.waiters.lock().expect(ERR_POISONED_LOCK);
            remove_waiter(&mut waiters, &node)
        };

        if !removed && node.is_granted() {
            // A permit was handed to us after we stopped listening; give it back.
            self.semaphore.release();
        }
    }
}
