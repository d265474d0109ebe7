// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use crate::{ERR_POISONED_LOCK, WaitNode, pop_front_waiter, remove_waiter};

/// An asynchronous mutex owning the data it protects.
///
/// The fast path is a single compare-and-swap. Contended acquires park the task in a FIFO
/// queue; `unlock` hands the lock directly to the front waiter without ever dropping the
/// `locked` flag, so ownership transfers without a window in which a newcomer could barge in
/// ahead of the queue.
///
/// Lock futures are cancel-safe: dropping one that was already granted the lock passes the
/// lock on instead of losing it.
pub struct Mutex<T: ?Sized> {
    locked: AtomicBool,
    waiters: StdMutex<VecDeque<Arc<WaitNode>>>,
    data: UnsafeCell<T>,
}

// SAFETY: the lock protocol guarantees at most one holder, so sending the protected data
// between threads only requires T: Send.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
// SAFETY: access to the data always goes through the exclusive guard.
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates an unlocked mutex holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            waiters: StdMutex::new(VecDeque::new()),
            data: UnsafeCell::new(value),
        }
    }

    /// Consumes the mutex, returning the protected data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the lock, suspending the calling task while it is held elsewhere.
    pub fn lock(&self) -> LockFuture<'_, T> {
        LockFuture {
            mutex: self,
            node: None,
            completed: false,
        }
    }

    /// Attempts to acquire the lock without suspending.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.try_acquire_flag() {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// Mutable access without locking; the exclusive borrow is proof of exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn try_acquire_flag(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        let handoff = {
            let mut waiters = self.waiters.lock().expect(ERR_POISONED_LOCK);
            let next = pop_front_waiter(&mut waiters);
            if next.is_none() {
                self.locked.store(false, Ordering::Release);
            }
            next
        };

        // Waking outside the queue lock: the woken task may immediately re-enter this mutex.
        if let Some(node) = handoff {
            node.grant();
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => s.field("data", &&*guard),
            None => s.field("data", &"<locked>"),
        };
        s.finish()
    }
}

/// Exclusive access to the data of a [`Mutex`]. Unlocks on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard means holding the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard means holding the lock exclusively.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Future returned by [`Mutex::lock`].
#[derive(Debug)]
pub struct LockFuture<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    node: Option<Arc<WaitNode>>,
    completed: bool,
}

impl<'a, T: ?Sized> Future for LockFuture<'a, T> {
    type Output = MutexGuard<'a, T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        assert!(!self.completed, "LockFuture polled after completion");

        let mutex = self.mutex;

        if let Some(node) = &self.node {
            if node.is_granted() {
                self.completed = true;
                return Poll::Ready(MutexGuard { mutex });
            }
            node.set_waker(cx.waker());
            // The grant may have landed between the check and the waker store.
            if node.is_granted() {
                self.completed = true;
                return Poll::Ready(MutexGuard { mutex });
            }
            return Poll::Pending;
        }

        if mutex.try_acquire_flag() {
            self.completed = true;
            return Poll::Ready(MutexGuard { mutex });
        }

        let node = {
            let mut waiters = mutex.waiters.lock().expect(ERR_POISONED_LOCK);
            // Re-check under the queue lock: an unlock that ran after the fast path failed
            // found no waiter and cleared the flag; without this we would park forever.
            if mutex.try_acquire_flag() {
                self.completed = true;
                return Poll::Ready(MutexGuard { mutex });
            }
            let node = WaitNode::new(cx.waker().clone());
            waiters.push_back(Arc::clone(&node));
            node
        };

        self.node = Some(node);
        Poll::Pending
    }
}

impl<T: ?Sized> Drop for LockFuture<'_, T> {
    fn drop(&mut self) {
        if self.completed {
            return; // The guard owns the lock now.
        }

        let Some(node) = self.node.take() else {
            return;
        };

        let removed = {
            let mut waiters = self.mutex.waiters.lock().expect(ERR_POISONED_LOCK);
            remove_waiter(&mut waiters, &node)
        };

        if !removed && node.is_granted() {
            // The lock was handed to us after we stopped listening; pass it on.
            self.mutex.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::executor::block_on;
    use futures::task::noop_waker;

    use super::*;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(Mutex<usize>: Send, Sync);
        static_assertions::assert_impl_all!(MutexGuard<'_, usize>: Send);
    }

    #[test]
    fn uncontended_lock_round_trip() {
        let mutex = Mutex::new(5);

        {
            let mut guard = block_on(mutex.lock());
            *guard += 1;
        }

        assert_eq!(*block_on(mutex.lock()), 6);
        assert_eq!(mutex.into_inner(), 6);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let mutex = Mutex::new(());

        let guard = mutex.try_lock().expect("mutex is free");
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn contended_lock_parks_and_handoff_wakes_fifo() {
        let mutex = Arc::new(Mutex::new(Vec::new()));

        let guard = mutex.try_lock().expect("mutex is free");

        // Park two waiters in order.
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut first = Box::pin(mutex.lock());
        let mut second = Box::pin(mutex.lock());
        assert!(first.as_mut().poll(&mut cx).is_pending());
        assert!(second.as_mut().poll(&mut cx).is_pending());

        // Unlock hands off to the first waiter only.
        drop(guard);
        match first.as_mut().poll(&mut cx) {
            Poll::Ready(mut g) => g.push(1),
            Poll::Pending => panic!("first waiter must receive the handoff"),
        }
        assert!(second.as_mut().poll(&mut cx).is_pending());

        match second.as_mut().poll(&mut cx) {
            Poll::Ready(mut g) => g.push(2),
            Poll::Pending => panic!("second waiter must be granted after the first released"),
        }

        assert_eq!(*mutex.try_lock().expect("free again"), vec![1, 2]);
    }

    #[test]
    fn dropping_granted_future_passes_the_lock_on() {
        let mutex = Arc::new(Mutex::new(()));
        let guard = mutex.try_lock().expect("mutex is free");

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut abandoned = Box::pin(mutex.lock());
        let mut patient = Box::pin(mutex.lock());
        assert!(abandoned.as_mut().poll(&mut cx).is_pending());
        assert!(patient.as_mut().poll(&mut cx).is_pending());

        drop(guard); // handoff goes to `abandoned`
        drop(abandoned); // which must re-donate to `patient`

        assert!(patient.as_mut().poll(&mut cx).is_ready());
    }

    #[test]
    fn dropping_queued_future_deregisters() {
        let mutex = Mutex::new(());
        let guard = mutex.try_lock().expect("mutex is free");

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut queued = Box::pin(mutex.lock());
        assert!(queued.as_mut().poll(&mut cx).is_pending());
        drop(queued);

        drop(guard);
        assert!(mutex.try_lock().is_some(), "no stale waiter may hold the lock");
    }

    #[test]
    fn parallel_increments_stay_exclusive() {
        let mutex = Arc::new(Mutex::new(0_u64));
        let observed_overlap = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                let overlap = Arc::clone(&observed_overlap);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut guard = block_on(mutex.lock());
                        let before = *guard;
                        *guard = before + 1;
                        if *guard != before + 1 {
                            overlap.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().expect("incrementing thread panicked");
        }

        assert_eq!(*block_on(mutex.lock()), 4000);
        assert_eq!(observed_overlap.load(Ordering::Relaxed), 0);
    }
}
