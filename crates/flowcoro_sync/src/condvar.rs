// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use crate::{ERR_POISONED_LOCK, WaitNode, pop_front_waiter, remove_waiter};

/// An asynchronous condition variable.
///
/// [`wait`][Self::wait] always suspends; [`notify_one`][Self::notify_one] wakes the
/// longest-waiting task and [`notify_all`][Self::notify_all] drains the queue. Notifications
/// are not buffered: a notify with no parked waiters is lost.
///
/// Spurious wakeups are not emitted, but callers should still re-check their predicate after
/// waking - the state that prompted the notify may have changed again by the time the woken
/// task runs.
#[derive(Debug, Default)]
pub struct Condvar {
    waiters: StdMutex<VecDeque<Arc<WaitNode>>>,
}

impl Condvar {
    /// Creates a condition variable with no parked waiters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks the calling task until notified.
    pub fn wait(&self) -> WaitFuture<'_> {
        WaitFuture {
            condvar: self,
            node: None,
            completed: false,
        }
    }

    /// Wakes the front waiter, if any.
    pub fn notify_one(&self) {
        let notified = {
            let mut waiters = self.waiters.lock().expect(ERR_POISONED_LOCK);
            pop_front_waiter(&mut waiters)
        };

        if let Some(node) = notified {
            node.grant();
        }
    }

    /// Wakes every parked waiter.
    pub fn notify_all(&self) {
        let drained: Vec<_> = {
            let mut waiters = self.waiters.lock().expect(ERR_POISONED_LOCK);
            waiters.drain(..).collect()
        };

        for node in drained {
            node.grant();
        }
    }

    /// The number of currently parked waiters.
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().expect(ERR_POISONED_LOCK).len()
    }
}

/// Future returned by [`Condvar::wait`].
#[derive(Debug)]
pub struct WaitFuture<'a> {
    condvar: &'a Condvar,
    node: Option<Arc<WaitNode>>,
    completed: bool,
}

impl Future for WaitFuture<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        assert!(!self.completed, "WaitFuture polled after completion");

        if let Some(node) = &self.node {
            if node.is_granted() {
                self.completed = true;
                return Poll::Ready(());
            }
            node.set_waker(cx.waker());
            if node.is_granted() {
                self.completed = true;
                return Poll::Ready(());
            }
            return Poll::Pending;
        }

        let node = WaitNode::new(cx.waker().clone());
        self.condvar
            .waiters
            .lock()
            .expect(ERR_POISONED_LOCK)
            .push_back(Arc::clone(&node));
        self.node = Some(node);

        Poll::Pending
    }
}

impl Drop for WaitFuture<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        let Some(node) = self.node.take() else {
            return;
        };

        let removed = {
            let mut waiters = self.condvar.waiters.lock().expect(ERR_POISONED_LOCK);
            remove_waiter(&mut waiters, &node)
        };

        if !removed && node.is_granted() {
            // We consumed a notification nobody will act on; pass it to the next waiter.
            self.condvar.notify_one();
        }
    }
}
