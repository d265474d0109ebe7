// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::task::Waker;

use crate::ERR_POISONED_LOCK;

/// One parked task inside a primitive's FIFO waiter queue.
///
/// The queue stores `Arc<WaitNode>`s; the parked future keeps its own clone so it can observe
/// the grant, refresh its waker on re-polls, and deregister when dropped.
#[derive(Debug)]
pub(crate) struct WaitNode {
    granted: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl WaitNode {
    pub(crate) fn new(waker: Waker) -> Arc<Self> {
        Arc::new(Self {
            granted: AtomicBool::new(false),
            waker: Mutex::new(Some(waker)),
        })
    }

    /// Whether the resource (lock, permit, notification) was handed to this waiter.
    pub(crate) fn is_granted(&self) -> bool {
        self.granted.load(Ordering::Acquire)
    }

    /// Stores the waker from the most recent poll.
    pub(crate) fn set_waker(&self, waker: &Waker) {
        *self.waker.lock().expect(ERR_POISONED_LOCK) = Some(waker.clone());
    }

    /// Marks the node granted and wakes the parked task.
    pub(crate) fn grant(&self) {
        self.granted.store(true, Ordering::Release);
        let waker = self.waker.lock().expect(ERR_POISONED_LOCK).take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Pops the front waiter, if any. The caller grants it outside the queue lock.
pub(crate) fn pop_front_waiter(
    queue: &mut VecDeque<Arc<WaitNode>>,
) -> Option<Arc<WaitNode>> {
    queue.pop_front()
}

/// Removes a specific node, returning whether it was still queued.
///
/// A `false` return means the node was already popped by a granter; the caller owns whatever
/// was granted and must consume or re-donate it.
pub(crate) fn remove_waiter(queue: &mut VecDeque<Arc<WaitNode>>, node: &Arc<WaitNode>) -> bool {
    let before = queue.len();
    queue.retain(|queued| !Arc::ptr_eq(queued, node));
    queue.len() != before
}
