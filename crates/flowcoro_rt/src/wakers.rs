// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::ERR_POISONED_LOCK;

/// A waker that can be used to wake up a thread.
///
/// The driver parks on this between scheduling passes; `notify` is the cross-thread signal that
/// new work arrived (a handle was scheduled, or a timer with an earlier deadline was
/// registered).
///
/// This struct is cloneable and thread-safe. Notifications are sticky: a `notify` delivered
/// while no thread is waiting is consumed by the next `wait`.
#[derive(Debug, Clone)]
pub(crate) struct ThreadWaker {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ThreadWaker {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Notifies the waiting thread and wakes it up.
    #[mutants::skip] // Hangs the driver when tampered with; only shows up as test timeouts.
    pub(crate) fn notify(&self) {
        *self.inner.0.lock().expect(ERR_POISONED_LOCK) = true;
        self.inner.1.notify_one();
    }

    /// Waits until notified or until `timeout` elapses, whichever comes first.
    #[mutants::skip] // Hangs the driver when tampered with; only shows up as test timeouts.
    pub(crate) fn wait(&self, timeout: Duration) {
        let mut notified = self.inner.0.lock().expect(ERR_POISONED_LOCK);
        while !*notified {
            let (guard, waited) = self
                .inner
                .1
                .wait_timeout(notified, timeout)
                .expect(ERR_POISONED_LOCK);
            notified = guard;
            if waited.timed_out() {
                return;
            }
        }
        *notified = false;
    }
}
