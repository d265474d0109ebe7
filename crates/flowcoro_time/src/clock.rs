// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::Waker;
use std::time::Instant;

use crate::{TimerKey, Timers};

const ERR_POISONED_LOCK: &str = "encountered poisoned lock";

/// A cloneable handle to the runtime's monotonic clock and its timer registry.
///
/// The clock is created in an inactive state by the runtime (see
/// [`InactiveClock`][crate::runtime::InactiveClock]) and activated into a `(Clock, ClockDriver)`
/// pair. Task-side code holds `Clock` and registers timers; the event loop holds the driver and
/// advances them. Cloning is cheap and all clones share the same registry.
///
/// Time is read from [`Instant::now`], so it is monotonic and unaffected by wall-clock changes.
/// Millisecond-scale resolution is all the timer consumers require.
#[derive(Clone)]
pub struct Clock {
    state: Arc<ClockState>,
}

pub(crate) struct ClockState {
    pub(crate) timers: Mutex<Timers>,

    /// Invoked when a newly registered timer becomes the earliest deadline, so a sleeping event
    /// loop can re-evaluate how long it may sleep. Installed once by the driver side.
    pub(crate) wake_hook: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl Clock {
    pub(crate) fn from_state(state: Arc<ClockState>) -> Self {
        Self { state }
    }

    pub(crate) fn new_state() -> Arc<ClockState> {
        Arc::new(ClockState {
            timers: Mutex::new(Timers::default()),
            wake_hook: OnceLock::new(),
        })
    }

    /// The current instant on the monotonic clock.
    pub fn instant_now(&self) -> Instant {
        Instant::now()
    }

    /// Registers `waker` to be woken at `when`.
    ///
    /// If `when` is earlier than every previously registered deadline, the driver's wake hook is
    /// invoked so a sleeping event loop shortens its sleep.
    pub fn register_timer(&self, when: Instant, waker: Waker) -> TimerKey {
        let (key, became_earliest) = {
            let mut timers = self.state.timers.lock().expect(ERR_POISONED_LOCK);
            let previous_earliest = timers.next_deadline();
            let key = timers.register(when, waker);
            let became_earliest = previous_earliest.is_none_or(|earliest| when < earliest);
            (key, became_earliest)
        };

        // The hook is called outside the timer lock: it typically signals a condition variable
        // and the woken thread immediately takes this same lock.
        if became_earliest
            && let Some(hook) = self.state.wake_hook.get()
        {
            hook();
        }

        key
    }

    /// Removes a previously registered timer. No-op if it already fired.
    pub fn unregister_timer(&self, key: TimerKey) {
        self.state
            .timers
            .lock()
            .expect(ERR_POISONED_LOCK)
            .unregister(key);
    }

    /// The earliest pending deadline, if any timers are registered.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state
            .timers
            .lock()
            .expect(ERR_POISONED_LOCK)
            .next_deadline()
    }

    /// The number of pending timers.
    pub fn timers_len(&self) -> usize {
        self.state.timers.lock().expect(ERR_POISONED_LOCK).len()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("timers", &self.timers_len())
            .finish()
    }
}
