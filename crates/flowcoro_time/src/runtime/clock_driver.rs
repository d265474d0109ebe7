// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::clock::ClockState;

const ERR_POISONED_LOCK: &str = "encountered poisoned lock";

/// The loop-side half of an activated clock: advances registered timers.
///
/// The event loop must call [`advance_timers`][Self::advance_timers] periodically - typically
/// once per scheduling pass - and may sleep until the returned deadline. If it does sleep, it
/// should first install a wake hook via [`set_wake_hook`][Self::set_wake_hook] so that a timer
/// registered with an earlier deadline interrupts the sleep.
pub struct ClockDriver {
    state: Arc<ClockState>,
}

impl ClockDriver {
    pub(crate) fn new(state: Arc<ClockState>) -> Self {
        Self { state }
    }

    /// Wakes every timer due at or before `now`.
    ///
    /// Returns the next pending deadline. If no timers are registered, returns `None`.
    #[cfg_attr(test, mutants::skip)] // Causes test timeout.
    #[must_use]
    pub fn advance_timers(&self, now: Instant) -> Option<Instant> {
        self.state
            .timers
            .lock()
            .expect(ERR_POISONED_LOCK)
            .advance(now)
    }

    /// Installs the hook invoked whenever a newly registered timer becomes the earliest
    /// deadline. May be called at most once; later calls are ignored.
    pub fn set_wake_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        _ = self.state.wake_hook.set(Box::new(hook));
    }

    /// Cancels every pending timer without firing it. Returns how many were cancelled.
    pub fn clear_timers(&self) -> usize {
        self.state.timers.lock().expect(ERR_POISONED_LOCK).clear()
    }
}

impl fmt::Debug for ClockDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClockDriver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::task::noop_waker;

    use super::*;
    use crate::runtime::InactiveClock;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(ClockDriver: Send, Sync);
    }

    #[test]
    fn advance_timers_wakes_due_timers_only() {
        let (clock, driver) = InactiveClock::default().activate();
        let now = Instant::now();

        let _ = clock.register_timer(now + Duration::from_secs(1), noop_waker());
        let _ = clock.register_timer(now + Duration::from_secs(60), noop_waker());

        _ = driver.advance_timers(now);
        assert_eq!(clock.timers_len(), 2);

        _ = driver.advance_timers(now + Duration::from_secs(2));
        assert_eq!(clock.timers_len(), 1);
    }
}
