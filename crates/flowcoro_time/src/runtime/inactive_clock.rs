// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::clock::Clock;
use crate::runtime::ClockDriver;

/// A clock that has not yet been connected to an event loop.
///
/// Activation splits the clock into its two roles: the [`Clock`] handle that tasks use to
/// register timers, and the [`ClockDriver`] that the event loop uses to advance them. The split
/// makes it impossible for task code to end up driving timers.
#[derive(Debug, Default)]
pub struct InactiveClock {
    _private: (),
}

impl InactiveClock {
    /// Activates the clock, producing the task-side handle and the loop-side driver.
    #[must_use]
    pub fn activate(self) -> (Clock, ClockDriver) {
        let state = Clock::new_state();
        let clock = Clock::from_state(std::sync::Arc::clone(&state));
        let driver = ClockDriver::new(state);

        (clock, driver)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use futures::task::noop_waker;

    use super::*;

    #[test]
    fn activation_links_handle_and_driver() {
        let (clock, driver) = InactiveClock::default().activate();

        let when = Instant::now() + Duration::from_millis(1);
        let _ = clock.register_timer(when, noop_waker());

        let next = driver.advance_timers(Instant::now());
        assert_eq!(next, Some(when));

        let next = driver.advance_timers(when + Duration::from_millis(1));
        assert_eq!(next, None);
        assert_eq!(clock.timers_len(), 0);
    }
}
