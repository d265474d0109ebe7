// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::{Duration, Instant};

use crate::Clock;

/// Measures elapsed time from its creation, using the monotonic clock.
#[derive(Debug, Clone)]
pub struct Stopwatch {
    clock: Clock,
    started: Instant,
}

impl Stopwatch {
    /// Starts a stopwatch now.
    #[must_use]
    pub fn with_clock(clock: &Clock) -> Self {
        Self {
            clock: clock.clone(),
            started: clock.instant_now(),
        }
    }

    /// Time elapsed since the stopwatch was started.
    pub fn elapsed(&self) -> Duration {
        self.clock.instant_now().saturating_duration_since(self.started)
    }

    /// Restarts the stopwatch, returning the time elapsed before the restart.
    pub fn restart(&mut self) -> Duration {
        let elapsed = self.elapsed();
        self.started = self.clock.instant_now();
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::runtime::InactiveClock;

    #[test]
    fn elapsed_is_monotonic() {
        let (clock, _driver) = InactiveClock::default().activate();
        let watch = Stopwatch::with_clock(&clock);

        let first = watch.elapsed();
        thread::sleep(Duration::from_millis(1));
        let second = watch.elapsed();

        assert!(second >= first);
    }

    #[test]
    fn restart_resets_the_baseline() {
        let (clock, _driver) = InactiveClock::default().activate();
        let mut watch = Stopwatch::with_clock(&clock);

        thread::sleep(Duration::from_millis(1));
        let before_restart = watch.restart();

        assert!(before_restart >= Duration::from_millis(1));
        assert!(watch.elapsed() < before_restart);
    }
}
