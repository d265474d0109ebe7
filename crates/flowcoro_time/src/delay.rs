// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use super::Clock;
use super::timers::TimerKey;

/// Asynchronously delays for the specified duration.
///
/// The runtime exposes this as `sleep_for`. A delay of [`Duration::ZERO`] completes without
/// registering a timer; a delay of [`Duration::MAX`] never completes.
///
/// # Precision
///
/// The delay relies on whoever drives the clock to advance timers. The precision is therefore
/// bounded by the driver's scheduling latency; there are no guarantees beyond "no earlier than
/// the requested deadline".
#[derive(Debug)]
pub struct Delay {
    // Currently scheduled timer. Not initialized before the first poll.
    current_timer: Option<TimerKey>,
    clock: Clock,
    duration: Duration,
}

impl Delay {
    /// Creates a delay that finishes `duration` after its first poll.
    #[must_use]
    pub fn with_clock(clock: &Clock, duration: Duration) -> Self {
        Self {
            duration,
            current_timer: None,
            clock: clock.clone(),
        }
    }

    fn register_timer(&mut self, waker: &Waker) -> Poll<()> {
        let when = self.clock.instant_now().checked_add(self.duration);

        if let Some(when) = when {
            self.current_timer = Some(self.clock.register_timer(when, waker.clone()));
        } else {
            // We have moved past the maximum instant value; this delay never finishes.
            self.duration = Duration::MAX;
            self.current_timer = None;
        }

        Poll::Pending
    }
}

impl Future for Delay {
    type Output = ();

    #[mutants::skip] // some mutations never finish and cause timeouts
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match this.current_timer {
            None if this.duration == Duration::MAX => Poll::Pending,
            None if this.duration == Duration::ZERO => Poll::Ready(()),
            None => this.register_timer(cx.waker()),
            Some(key) if key.deadline() <= this.clock.instant_now() => {
                this.current_timer = None;

                // Unregister explicitly, in case this poll was not caused by the timer firing.
                this.clock.unregister_timer(key);

                Poll::Ready(())
            }
            Some(_) => Poll::Pending,
        }
    }
}

impl Drop for Delay {
    fn drop(&mut self) {
        if let Some(key) = self.current_timer.take() {
            self.clock.unregister_timer(key);
        }
    }
}
