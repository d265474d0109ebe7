// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use crate::{Clock, Delay, Timeout};

/// FlowCoro-specific extensions for the [`Future`] trait.
pub trait FutureExt: Future + Sized {
    /// Bounds this future by a deadline `duration` from now.
    ///
    /// The returned future resolves to `Ok(output)` if the inner future finishes in time, or to
    /// [`Error::TimedOut`][crate::Error::TimedOut] if the deadline fires first. The inner future
    /// is dropped when the deadline wins, which cancels it the Rust way: by discarding it.
    fn with_timeout(self, clock: &Clock, duration: Duration) -> Timeout<Self, Delay> {
        Timeout::new(self, Delay::with_clock(clock, duration), duration)
    }
}

impl<F: Future + Sized> FutureExt for F {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MiniRuntime;

    #[test]
    fn timeout_on_ready_future_is_ok() {
        MiniRuntime::execute(async move |clock| {
            let result = async { 42 }
                .with_timeout(&clock, Duration::from_secs(30))
                .await;

            assert_eq!(result.expect("future finished instantly"), 42);
        });
    }
}
