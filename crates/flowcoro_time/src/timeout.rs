// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;

use crate::Error;

/// A future that races between a future and a deadline.
///
/// - If the future completes before the deadline, the future's output is returned.
/// - If the deadline completes before the future, [`Error::TimedOut`] is returned.
///
/// Constructed via [`FutureExt::with_timeout`][crate::FutureExt::with_timeout].
#[pin_project]
#[derive(Debug)]
pub struct Timeout<F, D> {
    #[pin]
    future: F,
    #[pin]
    deadline: D,
    waited: Duration,
}

impl<F, D> Timeout<F, D> {
    pub(super) const fn new(future: F, deadline: D, waited: Duration) -> Self {
        Self {
            future,
            deadline,
            waited,
        }
    }
}

impl<F: Future, D: Future> Future for Timeout<F, D> {
    type Output = Result<F::Output, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match this.future.poll(cx) {
            Poll::Ready(v) => Poll::Ready(Ok(v)),
            Poll::Pending => match this.deadline.poll(cx) {
                Poll::Ready(_) => Poll::Ready(Err(Error::TimedOut {
                    waited: *this.waited,
                })),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MiniRuntime;
    use crate::{Delay, FutureExt};

    #[test]
    fn future_wins_the_race() {
        MiniRuntime::execute(async move |clock| {
            let result = Delay::with_clock(&clock, Duration::from_millis(1))
                .with_timeout(&clock, Duration::from_secs(30))
                .await;

            assert!(result.is_ok());
        });
    }

    #[test]
    fn deadline_wins_the_race() {
        MiniRuntime::execute(async move |clock| {
            let result = Delay::with_clock(&clock, Duration::from_secs(30))
                .with_timeout(&clock, Duration::from_millis(1))
                .await;

            assert!(matches!(result, Err(Error::TimedOut { waited }) if waited == Duration::from_millis(1)));
        });
    }
}
