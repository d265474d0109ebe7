// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::pin::Pin;
use std::task;

/// When polled, yields to the scheduler so a different task can execute.
///
/// Obtained via [`yield_now`].
#[derive(Debug)]
pub struct YieldFuture {
    first_poll_completed: bool,
}

/// Suspends the current task once, letting other ready tasks run before it continues.
pub fn yield_now() -> YieldFuture {
    YieldFuture {
        first_poll_completed: false,
    }
}

impl Future for YieldFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        if self.first_poll_completed {
            task::Poll::Ready(())
        } else {
            self.first_poll_completed = true;
            cx.waker().wake_by_ref();
            task::Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::task::noop_waker_ref;

    use super::*;

    #[test]
    fn yields_exactly_once() {
        let mut future = Box::pin(yield_now());
        let mut cx = task::Context::from_waker(noop_waker_ref());

        assert_eq!(future.as_mut().poll(&mut cx), task::Poll::Pending);
        assert_eq!(future.as_mut().poll(&mut cx), task::Poll::Ready(()));
    }
}
