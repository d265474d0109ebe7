// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A thread-safe asynchronous event that is triggered at most once to deliver a value of type T
//! to at most one listener.
//!
//! This is the delivery half of every join handle: the task side holds the [`EventSender`] and
//! sets the outcome exactly once; the handle side holds the [`EventReceiver`] and either awaits
//! it (async) or blocks on it (from non-runtime threads).
//!
//! # Disconnected senders
//!
//! If the sender is dropped without setting a value, the receiver resolves to
//! [`Disconnected`] instead of hanging forever. The runtime maps this to its shutdown error.

use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{self, Waker};
use std::time::Instant;

use thiserror::Error;

use crate::ERR_POISONED_LOCK;

/// The sender vanished without ever producing a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("the event sender was dropped without delivering a value")]
pub struct Disconnected;

/// Creates a connected sender/receiver pair.
///
/// Event notifications are triggered instantly via waker if a listener is already awaiting, and
/// the result is delivered instantly if the listener starts after the result is set.
pub fn event<T>() -> (EventSender<T>, EventReceiver<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(EventState::NotSet),
        ready: Condvar::new(),
    });

    (
        EventSender {
            shared: Some(Arc::clone(&shared)),
        },
        EventReceiver { shared },
    )
}

#[derive(Debug)]
struct Shared<T> {
    state: Mutex<EventState<T>>,
    ready: Condvar,
}

#[derive(Debug)]
enum EventState<T> {
    /// The event has not been set and nobody is listening.
    NotSet,

    /// The event has not been set and someone is listening.
    Awaiting(Waker),

    /// The event has been set but the value has not been taken yet.
    Set(Delivery<T>),

    /// The value has been taken.
    Consumed,
}

#[derive(Debug)]
enum Delivery<T> {
    Value(T),
    Disconnected,
}

impl<T> Shared<T> {
    #[cfg_attr(test, mutants::skip)] // Critical primitive - causes test timeouts if tampered.
    fn deliver(&self, delivery: Delivery<T>) {
        let mut waker = None;

        {
            let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

            match &*state {
                EventState::NotSet => *state = EventState::Set(delivery),
                EventState::Awaiting(_) => {
                    let previous = mem::replace(&mut *state, EventState::Set(delivery));
                    match previous {
                        EventState::Awaiting(w) => waker = Some(w),
                        _ => unreachable!("we are re-matching an already matched pattern"),
                    }
                }
                EventState::Set(_) | EventState::Consumed => panic!("event delivered twice"),
            }
        }

        // The wakeup happens outside the lock so an instantly-running listener does not contend
        // with us for it.
        if let Some(waker) = waker {
            waker.wake();
        }
        self.ready.notify_all();
    }

    #[cfg_attr(test, mutants::skip)] // Critical for code execution to occur in async contexts.
    fn poll(&self, waker: &Waker) -> Option<Result<T, Disconnected>> {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        match &*state {
            EventState::NotSet | EventState::Awaiting(_) => {
                // The Future contract wants only the waker of the most recent poll woken.
                *state = EventState::Awaiting(waker.clone());
                None
            }
            EventState::Set(_) => {
                let previous = mem::replace(&mut *state, EventState::Consumed);
                match previous {
                    EventState::Set(Delivery::Value(value)) => Some(Ok(value)),
                    EventState::Set(Delivery::Disconnected) => Some(Err(Disconnected)),
                    _ => unreachable!("we are re-matching an already matched pattern"),
                }
            }
            EventState::Consumed => {
                // We do not keep a copy of the value around, so it can only be returned once.
                panic!("event polled after the value was already consumed");
            }
        }
    }
}

/// Delivers the value. Obtained from [`event`].
#[derive(Debug)]
pub struct EventSender<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> EventSender<T> {
    /// Sets the event value, waking the listener if one is parked.
    ///
    /// # Panics
    ///
    /// Panics if the event was already set, which would indicate two deliveries for one result
    /// slot.
    #[cfg_attr(test, mutants::skip)] // Critical primitive - causes test timeouts if tampered.
    pub fn set(mut self, value: T) {
        let shared = self
            .shared
            .take()
            .expect("the shared state is present until set or drop");
        shared.deliver(Delivery::Value(value));
    }
}

impl<T> Drop for EventSender<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.deliver(Delivery::Disconnected);
        }
    }
}

/// Receives the value. Obtained from [`event`].
///
/// Implements [`Future`]; additionally offers [`wait`][Self::wait] for blocking consumption
/// from threads that are not running async code.
#[derive(Debug)]
pub struct EventReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> EventReceiver<T> {
    /// Blocks the calling thread until the value is delivered.
    pub fn wait(self) -> Result<T, Disconnected> {
        let mut state = self.shared.state.lock().expect(ERR_POISONED_LOCK);

        loop {
            match &*state {
                EventState::Set(_) => {
                    let previous = mem::replace(&mut *state, EventState::Consumed);
                    return match previous {
                        EventState::Set(Delivery::Value(value)) => Ok(value),
                        EventState::Set(Delivery::Disconnected) => Err(Disconnected),
                        _ => unreachable!("we are re-matching an already matched pattern"),
                    };
                }
                EventState::Consumed => panic!("event waited on after the value was consumed"),
                EventState::NotSet | EventState::Awaiting(_) => {
                    state = self.shared.ready.wait(state).expect(ERR_POISONED_LOCK);
                }
            }
        }
    }

    /// Blocks until the value is delivered or `deadline` passes.
    ///
    /// Returns `None` on deadline expiry; the receiver stays usable.
    pub fn wait_deadline(&mut self, deadline: Instant) -> Option<Result<T, Disconnected>> {
        let mut state = self.shared.state.lock().expect(ERR_POISONED_LOCK);

        loop {
            match &*state {
                EventState::Set(_) => {
                    let previous = mem::replace(&mut *state, EventState::Consumed);
                    return match previous {
                        EventState::Set(Delivery::Value(value)) => Some(Ok(value)),
                        EventState::Set(Delivery::Disconnected) => Some(Err(Disconnected)),
                        _ => unreachable!("we are re-matching an already matched pattern"),
                    };
                }
                EventState::Consumed => panic!("event waited on after the value was consumed"),
                EventState::NotSet | EventState::Awaiting(_) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    if timeout.is_zero() {
                        return None;
                    }
                    let (guard, _) = self
                        .shared
                        .ready
                        .wait_timeout(state, timeout)
                        .expect(ERR_POISONED_LOCK);
                    state = guard;
                }
            }
        }
    }

    /// Takes the value if it has already been delivered, without blocking.
    pub fn try_take(&mut self) -> Option<Result<T, Disconnected>> {
        let mut state = self.shared.state.lock().expect(ERR_POISONED_LOCK);

        match &*state {
            EventState::Set(_) => {
                let previous = mem::replace(&mut *state, EventState::Consumed);
                match previous {
                    EventState::Set(Delivery::Value(value)) => Some(Ok(value)),
                    EventState::Set(Delivery::Disconnected) => Some(Err(Disconnected)),
                    _ => unreachable!("we are re-matching an already matched pattern"),
                }
            }
            _ => None,
        }
    }
}

impl<T> Future for EventReceiver<T> {
    type Output = Result<T, Disconnected>;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        self.shared
            .poll(cx.waker())
            .map_or(task::Poll::Pending, task::Poll::Ready)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use futures::FutureExt;
    use futures::task::noop_waker_ref;

    use super::*;

    #[test]
    fn take_after_set() {
        let (sender, mut receiver) = event();

        sender.set(42);

        let cx = &mut task::Context::from_waker(noop_waker_ref());
        assert_eq!(receiver.poll_unpin(cx), task::Poll::Ready(Ok(42)));
    }

    #[test]
    fn poll_before_set_then_wake() {
        let (sender, mut receiver) = event();

        let cx = &mut task::Context::from_waker(noop_waker_ref());
        assert_eq!(receiver.poll_unpin(cx), task::Poll::Pending);

        sender.set(42);

        assert_eq!(receiver.poll_unpin(cx), task::Poll::Ready(Ok(42)));
    }

    #[test]
    fn cross_thread_delivery() {
        let (sender, receiver) = event();

        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            sender.set(String::from("done"));
        });

        assert_eq!(receiver.wait(), Ok(String::from("done")));
        setter.join().expect("setter thread panicked");
    }

    #[test]
    fn dropped_sender_disconnects() {
        let (sender, mut receiver) = event::<()>();
        drop(sender);

        let cx = &mut task::Context::from_waker(noop_waker_ref());
        assert_eq!(receiver.poll_unpin(cx), task::Poll::Ready(Err(Disconnected)));
    }

    #[test]
    fn wait_deadline_expires() {
        let (sender, mut receiver) = event::<()>();

        let before = Instant::now();
        let result = receiver.wait_deadline(Instant::now() + Duration::from_millis(10));
        assert!(result.is_none());
        assert!(before.elapsed() >= Duration::from_millis(10));

        // Still usable afterwards.
        sender.set(());
        assert_eq!(receiver.try_take(), Some(Ok(())));
    }

    #[test]
    fn try_take_is_non_blocking() {
        let (sender, mut receiver) = event();

        assert_eq!(receiver.try_take(), None);
        sender.set(1);
        assert_eq!(receiver.try_take(), Some(Ok(1)));
    }

    #[test]
    fn set_after_dropped_receiver_is_fine() {
        let (sender, receiver) = event();
        drop(receiver);
        sender.set(42);
    }
}
