// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use thiserror::Error;

use crate::{ERR_POISONED_LOCK, WaitNode, pop_front_waiter, remove_waiter};

/// The channel was closed before (or while) the value could be sent.
///
/// The unsent value is handed back.
#[derive(Debug, Error)]
#[error("sending on a closed channel")]
pub struct SendError<T>(pub T);

/// Error returned by [`Channel::try_send`].
#[derive(Debug, Error)]
pub enum TrySendError<T> {
    /// The channel is at capacity (or, for a rendezvous channel, no receiver is waiting).
    #[error("channel is full")]
    Full(T),
    /// The channel was closed.
    #[error("channel is closed")]
    Closed(T),
}

/// Error returned by [`Channel::try_recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryRecvError {
    /// No value is buffered right now.
    #[error("channel is empty")]
    Empty,
    /// The channel was closed and fully drained.
    #[error("channel is closed")]
    Closed,
}

struct ChanState<T> {
    buffer: VecDeque<T>,
    /// `None` = unbounded; `Some(0)` = rendezvous; `Some(c)` = bounded to `c` items.
    capacity: Option<usize>,
    closed: bool,
    send_waiters: VecDeque<Arc<WaitNode>>,
    recv_waiters: VecDeque<Arc<WaitNode>>,
}

impl<T> ChanState<T> {
    fn may_send(&self) -> bool {
        match self.capacity {
            None => true,
            Some(0) => !self.recv_waiters.is_empty(),
            Some(capacity) => self.buffer.len() < capacity,
        }
    }
}

/// A coroutine-aware FIFO channel.
///
/// Cloning the handle aliases the same underlying channel, so any number of tasks may send and
/// receive concurrently. A single mutex guards the buffer, the closed flag and both waiter
/// queues; waiters are woken in FIFO order.
///
/// Capacity variants:
///
/// - [`bounded(c)`][Self::bounded]: at most `c` items buffered; senders beyond that suspend
///   until a receiver drains the buffer.
/// - [`rendezvous()`][Self::rendezvous]: no buffer; a send completes only when a receiver is
///   already waiting.
/// - [`unbounded()`][Self::unbounded]: sends never suspend.
///
/// After [`close`][Self::close], sends fail, but receivers drain everything that was buffered
/// before observing the closure.
pub struct Channel<T> {
    state: Arc<StdMutex<ChanState<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Channel<T> {
    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            state: Arc::new(StdMutex::new(ChanState {
                buffer: VecDeque::new(),
                capacity,
                closed: false,
                send_waiters: VecDeque::new(),
                recv_waiters: VecDeque::new(),
            })),
        }
    }

    /// A channel buffering at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is zero; use [`rendezvous`][Self::rendezvous] for that.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        assert!(capacity > 0, "use Channel::rendezvous() for capacity 0");
        Self::with_capacity(Some(capacity))
    }

    /// A channel with no buffer: each send completes only when a receiver is waiting for it.
    #[must_use]
    pub fn rendezvous() -> Self {
        Self::with_capacity(Some(0))
    }

    /// A channel whose sends always complete immediately.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    /// Sends a value, suspending while the channel is full.
    ///
    /// Resolves to `Err(SendError(value))` if the channel is closed before the value could be
    /// buffered.
    pub fn send(&self, value: T) -> SendFuture<T> {
        SendFuture {
            state: Arc::clone(&self.state),
            value: Some(value),
            node: None,
        }
    }

    /// Receives a value, suspending while the channel is empty.
    ///
    /// Resolves to `None` once the channel is closed and fully drained.
    pub fn recv(&self) -> RecvFuture<T> {
        RecvFuture {
            state: Arc::clone(&self.state),
            node: None,
        }
    }

    /// Attempts to send without suspending.
    ///
    /// # Errors
    ///
    /// [`TrySendError::Full`] when the buffer is at capacity, [`TrySendError::Closed`] when the
    /// channel was closed. Both return the value.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let to_wake = {
            let mut state = self.state.lock().expect(ERR_POISONED_LOCK);
            if state.closed {
                return Err(TrySendError::Closed(value));
            }
            if !state.may_send() {
                return Err(TrySendError::Full(value));
            }
            state.buffer.push_back(value);
            pop_front_waiter(&mut state.recv_waiters)
        };

        if let Some(node) = to_wake {
            node.grant();
        }
        Ok(())
    }

    /// Attempts to receive without suspending.
    ///
    /// # Errors
    ///
    /// [`TryRecvError::Empty`] when nothing is buffered, [`TryRecvError::Closed`] once the
    /// channel is closed and drained.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let (value, to_wake) = {
            let mut state = self.state.lock().expect(ERR_POISONED_LOCK);
            match state.buffer.pop_front() {
                Some(value) => {
                    let waiter = pop_front_waiter(&mut state.send_waiters);
                    (value, waiter)
                }
                None if state.closed => return Err(TryRecvError::Closed),
                None => return Err(TryRecvError::Empty),
            }
        };

        if let Some(node) = to_wake {
            node.grant();
        }
        Ok(value)
    }

    /// Closes the channel.
    ///
    /// All parked senders and receivers are woken: senders fail, receivers drain the remaining
    /// buffer and then observe `None`. Closing an already-closed channel is a no-op.
    pub fn close(&self) {
        let woken: Vec<_> = {
            let mut state = self.state.lock().expect(ERR_POISONED_LOCK);
            state.closed = true;
            let mut woken: Vec<_> = state.send_waiters.drain(..).collect();
            woken.extend(state.recv_waiters.drain(..));
            woken
        };

        for node in woken {
            node.grant();
        }
    }

    /// Whether [`close`][Self::close] has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().expect(ERR_POISONED_LOCK).closed
    }

    /// The number of items currently buffered.
    pub fn len(&self) -> usize {
        self.state.lock().expect(ERR_POISONED_LOCK).buffer.len()
    }

    /// Whether no items are currently buffered.
    pub fn is_empty(&self) -> bool {
        self.state.lock().expect(ERR_POISONED_LOCK).buffer.is_empty()
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().expect(ERR_POISONED_LOCK);
        f.debug_struct("Channel")
            .field("len", &state.buffer.len())
            .field("capacity", &state.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}

/// Future returned by [`Channel::send`].
#[must_use = "futures do nothing unless awaited"]
pub struct SendFuture<T> {
    state: Arc<StdMutex<ChanState<T>>>,
    value: Option<T>,
    node: Option<Arc<WaitNode>>,
}

// The pending value is owned by this future and never pinned itself, so moving the future
// around between polls is fine even for !Unpin payloads.
impl<T> Unpin for SendFuture<T> {}

impl<T> Future for SendFuture<T> {
    type Output = Result<(), SendError<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        let (result, to_wake) = {
            let mut state = this.state.lock().expect(ERR_POISONED_LOCK);

            if state.closed {
                let value = this.value.take().expect("value present until completion");
                this.node = None;
                (Some(Err(SendError(value))), None)
            } else {
                // A granted node is a consumed wakeup hint: retry the send right now, under
                // the same lock, or we could park forever on a hint nobody will repeat.
                if let Some(node) = &this.node {
                    if !node.is_granted() {
                        node.set_waker(cx.waker());
                        // The grant may have landed between the check and the waker store.
                        if !node.is_granted() {
                            return Poll::Pending;
                        }
                    }
                    this.node = None;
                }

                if state.may_send() {
                    let value = this.value.take().expect("value present until completion");
                    state.buffer.push_back(value);
                    (Some(Ok(())), pop_front_waiter(&mut state.recv_waiters))
                } else {
                    // Full again (someone beat us to the slot); park at the back.
                    let node = WaitNode::new(cx.waker().clone());
                    state.send_waiters.push_back(Arc::clone(&node));
                    this.node = Some(node);
                    (None, None)
                }
            }
        };

        if let Some(node) = to_wake {
            node.grant();
        }

        match result {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

impl<T> Drop for SendFuture<T> {
    fn drop(&mut self) {
        let Some(node) = self.node.take() else {
            return;
        };

        let granted_next = {
            let mut state = self.state.lock().expect(ERR_POISONED_LOCK);
            let removed = remove_waiter(&mut state.send_waiters, &node);
            // A grant we never acted on is a wakeup hint; pass it to the next parked sender.
            if !removed && node.is_granted() {
                pop_front_waiter(&mut state.send_waiters)
            } else {
                None
            }
        };

        if let Some(next) = granted_next {
            next.grant();
        }
    }
}

impl<T> fmt::Debug for SendFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendFuture").finish_non_exhaustive()
    }
}

/// Future returned by [`Channel::recv`].
#[must_use = "futures do nothing unless awaited"]
pub struct RecvFuture<T> {
    state: Arc<StdMutex<ChanState<T>>>,
    node: Option<Arc<WaitNode>>,
}

impl<T> Future for RecvFuture<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        let (result, to_wake) = {
            let mut state = this.state.lock().expect(ERR_POISONED_LOCK);

            if let Some(value) = state.buffer.pop_front() {
                this.node = None;
                (Some(Some(value)), pop_front_waiter(&mut state.send_waiters))
            } else if state.closed {
                this.node = None;
                (Some(None), None)
            } else {
                // Same hint-consumption discipline as the send side: a granted node means
                // "re-check now", never "stay parked".
                if let Some(node) = &this.node {
                    if !node.is_granted() {
                        node.set_waker(cx.waker());
                        if !node.is_granted() {
                            return Poll::Pending;
                        }
                    }
                    this.node = None;
                }

                let node = WaitNode::new(cx.waker().clone());
                state.recv_waiters.push_back(Arc::clone(&node));
                this.node = Some(node);

                // On a rendezvous channel our arrival is what unblocks a parked sender.
                let sender = if state.capacity == Some(0) {
                    pop_front_waiter(&mut state.send_waiters)
                } else {
                    None
                };
                (None, sender)
            }
        };

        if let Some(node) = to_wake {
            node.grant();
        }

        match result {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

impl<T> Drop for RecvFuture<T> {
    fn drop(&mut self) {
        let Some(node) = self.node.take() else {
            return;
        };

        let granted_next = {
            let mut state = self.state.lock().expect(ERR_POISONED_LOCK);
            let removed = remove_waiter(&mut state.recv_waiters, &node);
            if !removed && node.is_granted() {
                pop_front_waiter(&mut state.recv_waiters)
            } else {
                None
            }
        };

        if let Some(next) = granted_next {
            next.grant();
        }
    }
}

impl<T> fmt::Debug for RecvFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvFuture").finish_non_exhaustive()
    }
}
