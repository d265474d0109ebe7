// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use flowcoro_lifecycle::TaskState;
use flowcoro_sync::once_event::Disconnected;

use crate::{Error, TaskCore, TaskReceiver, non_blocking_thread};

/// A handle to a spawned task producing a value of type `T`.
///
/// The task itself runs regardless of what happens to the handle: dropping the handle detaches
/// the task rather than cancelling it (wire a
/// [`CancellationToken`][flowcoro_lifecycle::CancellationToken] through
/// [`Runtime::spawn_with_token`][crate::Runtime::spawn_with_token] when you need cancellation).
///
/// The outcome can be consumed exactly once, through any one of:
///
/// - `.await` (from async code) - resolves to `Result<T>`;
/// - [`wait`][Self::wait] (blocking; only from threads the runtime does not own);
/// - [`try_get`][Self::try_get] (non-blocking).
#[derive(Debug)]
pub struct JoinHandle<T> {
    receiver: Option<TaskReceiver<T>>,
    cached: Option<crate::Result<T>>,
    core: Arc<TaskCore>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(receiver: TaskReceiver<T>, core: Arc<TaskCore>) -> Self {
        Self {
            receiver: Some(receiver),
            cached: None,
            core,
        }
    }

    /// Blocks the calling thread until the task finishes, then returns its outcome.
    ///
    /// # Panics
    ///
    /// Panics if called from a thread owned by the runtime (driver or worker threads): blocking
    /// there can deadlock the scheduler that would produce the result.
    ///
    /// # Errors
    ///
    /// Whatever the task produced: [`Error::Cancelled`], [`Error::Panicked`],
    /// [`Error::Shutdown`] if the runtime stopped before the task could finish.
    pub fn wait(mut self) -> crate::Result<T> {
        non_blocking_thread::assert_not_flagged();

        if let Some(cached) = self.cached.take() {
            return cached;
        }

        match self.receiver.take() {
            Some(receiver) => flatten(receiver.wait()),
            None => Err(Error::Programming(String::from(
                "join handle outcome was already consumed",
            ))),
        }
    }

    /// Takes the value if the task completed successfully; `None` while it is still running or
    /// when it finished with an error (inspect [`error_message`][Self::error_message] then).
    pub fn try_get(&mut self) -> Option<T> {
        self.fetch();
        match self.cached.take() {
            Some(Ok(value)) => Some(value),
            other => {
                self.cached = other;
                None
            }
        }
    }

    /// The message of the error the task finished with, if it has finished and failed.
    pub fn error_message(&mut self) -> Option<String> {
        self.fetch();
        match &self.cached {
            Some(Err(error)) => Some(error.to_string()),
            _ => None,
        }
    }

    /// The task's current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.core.state.state()
    }

    /// Whether the task reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.core.state.is_terminal()
    }

    /// Whether the task finished through cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.core.state.state() == TaskState::Cancelled
    }

    /// Takes the outcome if it is available, without blocking. Used by `sync_wait`'s
    /// cooperative driving loop.
    pub(crate) fn try_result(&mut self) -> Option<crate::Result<T>> {
        self.fetch();
        self.cached.take()
    }

    fn fetch(&mut self) {
        if self.cached.is_some() {
            return;
        }
        let Some(receiver) = &mut self.receiver else {
            return;
        };
        if let Some(result) = receiver.try_take() {
            self.cached = Some(flatten(result));
            self.receiver = None;
        }
    }
}

impl<T> Unpin for JoinHandle<T> {}

impl<T> Future for JoinHandle<T> {
    type Output = crate::Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(cached) = self.cached.take() {
            return Poll::Ready(cached);
        }

        let receiver = self
            .receiver
            .as_mut()
            .expect("join handle polled after its outcome was consumed");

        Pin::new(receiver).poll(cx).map(flatten)
    }
}

fn flatten<T>(delivered: Result<crate::Result<T>, Disconnected>) -> crate::Result<T> {
    match delivered {
        Ok(outcome) => outcome,
        // The task was dropped without completing; the only way that happens is the runtime
        // tearing down around it.
        Err(Disconnected) => Err(Error::Shutdown),
    }
}
