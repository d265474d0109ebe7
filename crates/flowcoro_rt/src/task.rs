// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::task::{Context, Poll, Wake, Waker};

use flowcoro_lifecycle::{
    CancellationRegistration, CancellationToken, LifecycleTracker, PooledGuard, StateManager,
    TaskEnd, TaskState,
};
use flowcoro_sync::once_event::{self, EventReceiver, EventSender};
use futures::future::BoxFuture;

use crate::{DriverShared, ERR_POISONED_LOCK, Error, JoinHandle};

/// The scheduler-facing half of a spawned task.
///
/// The core is what sits in the ready queue, what wakers point at, and what the driver polls.
/// Everything typed (the body, the result delivery) lives inside the boxed [`TaskFuture`]; the
/// core itself is type-erased so the driver can treat all tasks alike.
///
/// # Resumption discipline
///
/// Two mechanisms together guarantee that a task is resumed by at most one thread at a time and
/// never after reaching a terminal state:
///
/// - the `scheduled` flag makes each wake enqueue the core at most once until it is next polled;
/// - the future slot is behind a mutex, so even a re-enqueue racing with an in-progress poll
///   serializes instead of resuming concurrently.
pub(crate) struct TaskCore {
    future: StdMutex<Option<BoxFuture<'static, ()>>>,
    scheduled: AtomicBool,
    pub(crate) state: Arc<StateManager>,
    driver: Weak<DriverShared>,

    // Keeps the cancel-wakes-the-task callback registered for the task's lifetime.
    cancel_wake: StdMutex<Option<CancellationRegistration>>,
}

impl TaskCore {
    /// Transitions to scheduled, returning whether the caller won the right to enqueue.
    pub(crate) fn mark_scheduled(&self) -> bool {
        self.scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Polls the task once. Called by the driver with a freshly dequeued core, and by `spawn`
    /// for the eager first poll on the caller's thread.
    pub(crate) fn run(self: &Arc<Self>) {
        // Clear before polling: a wake that lands mid-poll must trigger a re-enqueue.
        self.scheduled.store(false, Ordering::Release);

        if self.state.is_terminal() {
            return;
        }

        let mut slot = self.future.lock().expect(ERR_POISONED_LOCK);
        let Some(future) = slot.as_mut() else {
            return;
        };

        if !self.state.try_transition(TaskState::Created, TaskState::Running) {
            _ = self
                .state
                .try_transition(TaskState::Suspended, TaskState::Running);
        }

        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);

        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                // The TaskFuture wrapper has already delivered the outcome and moved the state
                // machine to its terminal value; all that is left is releasing the body.
                *slot = None;
            }
            Poll::Pending => {
                _ = self
                    .state
                    .try_transition(TaskState::Running, TaskState::Suspended);
            }
        }
    }

    /// Drops the task body without polling it again. The wrapper's drop delivers a
    /// disconnection to the join handle, which surfaces as [`Error::Shutdown`].
    pub(crate) fn abandon(&self) {
        let mut slot = self.future.lock().expect(ERR_POISONED_LOCK);
        *slot = None;
    }
}

impl Wake for TaskCore {
    fn wake(self: Arc<Self>) {
        if let Some(driver) = self.driver.upgrade() {
            driver.schedule(self);
        }
    }

    fn wake_by_ref(self: &Arc<Self>) {
        Arc::clone(self).wake();
    }
}

impl std::fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCore")
            .field("state", &self.state.state())
            .field("scheduled", &self.scheduled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Builds the core + join handle pair for a future and wires up cancellation.
///
/// The caller decides what to do with the core (eager poll, abandon on a stopped runtime).
pub(crate) fn create_task<F, T>(
    driver: &Arc<DriverShared>,
    tracker: &Arc<LifecycleTracker>,
    token: CancellationToken,
    record: Option<PooledGuard>,
    future: F,
) -> (Arc<TaskCore>, JoinHandle<T>)
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (sender, receiver) = once_event::event();
    let state = Arc::new(StateManager::new());

    let wrapper = TaskFuture {
        body: Some(Box::pin(future)),
        sender: Some(sender),
        token: token.clone(),
        state: Arc::clone(&state),
        guard: Some(LifecycleTracker::task_started(tracker)),
        record,
    };

    let core = Arc::new(TaskCore {
        future: StdMutex::new(Some(Box::pin(wrapper))),
        scheduled: AtomicBool::new(false),
        state,
        driver: Arc::downgrade(driver),
        cancel_wake: StdMutex::new(None),
    });

    // A cancellation request must reschedule the task promptly so the wrapper can observe the
    // token; without this the task would only notice at its next organic wakeup.
    let registration = {
        let weak = Arc::downgrade(&core);
        token.on_cancel(move || {
            if let Some(core) = weak.upgrade() {
                core.wake();
            }
        })
    };
    *core.cancel_wake.lock().expect(ERR_POISONED_LOCK) = Some(registration);

    let handle = JoinHandle::new(receiver, Arc::clone(&core));
    (core, handle)
}

/// The type-carrying wrapper around a task body.
///
/// Owns the result delivery, the cancellation check at every resumption, panic capture, the
/// lifecycle-tracker guard and the optional pooled record. Completes (as a future) with `()`;
/// the actual outcome travels through the once-event to the join handle.
struct TaskFuture<T> {
    body: Option<BoxFuture<'static, T>>,
    sender: Option<EventSender<crate::Result<T>>>,
    token: CancellationToken,
    state: Arc<StateManager>,
    guard: Option<flowcoro_lifecycle::TaskGuard>,
    record: Option<PooledGuard>,
}

impl<T> TaskFuture<T> {
    fn finish(&mut self, outcome: crate::Result<T>, end: TaskEnd, terminal: TaskState) {
        self.body = None;
        if let Some(mut guard) = self.guard.take() {
            guard.record(end);
        }
        self.record = None;

        // Terminal state first: anyone the delivery wakes must already observe it.
        self.state.force_transition(terminal);

        if let Some(sender) = self.sender.take() {
            sender.set(outcome);
        }
    }
}

impl<T: Send + 'static> Future for TaskFuture<T> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if this.sender.is_none() {
            return Poll::Ready(());
        }

        // The cancellation check at the suspension point: a cancelled task is not resumed into
        // its body again.
        if let Err(cancelled) = this.token.check() {
            this.finish(
                Err(Error::Cancelled(cancelled)),
                TaskEnd::Cancelled,
                TaskState::Cancelled,
            );
            return Poll::Ready(());
        }

        let body = this.body.as_mut().expect("body present until completion");

        match catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(cx))) {
            Ok(Poll::Ready(value)) => {
                // A cancel that lands while the value is being produced still wins; this is the
                // return-value-assignment check.
                match this.token.check() {
                    Ok(()) => this.finish(Ok(value), TaskEnd::Completed, TaskState::Completed),
                    Err(cancelled) => this.finish(
                        Err(Error::Cancelled(cancelled)),
                        TaskEnd::Cancelled,
                        TaskState::Cancelled,
                    ),
                }
                Poll::Ready(())
            }
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => {
                this.finish(
                    Err(Error::Panicked(describe_panic(payload.as_ref()))),
                    TaskEnd::Failed,
                    TaskState::Destroyed,
                );
                Poll::Ready(())
            }
        }
    }
}

impl<T> Drop for TaskFuture<T> {
    fn drop(&mut self) {
        if self.sender.is_some() {
            // Abandoned without completing (runtime shutdown or a dropped scheduler). The
            // sender's own drop delivers the disconnection to the join handle.
            if let Some(mut guard) = self.guard.take() {
                guard.record(TaskEnd::Failed);
            }
            self.state.force_transition(TaskState::Destroyed);
        }
    }
}

/// Renders a panic payload into the message carried by [`Error::Panicked`].
pub(crate) fn describe_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("opaque panic payload")
    }
}

// JoinHandle keeps the receiver typed; re-exported here for create_task's signature.
pub(crate) type TaskReceiver<T> = EventReceiver<crate::Result<T>>;
