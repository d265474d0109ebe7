// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};

use crate::{ERR_POISONED_LOCK, OperationCancelled};

type Callback = Box<dyn FnOnce() + Send>;

/// The state shared between one [`CancellationSource`] and its tokens.
///
/// The `cancelled` flag is monotonic: once set it is never cleared. The callback list fires
/// exactly once, at the moment of the transition; callbacks registered afterwards run
/// immediately.
pub(crate) struct CancellationState {
    cancelled: AtomicBool,
    callbacks: Mutex<Vec<(u64, Callback)>>,
    next_callback_id: AtomicU64,
    reason: Mutex<Option<String>>,
}

impl CancellationState {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
            next_callback_id: AtomicU64::new(1),
            reason: Mutex::new(None),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn request_cancellation(&self) {
        self.request_cancellation_with_reason(None);
    }

    pub(crate) fn request_cancellation_with_reason(&self, reason: Option<String>) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return; // Already cancelled; callbacks fired on the first call.
        }

        if let Some(reason) = reason {
            *self.reason.lock().expect(ERR_POISONED_LOCK) = Some(reason);
        }

        let callbacks = {
            let mut callbacks = self.callbacks.lock().expect(ERR_POISONED_LOCK);
            std::mem::take(&mut *callbacks)
        };

        // Callbacks run outside the lock so that one of them may register further callbacks on
        // this same state (which then run immediately) without deadlocking.
        for (_, callback) in callbacks {
            callback();
        }
    }

    fn cancellation_error(&self) -> OperationCancelled {
        match self.reason.lock().expect(ERR_POISONED_LOCK).as_deref() {
            Some(reason) => OperationCancelled::with_message(reason),
            None => OperationCancelled::new(),
        }
    }

    /// Registers a callback, or runs it immediately when already cancelled.
    /// Returns the id to unregister with, or `None` when the callback already ran.
    fn register(&self, callback: Callback) -> Option<u64> {
        {
            let mut callbacks = self.callbacks.lock().expect(ERR_POISONED_LOCK);
            if !self.is_cancelled() {
                let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
                callbacks.push((id, callback));
                return Some(id);
            }
        }

        callback();
        None
    }

    fn unregister(&self, id: u64) {
        let mut callbacks = self.callbacks.lock().expect(ERR_POISONED_LOCK);
        callbacks.retain(|(existing, _)| *existing != id);
    }
}

impl fmt::Debug for CancellationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationState")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// The sole owner of the right to cancel.
///
/// Not cloneable; hand out [`CancellationToken`]s instead. Dropping the source does not cancel -
/// outstanding tokens simply never fire.
#[derive(Debug)]
pub struct CancellationSource {
    state: Arc<CancellationState>,
}

impl CancellationSource {
    /// A fresh, uncancelled source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(CancellationState::new()),
        }
    }

    /// A token observing this source. Any number may be produced; all share the same state.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            state: Some(Arc::clone(&self.state)),
        }
    }

    /// Requests cancellation. Idempotent: the second and later calls are no-ops.
    pub fn cancel(&self) {
        self.state.request_cancellation();
    }

    /// Requests cancellation with a message that token observers surface in their error, e.g.
    /// the deadline that caused a timeout. Idempotent like [`cancel`][Self::cancel]; the reason
    /// of the first call wins.
    pub fn cancel_with_reason(&self, reason: impl Into<String>) {
        self.state
            .request_cancellation_with_reason(Some(reason.into()));
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    pub(crate) fn state_weak(&self) -> Weak<CancellationState> {
        Arc::downgrade(&self.state)
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// An observer of a [`CancellationSource`]. Cloneable and cheap to pass around.
///
/// The default token ([`CancellationToken::none`]) never cancels.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Option<Arc<CancellationState>>,
}

impl CancellationToken {
    /// A token that never reports cancellation.
    #[must_use]
    pub fn none() -> Self {
        Self { state: None }
    }

    /// A token that is already cancelled.
    #[must_use]
    pub fn already_cancelled() -> Self {
        let state = CancellationState::new();
        state.request_cancellation();
        Self {
            state: Some(Arc::new(state)),
        }
    }

    /// Whether cancellation was requested on the owning source.
    pub fn is_cancelled(&self) -> bool {
        self.state.as_deref().is_some_and(CancellationState::is_cancelled)
    }

    /// Fails with [`OperationCancelled`] if cancellation was requested.
    ///
    /// Task bodies call this at natural checkpoints; awaiters call it on resume.
    ///
    /// # Errors
    ///
    /// Returns [`OperationCancelled`] when the token is cancelled.
    pub fn check(&self) -> Result<(), OperationCancelled> {
        match &self.state {
            Some(state) if state.is_cancelled() => Err(state.cancellation_error()),
            _ => Ok(()),
        }
    }

    /// Registers a callback to run when cancellation is requested.
    ///
    /// If the token is already cancelled the callback runs immediately, on this thread. The
    /// returned registration unregisters the callback when dropped.
    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) -> CancellationRegistration {
        let Some(state) = &self.state else {
            return CancellationRegistration {
                state: Weak::new(),
                id: None,
            };
        };

        let id = state.register(Box::new(callback));
        CancellationRegistration {
            state: Arc::downgrade(state),
            id,
        }
    }

    /// A future that resolves when cancellation is requested. Never resolves for
    /// [`CancellationToken::none`].
    ///
    /// Use this to race any operation against cancellation.
    #[must_use]
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            token: self.clone(),
            waker_slot: Arc::new(Mutex::new(None)),
            registration: None,
        }
    }
}

/// RAII handle for a callback registered via [`CancellationToken::on_cancel`].
///
/// Dropping it unregisters the callback if it has not fired yet.
#[derive(Debug)]
pub struct CancellationRegistration {
    state: Weak<CancellationState>,
    id: Option<u64>,
}

impl CancellationRegistration {
    /// Whether the callback is still registered and could still fire.
    pub fn is_armed(&self) -> bool {
        self.id.is_some() && self.state.strong_count() > 0
    }
}

impl Drop for CancellationRegistration {
    fn drop(&mut self) {
        if let (Some(id), Some(state)) = (self.id, self.state.upgrade()) {
            state.unregister(id);
        }
    }
}

/// Future returned by [`CancellationToken::cancelled`].
#[derive(Debug)]
pub struct Cancelled {
    token: CancellationToken,
    waker_slot: Arc<Mutex<Option<Waker>>>,
    registration: Option<CancellationRegistration>,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.token.is_cancelled() {
            return Poll::Ready(());
        }

        *self.waker_slot.lock().expect(ERR_POISONED_LOCK) = Some(cx.waker().clone());

        if self.registration.is_none() {
            let waker_slot = Arc::clone(&self.waker_slot);
            let registration = self.token.on_cancel(move || {
                if let Some(waker) = waker_slot.lock().expect(ERR_POISONED_LOCK).take() {
                    waker.wake();
                }
            });
            self.registration = Some(registration);

            // The cancel may have raced with the registration; re-check so the callback running
            // before our waker was stored cannot strand us.
            if self.token.is_cancelled() {
                return Poll::Ready(());
            }
        }

        Poll::Pending
    }
}

/// Combines several tokens into one that cancels when any input cancels.
///
/// If any input token is already cancelled, the combined state starts out cancelled.
#[derive(Debug)]
pub struct CombinedCancellation {
    state: Arc<CancellationState>,
    _registrations: Vec<CancellationRegistration>,
}

impl CombinedCancellation {
    /// The token observing the combined state.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            state: Some(Arc::clone(&self.state)),
        }
    }

    /// Whether any input already cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }
}

/// Builds a [`CombinedCancellation`] observing every token in `tokens`.
#[must_use]
pub fn combine_tokens(tokens: &[CancellationToken]) -> CombinedCancellation {
    let state = Arc::new(CancellationState::new());

    let registrations = tokens
        .iter()
        .map(|token| {
            let state = Arc::clone(&state);
            token.on_cancel(move || state.request_cancellation())
        })
        .collect();

    CombinedCancellation {
        state,
        _registrations: registrations,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(CancellationSource: Send, Sync);
        static_assertions::assert_impl_all!(CancellationToken: Send, Sync, Clone);
        static_assertions::assert_impl_all!(Cancelled: Send);
    }

    #[test]
    fn token_observes_source() {
        let source = CancellationSource::new();
        let token = source.token();

        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        source.cancel();

        assert!(token.is_cancelled());
        assert!(token.check().is_err());
    }

    #[test]
    fn cancel_is_idempotent() {
        let source = CancellationSource::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let _registration = {
            let fired = Arc::clone(&fired);
            source.token().on_cancel(move || {
                fired.fetch_add(1, Ordering::Relaxed);
            })
        };

        source.cancel();
        source.cancel();

        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn callback_after_cancel_runs_immediately() {
        let source = CancellationSource::new();
        source.cancel();

        let fired = Arc::new(AtomicUsize::new(0));
        let registration = {
            let fired = Arc::clone(&fired);
            source.token().on_cancel(move || {
                fired.fetch_add(1, Ordering::Relaxed);
            })
        };

        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert!(!registration.is_armed());
    }

    #[test]
    fn dropped_registration_does_not_fire() {
        let source = CancellationSource::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let registration = {
            let fired = Arc::clone(&fired);
            source.token().on_cancel(move || {
                fired.fetch_add(1, Ordering::Relaxed);
            })
        };
        drop(registration);

        source.cancel();
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn none_token_never_cancels() {
        let token = CancellationToken::none();
        assert!(!token.is_cancelled());

        let registration = token.on_cancel(|| panic!("must never fire"));
        assert!(!registration.is_armed());
    }

    #[test]
    fn already_cancelled_token() {
        let token = CancellationToken::already_cancelled();
        assert!(token.is_cancelled());
        assert!(token.check().is_err());
    }

    #[test]
    fn cancelled_future_resolves_on_cancel() {
        let source = CancellationSource::new();
        let token = source.token();

        let waiter = thread::spawn(move || {
            futures::executor::block_on(token.cancelled());
        });

        thread::sleep(std::time::Duration::from_millis(10));
        source.cancel();

        waiter.join().expect("waiter must resolve after cancel");
    }

    #[test]
    fn cancelled_future_on_cancelled_token_is_ready() {
        let token = CancellationToken::already_cancelled();
        futures::executor::block_on(token.cancelled());
    }

    #[test]
    fn combined_token_fires_on_any_input() {
        let a = CancellationSource::new();
        let b = CancellationSource::new();

        let combined = combine_tokens(&[a.token(), b.token()]);
        assert!(!combined.is_cancelled());

        b.cancel();
        assert!(combined.is_cancelled());
        assert!(combined.token().is_cancelled());
    }

    #[test]
    fn combined_token_with_precancelled_input() {
        let a = CancellationSource::new();
        a.cancel();

        let combined = combine_tokens(&[a.token(), CancellationSource::new().token()]);
        assert!(combined.is_cancelled());
    }

    #[test]
    fn cancel_with_reason_surfaces_in_check() {
        let source = CancellationSource::new();
        let token = source.token();

        source.cancel_with_reason("deadline of 100ms elapsed");

        let error = token.check().expect_err("token is cancelled");
        assert_eq!(error.to_string(), "deadline of 100ms elapsed");
    }

    #[test]
    fn first_cancellation_reason_wins() {
        let source = CancellationSource::new();
        source.cancel();
        source.cancel_with_reason("too late to matter");

        let error = source.token().check().expect_err("token is cancelled");
        assert_eq!(error.to_string(), "operation was cancelled");
    }

    #[test]
    fn cancellation_is_monotonic_across_threads() {
        let source = Arc::new(CancellationSource::new());
        let token = source.token();

        let cancelling = {
            let source = Arc::clone(&source);
            thread::spawn(move || source.cancel())
        };

        cancelling.join().expect("cancel thread must not panic");

        // Once observed true, it must stay true.
        assert!(token.is_cancelled());
        for _ in 0..100 {
            assert!(token.is_cancelled());
        }
    }
}
