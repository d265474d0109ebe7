// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Composition of concurrent tasks.
//!
//! All of these poll their children within the awaiting task, so the children run concurrently
//! with each other (their timers and wakeups interleave) without needing to be spawned first.
//! Spawned [`JoinHandle`][crate::JoinHandle]s work just as well and additionally run in
//! parallel.
//!
//! The child futures are expected to produce `Result<T>`; that is what join handles produce,
//! and it is the channel through which failures propagate. Losing children are dropped, never
//! cancelled: wire a [`CancellationSource`][flowcoro_lifecycle::CancellationSource] through the
//! tasks when a lost race should stop the losers.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use pin_project::pin_project;

use crate::Error;

/// Waits for every future, yielding the results in input order.
///
/// Completes only once *all* children finished, even when one fails early; the first error (in
/// input order) is then propagated and the surviving results are discarded.
pub fn join_all<I, T>(futures: I) -> JoinAll<T>
where
    I: IntoIterator,
    I::Item: Future<Output = crate::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let children: Vec<_> = futures
        .into_iter()
        .map(|future| ChildSlot {
            future: Some(Box::pin(future) as BoxFuture<'static, crate::Result<T>>),
            result: None,
        })
        .collect();

    JoinAll {
        pending: children.len(),
        first_error: None,
        children,
    }
}

/// Like [`join_all`], but never fails: each child's outcome is reported individually.
pub fn when_all_settled<I, T>(futures: I) -> WhenAllSettled<T>
where
    I: IntoIterator,
    I::Item: Future<Output = crate::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let children: Vec<_> = futures
        .into_iter()
        .map(|future| SettledSlot {
            future: Some(Box::pin(future) as BoxFuture<'static, crate::Result<T>>),
            outcome: None,
        })
        .collect();

    WhenAllSettled {
        pending: children.len(),
        children,
    }
}

/// Waits for the first future to finish, yielding `(winner index, value)`.
///
/// The first *completion* wins, successful or not; a winning error is propagated as-is. Losers
/// are dropped when the returned future is.
pub fn when_any<I, T>(futures: I) -> WhenAny<T>
where
    I: IntoIterator,
    I::Item: Future<Output = crate::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    WhenAny {
        children: futures
            .into_iter()
            .map(|future| Box::pin(future) as BoxFuture<'static, crate::Result<T>>)
            .collect(),
    }
}

/// Alias for [`when_any`]; the name conveys racing intent.
pub fn when_race<I, T>(futures: I) -> WhenAny<T>
where
    I: IntoIterator,
    I::Item: Future<Output = crate::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    when_any(futures)
}

/// Future returned by [`join_all`].
#[must_use = "futures do nothing unless awaited"]
pub struct JoinAll<T> {
    children: Vec<ChildSlot<T>>,
    pending: usize,
    first_error: Option<Error>,
}

struct ChildSlot<T> {
    future: Option<BoxFuture<'static, crate::Result<T>>>,
    result: Option<T>,
}

impl<T> Unpin for JoinAll<T> {}

impl<T> Future for JoinAll<T> {
    type Output = crate::Result<Vec<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        for slot in &mut this.children {
            let Some(future) = slot.future.as_mut() else {
                continue;
            };
            match future.as_mut().poll(cx) {
                Poll::Ready(Ok(value)) => {
                    slot.result = Some(value);
                    slot.future = None;
                    this.pending -= 1;
                }
                Poll::Ready(Err(error)) => {
                    if this.first_error.is_none() {
                        this.first_error = Some(error);
                    }
                    slot.future = None;
                    this.pending -= 1;
                }
                Poll::Pending => {}
            }
        }

        if this.pending > 0 {
            return Poll::Pending;
        }

        if let Some(error) = this.first_error.take() {
            return Poll::Ready(Err(error));
        }

        let results = this
            .children
            .drain(..)
            .map(|slot| slot.result.expect("every successful child stored a result"))
            .collect();
        Poll::Ready(Ok(results))
    }
}

impl<T> std::fmt::Debug for JoinAll<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinAll")
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

/// Future returned by [`when_all_settled`].
#[must_use = "futures do nothing unless awaited"]
pub struct WhenAllSettled<T> {
    children: Vec<SettledSlot<T>>,
    pending: usize,
}

struct SettledSlot<T> {
    future: Option<BoxFuture<'static, crate::Result<T>>>,
    outcome: Option<crate::Result<T>>,
}

impl<T> Unpin for WhenAllSettled<T> {}

impl<T> Future for WhenAllSettled<T> {
    type Output = Vec<crate::Result<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        for slot in &mut this.children {
            let Some(future) = slot.future.as_mut() else {
                continue;
            };
            if let Poll::Ready(outcome) = future.as_mut().poll(cx) {
                slot.outcome = Some(outcome);
                slot.future = None;
                this.pending -= 1;
            }
        }

        if this.pending > 0 {
            return Poll::Pending;
        }

        let outcomes = this
            .children
            .drain(..)
            .map(|slot| slot.outcome.expect("every settled child stored an outcome"))
            .collect();
        Poll::Ready(outcomes)
    }
}

impl<T> std::fmt::Debug for WhenAllSettled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhenAllSettled")
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

/// Future returned by [`when_any`] and [`when_race`].
#[must_use = "futures do nothing unless awaited"]
pub struct WhenAny<T> {
    children: Vec<BoxFuture<'static, crate::Result<T>>>,
}

impl<T> Future for WhenAny<T> {
    type Output = crate::Result<(usize, T)>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if this.children.is_empty() {
            return Poll::Ready(Err(Error::Programming(String::from(
                "when_any requires at least one task",
            ))));
        }

        for (index, child) in this.children.iter_mut().enumerate() {
            if let Poll::Ready(outcome) = child.as_mut().poll(cx) {
                return Poll::Ready(outcome.map(|value| (index, value)));
            }
        }

        Poll::Pending
    }
}

impl<T> std::fmt::Debug for WhenAny<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhenAny")
            .field("children", &self.children.len())
            .finish_non_exhaustive()
    }
}

/// A two-way typed sum for heterogeneous [`when_any2`] results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Either2<A, B> {
    /// The first racer won.
    First(A),
    /// The second racer won.
    Second(B),
}

/// A three-way typed sum for heterogeneous [`when_any3`] results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Either3<A, B, C> {
    /// The first racer won.
    First(A),
    /// The second racer won.
    Second(B),
    /// The third racer won.
    Third(C),
}

/// Races two futures of different result types; yields `(winner index, value)` as a typed sum.
pub fn when_any2<FA, FB, A, B>(a: FA, b: FB) -> WhenAny2<FA, FB>
where
    FA: Future<Output = crate::Result<A>>,
    FB: Future<Output = crate::Result<B>>,
{
    WhenAny2 { a, b }
}

/// Races three futures of different result types; yields `(winner index, value)` as a typed
/// sum.
pub fn when_any3<FA, FB, FC, A, B, C>(a: FA, b: FB, c: FC) -> WhenAny3<FA, FB, FC>
where
    FA: Future<Output = crate::Result<A>>,
    FB: Future<Output = crate::Result<B>>,
    FC: Future<Output = crate::Result<C>>,
{
    WhenAny3 { a, b, c }
}

/// Future returned by [`when_any2`].
#[pin_project]
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct WhenAny2<FA, FB> {
    #[pin]
    a: FA,
    #[pin]
    b: FB,
}

impl<FA, FB, A, B> Future for WhenAny2<FA, FB>
where
    FA: Future<Output = crate::Result<A>>,
    FB: Future<Output = crate::Result<B>>,
{
    type Output = crate::Result<(usize, Either2<A, B>)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(outcome) = this.a.poll(cx) {
            return Poll::Ready(outcome.map(|value| (0, Either2::First(value))));
        }
        if let Poll::Ready(outcome) = this.b.poll(cx) {
            return Poll::Ready(outcome.map(|value| (1, Either2::Second(value))));
        }

        Poll::Pending
    }
}

/// Future returned by [`when_any3`].
#[pin_project]
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct WhenAny3<FA, FB, FC> {
    #[pin]
    a: FA,
    #[pin]
    b: FB,
    #[pin]
    c: FC,
}

impl<FA, FB, FC, A, B, C> Future for WhenAny3<FA, FB, FC>
where
    FA: Future<Output = crate::Result<A>>,
    FB: Future<Output = crate::Result<B>>,
    FC: Future<Output = crate::Result<C>>,
{
    type Output = crate::Result<(usize, Either3<A, B, C>)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(outcome) = this.a.poll(cx) {
            return Poll::Ready(outcome.map(|value| (0, Either3::First(value))));
        }
        if let Poll::Ready(outcome) = this.b.poll(cx) {
            return Poll::Ready(outcome.map(|value| (1, Either3::Second(value))));
        }
        if let Poll::Ready(outcome) = this.c.poll(cx) {
            return Poll::Ready(outcome.map(|value| (2, Either3::Third(value))));
        }

        Poll::Pending
    }
}

/// Waits for every listed task, yielding a tuple of their values.
///
/// All children are driven to completion first; the first error in listing order (if any) is
/// then propagated. Supports two to four children.
#[macro_export]
macro_rules! when_all {
    ($a:expr, $b:expr $(,)?) => {{
        async {
            let (ra, rb) = $crate::__private::futures::join!($a, $b);
            (|| -> $crate::Result<_> { Ok((ra?, rb?)) })()
        }
    }};
    ($a:expr, $b:expr, $c:expr $(,)?) => {{
        async {
            let (ra, rb, rc) = $crate::__private::futures::join!($a, $b, $c);
            (|| -> $crate::Result<_> { Ok((ra?, rb?, rc?)) })()
        }
    }};
    ($a:expr, $b:expr, $c:expr, $d:expr $(,)?) => {{
        async {
            let (ra, rb, rc, rd) = $crate::__private::futures::join!($a, $b, $c, $d);
            (|| -> $crate::Result<_> { Ok((ra?, rb?, rc?, rd?)) })()
        }
    }};
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::*;
    use flowcoro_lifecycle::OperationCancelled;

    fn ok<T: Send + 'static>(value: T) -> impl Future<Output = crate::Result<T>> + Send {
        async move { Ok(value) }
    }

    fn failing<T: Send + 'static>() -> impl Future<Output = crate::Result<T>> + Send {
        async move { Err(Error::Cancelled(OperationCancelled::new())) }
    }

    #[test]
    fn join_all_preserves_input_order() {
        let results = block_on(join_all(vec![ok(1), ok(2), ok(3)]));
        assert_eq!(results.expect("all children succeed"), vec![1, 2, 3]);
    }

    #[test]
    fn join_all_propagates_the_error_after_all_complete() {
        let result = block_on(join_all(vec![
            Box::pin(ok(1)) as BoxFuture<'static, crate::Result<i32>>,
            Box::pin(failing()),
            Box::pin(ok(3)),
        ]));
        assert!(result.expect_err("one child failed").is_cancelled());
    }

    #[test]
    fn when_all_settled_reports_individual_outcomes() {
        let outcomes = block_on(when_all_settled(vec![
            Box::pin(ok(1)) as BoxFuture<'static, crate::Result<i32>>,
            Box::pin(failing()),
        ]));

        assert_eq!(outcomes.len(), 2);
        assert_eq!(*outcomes[0].as_ref().expect("first child succeeded"), 1);
        assert!(outcomes[1].as_ref().expect_err("second child failed").is_cancelled());
    }

    #[test]
    fn when_any_yields_winner_index_and_value() {
        let pending = futures::future::pending::<crate::Result<i32>>();
        let (index, value) =
            block_on(when_any(vec![
                Box::pin(pending) as BoxFuture<'static, crate::Result<i32>>,
                Box::pin(ok(5)),
            ]))
            .expect("a child completes");

        assert_eq!(index, 1);
        assert_eq!(value, 5);
    }

    #[test]
    fn when_any_of_nothing_is_an_error() {
        let result = block_on(when_any(Vec::<BoxFuture<'static, crate::Result<i32>>>::new()));
        assert!(matches!(result, Err(Error::Programming(_))));
    }

    #[test]
    fn when_any3_produces_a_typed_sum() {
        let pending_str = futures::future::pending::<crate::Result<&'static str>>();
        let pending_f64 = futures::future::pending::<crate::Result<f64>>();

        let (index, value) =
            block_on(when_any3(ok(1), pending_str, pending_f64)).expect("a child completes");

        assert_eq!(index, 0);
        assert_eq!(value, Either3::First(1));
    }

    #[test]
    fn when_all_macro_yields_a_typed_tuple() {
        let result = block_on(when_all!(ok(1), ok("two"), ok(3.5_f64)));
        let (a, b, c) = result.expect("all children succeed");
        assert_eq!(a, 1);
        assert_eq!(b, "two");
        assert!((c - 3.5).abs() < f64::EPSILON);
    }

    #[test]
    fn when_all_macro_propagates_errors() {
        let result = block_on(when_all!(ok(1), failing::<i32>()));
        assert!(result.expect_err("second child failed").is_cancelled());
    }
}
