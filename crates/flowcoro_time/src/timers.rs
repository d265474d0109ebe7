// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::mem;
use std::task::Waker;
use std::time::{Duration, Instant};

/// Unique identifier for a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerKey {
    deadline: Instant,

    /// Registration sequence number. Distinguishes timers that share a deadline and, because it
    /// is monotonically increasing, makes equal deadlines fire in registration order.
    seq: u64,
}

impl TimerKey {
    const fn new(deadline: Instant, seq: u64) -> Self {
        Self { deadline, seq }
    }

    /// When the timer will fire.
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// The management of one-shot timers.
///
/// Timers are kept in an ordered map keyed by `(deadline, sequence)`, so iteration order is
/// firing order and ties on the deadline resolve first-registered-first. After a timer fires it
/// is removed; nothing re-arms automatically.
#[derive(Debug, Default)]
pub struct Timers {
    wakers: BTreeMap<TimerKey, Waker>,
    next_seq: u64,
}

impl Timers {
    /// The number of registered timers.
    pub fn len(&self) -> usize {
        self.wakers.len()
    }

    /// Whether no timers are registered.
    pub fn is_empty(&self) -> bool {
        self.wakers.is_empty()
    }

    #[cfg(test)]
    fn contains(&self, key: TimerKey) -> bool {
        self.wakers.contains_key(&key)
    }

    /// Registers a waker to be woken at `when`. Returns the key for unregistration.
    pub fn register(&mut self, when: Instant, waker: Waker) -> TimerKey {
        self.next_seq += 1;
        let key = TimerKey::new(when, self.next_seq);

        self.wakers.insert(key, waker);

        key
    }

    /// Removes a timer. Removing a timer that already fired is a no-op.
    pub fn unregister(&mut self, key: TimerKey) {
        self.wakers.remove(&key);
    }

    /// Drops every registered timer without waking it. Returns how many were dropped.
    ///
    /// Used at shutdown; the dropped wakers release whatever tasks they kept alive.
    pub fn clear(&mut self) -> usize {
        let count = self.wakers.len();
        self.wakers.clear();
        count
    }

    /// The earliest registered deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.wakers.keys().next().map(TimerKey::deadline)
    }

    /// Wakes every timer whose deadline is at or before `now`.
    ///
    /// Returns the next deadline still pending, if any.
    #[cfg_attr(test, mutants::skip)] // Causes test timeout.
    pub fn advance(&mut self, now: Instant) -> Option<Instant> {
        // Timers whose deadline equals `now` must fire too, and `split_off` keeps keys equal to
        // the split point on the wrong side. Nudging the split point by 1ns makes the boundary
        // inclusive.
        let adjusted_now = now.checked_add(Duration::from_nanos(1)).unwrap_or(now);

        match self.wakers.first_entry() {
            Some(entry) => {
                if entry.key().deadline() <= adjusted_now {
                    let pending = self.wakers.split_off(&TimerKey::new(adjusted_now, 0));
                    let due = mem::replace(&mut self.wakers, pending);

                    for (_, waker) in due {
                        waker.wake();
                    }

                    return self.next_deadline();
                }

                Some(entry.key().deadline())
            }
            None => None,
        }
    }
}
