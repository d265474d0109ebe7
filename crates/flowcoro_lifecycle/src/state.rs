// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// The lifecycle state of a task.
///
/// Transitions only ever move toward the terminal states; a task that reached
/// [`Completed`][Self::Completed], [`Destroyed`][Self::Destroyed] or
/// [`Cancelled`][Self::Cancelled] is never resumed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Created but not yet polled.
    Created = 0,
    /// Currently being polled by some thread.
    Running = 1,
    /// Parked at a suspension point, waiting to be rescheduled.
    Suspended = 2,
    /// Finished normally.
    Completed = 3,
    /// Torn down after a panic in the task body.
    Destroyed = 4,
    /// Finished via cooperative cancellation.
    Cancelled = 5,
}

impl TaskState {
    /// Whether this state is terminal.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Destroyed | Self::Cancelled)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Suspended,
            3 => Self::Completed,
            4 => Self::Destroyed,
            5 => Self::Cancelled,
            _ => unreachable!("state values are only ever written from TaskState"),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Destroyed => "destroyed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// The atomic state machine attached to every task.
///
/// Records the creation instant and publishes the completion instant exactly once, on the first
/// transition into a terminal state.
#[derive(Debug)]
pub struct StateManager {
    state: AtomicU8,
    created_at: Instant,
    completed_at: OnceLock<Instant>,
}

impl StateManager {
    /// A fresh manager in the [`TaskState::Created`] state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(TaskState::Created as u8),
            created_at: Instant::now(),
            completed_at: OnceLock::new(),
        }
    }

    /// The current state.
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempts the transition `from -> to`, failing if the current state is not `from`.
    pub fn try_transition(&self, from: TaskState, to: TaskState) -> bool {
        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if moved && to.is_terminal() {
            self.mark_completion();
        }

        moved
    }

    /// Unconditionally moves to `to`. Reserved for teardown paths where the precise prior state
    /// no longer matters.
    pub fn force_transition(&self, to: TaskState) {
        if to.is_terminal() {
            self.mark_completion();
        }
        self.state.store(to as u8, Ordering::Release);
    }

    /// Whether the task is in a runnable or parked state.
    pub fn is_active(&self) -> bool {
        matches!(self.state(), TaskState::Running | TaskState::Suspended)
    }

    /// Whether the task reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// When the task was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// How long the task has existed: creation until completion, or until now if still live.
    pub fn lifetime(&self) -> Duration {
        let end = self.completed_at.get().copied().unwrap_or_else(Instant::now);
        end.saturating_duration_since(self.created_at)
    }

    fn mark_completion(&self) {
        _ = self.completed_at.set(Instant::now());
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}
