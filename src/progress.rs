//! Sweep lifecycle state and shared progress tracking.
//!
//! The acquisition worker writes progress; supervisors (user thread, queue,
//! plot sink) read it. The `(state, error_message, error_count)` triple is
//! always updated inside one critical section so a reader can never observe
//! an Error state without its message.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle state of a sweep.
///
/// ```text
/// Ready ──start──▶ RampingToStart ──ok──▶ Running ──end──▶ Done
///                        │                  │
///                        │                  ├─stop──▶ Stopping ──▶ Done
///                        │                  ├─kill──▶ Killed
///                        └─error──▶ Error ◀─┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepState {
    /// Constructed, or reset; the only state from which `start` is legal.
    Ready,
    /// Ramping controlled parameters to their trajectory start values.
    RampingToStart,
    /// The acquisition worker is emitting points.
    Running,
    /// Paused by `stop()`/`pause()`; resumable.
    Paused,
    /// Graceful drain in progress; the in-flight point completes.
    Stopping,
    /// Finished normally.
    Done,
    /// Terminal until `clear_error`.
    Error,
    /// Terminal until `reset`.
    Killed,
}

impl SweepState {
    /// True for states holding an acquisition worker.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SweepState::RampingToStart | SweepState::Running | SweepState::Stopping
        )
    }

    /// True once the sweep can never emit again without an explicit reset.
    pub fn is_terminal(self) -> bool {
        matches!(self, SweepState::Done | SweepState::Error | SweepState::Killed)
    }

    pub fn can_start(self) -> bool {
        self == SweepState::Ready
    }

    pub fn can_resume(self) -> bool {
        self == SweepState::Paused
    }
}

impl fmt::Display for SweepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SweepState::Ready => "ready",
            SweepState::RampingToStart => "ramping_to_start",
            SweepState::Running => "running",
            SweepState::Paused => "paused",
            SweepState::Stopping => "stopping",
            SweepState::Done => "done",
            SweepState::Error => "error",
            SweepState::Killed => "killed",
        };
        write!(f, "{s}")
    }
}

/// Sweep direction: +1 forward, -1 after a flip.
pub type Direction = i8;

/// Snapshot of a sweep's execution progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressState {
    pub state: SweepState,
    /// Points emitted since the last (re)start.
    pub points_emitted: u64,
    /// Total expected points, when the trajectory is finite.
    pub total_points: Option<u64>,
    /// Most recent setpoint per controlled parameter, in declared order.
    pub current_setpoints: Vec<f64>,
    pub direction: Direction,
    /// First error message; retained across later `mark_error` calls.
    pub error_message: Option<String>,
    /// How many errors have been reported.
    pub error_count: u32,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            state: SweepState::Ready,
            points_emitted: 0,
            total_points: None,
            current_setpoints: Vec::new(),
            direction: 1,
            error_message: None,
            error_count: 0,
        }
    }
}

/// Thread-shared progress: one mutex, one condvar for terminal waits.
#[derive(Clone, Default)]
pub struct SharedProgress {
    inner: Arc<ProgressSync>,
}

#[derive(Default)]
struct ProgressSync {
    state: Mutex<ProgressState>,
    changed: Condvar,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current progress.
    pub fn snapshot(&self) -> ProgressState {
        self.inner.state.lock().clone()
    }

    pub fn state(&self) -> SweepState {
        self.inner.state.lock().state
    }

    /// Apply `f` under the lock and wake any terminal-state waiters.
    pub fn update<R>(&self, f: impl FnOnce(&mut ProgressState) -> R) -> R {
        let mut guard = self.inner.state.lock();
        let out = f(&mut guard);
        self.inner.changed.notify_all();
        out
    }

    /// Transition to `state` unconditionally (callers gate legality).
    pub fn set_state(&self, state: SweepState) {
        self.update(|p| p.state = state);
    }

    /// Record an error and transition to [`SweepState::Error`].
    ///
    /// Idempotent with respect to the message: only the first message is
    /// retained. Every call bumps the error count. The triple is written in
    /// one critical section.
    pub fn mark_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|p| {
            p.error_count += 1;
            if p.error_message.is_none() {
                p.error_message = Some(message);
            }
            p.state = SweepState::Error;
        });
    }

    /// Reset the error triple back to a runnable state. The only legal way
    /// to re-run after Error.
    pub fn clear_error(&self) {
        self.update(|p| {
            p.state = SweepState::Ready;
            p.error_message = None;
            p.error_count = 0;
        });
    }

    /// Block until the sweep reaches a terminal state, or `timeout`
    /// elapses. Returns the final snapshot on success.
    pub fn wait_terminal(&self, timeout: Duration) -> Option<ProgressState> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.state.lock();
        while !guard.state.is_terminal() {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if self
                .inner
                .changed
                .wait_for(&mut guard, remaining)
                .timed_out()
                && !guard.state.is_terminal()
            {
                return None;
            }
        }
        Some(guard.clone())
    }
}
