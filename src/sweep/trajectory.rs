//! Setpoint trajectories: how a controlled parameter evolves.

use crate::error::{Result, SweepError};
use serde::{Deserialize, Serialize};

/// What happens when a trajectory reaches its stop value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SweepMode {
    /// Run start → stop once, then finish.
    #[default]
    OneShot,
    /// Run start → stop, flip, run back, then finish.
    Bidirectional,
    /// Flip at every end and keep running until stopped.
    Continual,
}

/// A `(start, stop, step)` trajectory with an end-of-pass mode.
///
/// The step sign is normalized at construction so that stepping always
/// moves from `start` toward `stop`; [`Trajectory::flip`] re-normalizes
/// after swapping the endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
    pub mode: SweepMode,
}

impl Trajectory {
    /// Build a trajectory, normalizing the step direction.
    ///
    /// Fails with a configuration error when `step` is zero or not finite.
    pub fn new(start: f64, stop: f64, step: f64, mode: SweepMode) -> Result<Self> {
        if step == 0.0 || !step.is_finite() {
            return Err(SweepError::config(format!(
                "trajectory step must be a non-zero finite value, got {step}"
            )));
        }
        if !start.is_finite() || !stop.is_finite() {
            return Err(SweepError::config(format!(
                "trajectory endpoints must be finite, got start={start}, stop={stop}"
            )));
        }
        let step = if stop >= start { step.abs() } else { -step.abs() };
        Ok(Self {
            start,
            stop,
            step,
            mode,
        })
    }

    /// Number of points in one pass: `floor(|stop-start|/|step|) + 1`.
    pub fn count(&self) -> u64 {
        ((self.stop - self.start).abs() / self.step.abs()).floor() as u64 + 1
    }

    /// Swap the endpoints and negate the step.
    pub fn flip(&mut self) {
        std::mem::swap(&mut self.start, &mut self.stop);
        self.step = -self.step;
    }

    /// Whether `setpoint` still has room to advance toward `stop`.
    ///
    /// Uses a half-step window widened by a relative epsilon so that
    /// accumulated float error at the final point does not produce an
    /// extra step.
    pub fn has_next(&self, setpoint: f64) -> bool {
        (setpoint - self.stop).abs() - self.step.abs() / 2.0 > self.step.abs() * 1e-4
    }

    /// The cursor value that yields `start` on the first advance.
    pub fn rewind(&self) -> f64 {
        self.start - self.step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_sign_is_normalized() {
        let up = Trajectory::new(0.0, 1.0, -0.1, SweepMode::OneShot).unwrap();
        assert_eq!(up.step, 0.1);
        let down = Trajectory::new(1.0, 0.0, 0.1, SweepMode::OneShot).unwrap();
        assert_eq!(down.step, -0.1);
    }

    #[test]
    fn zero_step_is_a_config_error() {
        let err = Trajectory::new(0.0, 1.0, 0.0, SweepMode::OneShot).unwrap_err();
        assert!(matches!(err, SweepError::Config(_)));
    }

    #[test]
    fn count_includes_both_endpoints() {
        let t = Trajectory::new(0.0, 1.0, 0.1, SweepMode::OneShot).unwrap();
        assert_eq!(t.count(), 11);
        let t = Trajectory::new(0.0, 5.0, 0.5, SweepMode::OneShot).unwrap();
        assert_eq!(t.count(), 11);
        let single = Trajectory::new(2.0, 2.0, 0.5, SweepMode::OneShot).unwrap();
        assert_eq!(single.count(), 1);
    }

    #[test]
    fn flip_swaps_endpoints_and_negates_step() {
        let mut t = Trajectory::new(0.0, 1.0, 0.1, SweepMode::Bidirectional).unwrap();
        t.flip();
        assert_eq!(t.start, 1.0);
        assert_eq!(t.stop, 0.0);
        assert_eq!(t.step, -0.1);
    }

    #[test]
    fn has_next_is_robust_at_the_float_boundary() {
        let t = Trajectory::new(0.0, 1.0, 0.1, SweepMode::OneShot).unwrap();
        // Walk the cursor the way the sweep does; exactly 11 advances.
        let mut setpoint = t.rewind();
        let mut n = 0;
        while t.has_next(setpoint) {
            setpoint += t.step;
            n += 1;
            assert!(n <= 11, "walked past the end of the trajectory");
        }
        assert_eq!(n, 11);
        assert!((setpoint - 1.0).abs() < 1e-9);
    }
}
