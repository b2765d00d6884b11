//! One-axis sweep: a single controlled parameter stepped along a
//! trajectory.

use super::trajectory::{SweepMode, Trajectory};
use super::{
    builder_common, finish_build, PostAction, RampTarget, StepContext, StepKind, StepOutcome,
    Sweep, SweepConfig,
};
use crate::error::Result;
use crate::metadata::MetadataRecord;
use crate::parameter::Parameter;
use crate::plot::{PlotAxis, PlotRenderer};
use crate::progress::Direction;
use crate::storage::SaveTarget;

/// One-axis sweep of a settable parameter.
///
/// ```rust,ignore
/// let mut sweep = Sweep1D::new(gate, 0.0, 1.0, 0.05)
///     .bidirectional()
///     .inter_delay(0.05)
///     .save_to(SaveTarget::new("transport", "cooldown_3", "sample_a"))
///     .build()?;
/// sweep.follow_param([drain_current])?;
/// sweep.start()?;
/// ```
pub struct Sweep1D;

impl Sweep1D {
    pub fn new(parameter: Parameter, start: f64, stop: f64, step: f64) -> Sweep1DBuilder {
        Sweep1DBuilder {
            parameter,
            start,
            stop,
            step,
            mode: SweepMode::OneShot,
            cfg: SweepConfig::default(),
            save: None,
            renderer: None,
        }
    }
}

pub struct Sweep1DBuilder {
    parameter: Parameter,
    start: f64,
    stop: f64,
    step: f64,
    mode: SweepMode,
    cfg: SweepConfig,
    save: Option<SaveTarget>,
    renderer: Option<Box<dyn PlotRenderer>>,
}

impl Sweep1DBuilder {
    builder_common!();

    /// Run back to the start after reaching the stop value.
    pub fn bidirectional(mut self) -> Self {
        self.mode = SweepMode::Bidirectional;
        self
    }

    /// Keep sweeping back and forth until stopped.
    pub fn continual(mut self) -> Self {
        self.mode = SweepMode::Continual;
        self
    }

    /// Scale the step on return passes (fewer samples on the non-data
    /// direction).
    pub fn back_multiplier(mut self, multiplier: f64) -> Self {
        self.cfg.back_multiplier = multiplier;
        self
    }

    pub fn build(self) -> Result<Sweep> {
        let trajectory = Trajectory::new(self.start, self.stop, self.step, self.mode)?;
        let kind = OneAxisKind::new(self.parameter, trajectory, self.cfg.back_multiplier);
        finish_build(Box::new(kind), self.cfg, self.save, self.renderer)
    }
}

/// Step-kind state machine for one controlled parameter.
pub(crate) struct OneAxisKind {
    parameter: Parameter,
    trajectory: Trajectory,
    /// Trajectory as constructed; flips mutate `trajectory`, exports and
    /// resets use this.
    home: Trajectory,
    setpoint: f64,
    direction: Direction,
    back_multiplier: f64,
}

impl OneAxisKind {
    pub(crate) fn new(
        parameter: Parameter,
        trajectory: Trajectory,
        back_multiplier: f64,
    ) -> Self {
        let setpoint = trajectory.rewind();
        Self {
            parameter,
            home: trajectory.clone(),
            trajectory,
            setpoint,
            direction: 1,
            back_multiplier,
        }
    }

    pub(crate) fn flip(&mut self) {
        self.trajectory.flip();
        if self.direction == 1 {
            self.direction = -1;
            self.trajectory.step *= self.back_multiplier;
        } else {
            self.direction = 1;
            self.trajectory.step /= self.back_multiplier;
        }
        self.setpoint = self.trajectory.rewind();
    }

    pub(crate) fn setpoint(&self) -> f64 {
        self.setpoint
    }
}

impl StepKind for OneAxisKind {
    fn kind_name(&self) -> &'static str {
        "Sweep1D"
    }

    fn describe(&self) -> String {
        format!(
            "1D sweep of {} from {} to {} (step {})",
            self.parameter.key(),
            self.home.start,
            self.home.stop,
            self.home.step
        )
    }

    fn controlled(&self) -> Vec<Parameter> {
        vec![self.parameter.clone()]
    }

    fn run_step(&mut self, _ctx: &StepContext) -> Result<StepOutcome> {
        if self.trajectory.has_next(self.setpoint) {
            self.setpoint += self.trajectory.step;
            self.parameter.safe_set(self.setpoint)?;
            return Ok(StepOutcome::Point(vec![self.setpoint]));
        }
        match self.trajectory.mode {
            SweepMode::Continual => {
                self.flip();
                Ok(StepOutcome::Break)
            }
            SweepMode::Bidirectional if self.direction == 1 => {
                self.flip();
                Ok(StepOutcome::Break)
            }
            _ => Ok(StepOutcome::Finished),
        }
    }

    fn after_read(&mut self, _follows: &[(Parameter, f64)]) -> Result<PostAction> {
        Ok(PostAction::Continue)
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn supports_flip(&self) -> bool {
        matches!(
            self.trajectory.mode,
            SweepMode::Bidirectional | SweepMode::Continual
        )
    }

    fn flip_direction(&mut self) -> Result<()> {
        self.flip();
        Ok(())
    }

    fn set_step(&mut self, step: f64) -> Result<()> {
        if step == 0.0 || !step.is_finite() {
            return Err(crate::error::SweepError::config(
                "step must be a non-zero finite value",
            ));
        }
        self.trajectory.step = step.abs().copysign(self.trajectory.step);
        Ok(())
    }

    fn total_points(&self) -> Option<u64> {
        match self.trajectory.mode {
            SweepMode::OneShot => Some(self.home.count()),
            SweepMode::Bidirectional => Some(2 * self.home.count()),
            SweepMode::Continual => None,
        }
    }

    fn ramp_targets(&self) -> Vec<RampTarget> {
        vec![RampTarget {
            parameter: self.parameter.clone(),
            target: self.trajectory.start,
            step: self.trajectory.step,
        }]
    }

    fn reset_cursor(&mut self) {
        self.trajectory = self.home.clone();
        self.setpoint = self.trajectory.rewind();
        self.direction = 1;
    }

    fn estimate_remaining(&self, cadence: f64) -> Option<f64> {
        let pass_remaining =
            ((self.trajectory.stop - self.setpoint).abs() / self.trajectory.step.abs()).ceil();
        let extra = match self.trajectory.mode {
            SweepMode::Bidirectional if self.direction == 1 => self.home.count() as f64,
            SweepMode::Continual => return None,
            _ => 0.0,
        };
        Some((pass_remaining + extra) * cadence)
    }

    fn export(&self, record: MetadataRecord) -> MetadataRecord {
        record
            .attribute(
                "bidirectional",
                self.home.mode == SweepMode::Bidirectional,
            )
            .attribute("continual", self.home.mode == SweepMode::Continual)
            .attribute("back_multiplier", self.back_multiplier)
            .controlled(&self.parameter, &self.home)
    }

    fn plot_axis(&self) -> PlotAxis {
        PlotAxis::Setpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SweepError;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn settable(name: &str) -> (Parameter, Arc<Mutex<f64>>) {
        let store = Arc::new(Mutex::new(0.0));
        let read = store.clone();
        let write = store.clone();
        let p = Parameter::builder(name, "dac")
            .unit("V")
            .getter(move || Ok(*read.lock()))
            .setter(move |v| {
                *write.lock() = v;
                Ok(())
            })
            .build();
        (p, store)
    }

    fn ctx() -> StepContext {
        StepContext { elapsed: 0.0 }
    }

    #[test]
    fn one_shot_walks_the_trajectory_once() {
        let (p, store) = settable("v");
        let traj = Trajectory::new(0.0, 1.0, 0.1, SweepMode::OneShot).unwrap();
        let mut kind = OneAxisKind::new(p, traj, 1.0);

        let mut points = Vec::new();
        loop {
            match kind.run_step(&ctx()).unwrap() {
                StepOutcome::Point(sp) => points.push(sp[0]),
                StepOutcome::Finished => break,
                _ => panic!("unexpected outcome"),
            }
        }
        assert_eq!(points.len(), 11);
        assert!((points[0] - 0.0).abs() < 1e-9);
        assert!((points[10] - 1.0).abs() < 1e-9);
        assert!((*store.lock() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn bidirectional_flips_once_with_a_break() {
        let (p, _) = settable("v");
        let traj = Trajectory::new(0.0, 0.4, 0.2, SweepMode::Bidirectional).unwrap();
        let mut kind = OneAxisKind::new(p, traj, 1.0);

        let mut forward = Vec::new();
        let mut backward = Vec::new();
        let mut breaks = 0;
        loop {
            match kind.run_step(&ctx()).unwrap() {
                StepOutcome::Point(sp) => {
                    if kind.direction() == 1 {
                        forward.push(sp[0]);
                    } else {
                        backward.push(sp[0]);
                    }
                }
                StepOutcome::Break => breaks += 1,
                StepOutcome::Finished => break,
                _ => panic!("unexpected outcome"),
            }
        }
        assert_eq!(breaks, 1);
        assert_eq!(forward.len(), 3);
        assert_eq!(backward.len(), 3);
        // Strictly monotone within each pass, alternating direction.
        assert!(forward.windows(2).all(|w| w[1] > w[0]));
        assert!(backward.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn back_multiplier_widens_the_return_step() {
        let (p, _) = settable("v");
        let traj = Trajectory::new(0.0, 1.0, 0.25, SweepMode::Bidirectional).unwrap();
        let mut kind = OneAxisKind::new(p, traj, 2.0);
        kind.flip();
        assert_eq!(kind.trajectory.step, -0.5);
        kind.flip();
        assert_eq!(kind.trajectory.step, 0.25);
    }

    #[test]
    fn set_step_preserves_direction() {
        let (p, _) = settable("v");
        let traj = Trajectory::new(1.0, 0.0, 0.1, SweepMode::OneShot).unwrap();
        let mut kind = OneAxisKind::new(p, traj, 1.0);
        kind.set_step(0.25).unwrap();
        assert_eq!(kind.trajectory.step, -0.25);
        assert!(matches!(
            kind.set_step(0.0),
            Err(SweepError::Config(_))
        ));
    }

    #[test]
    fn builder_rejects_tiny_inter_delay() {
        let (p, _) = settable("v");
        let err = Sweep1D::new(p, 0.0, 1.0, 0.1)
            .inter_delay(0.009)
            .build()
            .unwrap_err();
        assert!(matches!(err, SweepError::Config(_)));
    }

    #[test]
    fn builder_rejects_zero_step() {
        let (p, _) = settable("v");
        let err = Sweep1D::new(p, 0.0, 1.0, 0.0).build().unwrap_err();
        assert!(matches!(err, SweepError::Config(_)));
    }

    #[test]
    fn reset_cursor_restores_the_home_trajectory() {
        let (p, _) = settable("v");
        let traj = Trajectory::new(0.0, 1.0, 0.5, SweepMode::Bidirectional).unwrap();
        let mut kind = OneAxisKind::new(p, traj, 1.0);
        kind.flip();
        kind.reset_cursor();
        assert_eq!(kind.trajectory.start, 0.0);
        assert_eq!(kind.trajectory.step, 0.5);
        assert_eq!(kind.direction(), 1);
    }
}
