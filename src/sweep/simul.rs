//! Simultaneous multi-axis sweep: several parameters advanced together.

use super::trajectory::{SweepMode, Trajectory};
use super::{
    builder_common, finish_build, RampTarget, StepContext, StepKind, StepOutcome, Sweep,
    SweepConfig,
};
use crate::error::{Result, SweepError};
use crate::metadata::MetadataRecord;
use crate::parameter::Parameter;
use crate::plot::{PlotAxis, PlotRenderer};
use crate::progress::Direction;
use crate::storage::SaveTarget;

/// Sweep advancing several controlled parameters in lockstep.
///
/// Every trajectory must yield the same number of points; alternatively a
/// shared `n_steps` derives each step size from its endpoints.
///
/// ```rust,ignore
/// let mut sweep = SimulSweep::new()
///     .axis(gate_a, 0.0, 5.0, 0.5)
///     .axis(gate_b, 0.0, 10.0, 1.0)
///     .bidirectional()
///     .build()?;
/// ```
pub struct SimulSweep;

impl SimulSweep {
    pub fn new() -> SimulSweepBuilder {
        SimulSweepBuilder {
            axes: Vec::new(),
            n_steps: None,
            mode: SweepMode::OneShot,
            cfg: SweepConfig::default(),
            save: None,
            renderer: None,
        }
    }
}

pub struct SimulSweepBuilder {
    axes: Vec<(Parameter, f64, f64, f64)>,
    n_steps: Option<u64>,
    mode: SweepMode,
    cfg: SweepConfig,
    save: Option<SaveTarget>,
    renderer: Option<Box<dyn PlotRenderer>>,
}

impl SimulSweepBuilder {
    builder_common!();

    /// Add one controlled axis: parameter, start, stop, step.
    pub fn axis(mut self, parameter: Parameter, start: f64, stop: f64, step: f64) -> Self {
        self.axes.push((parameter, start, stop, step));
        self
    }

    /// Derive every axis's step from a shared number of steps instead of
    /// explicit step sizes.
    pub fn n_steps(mut self, n: u64) -> Self {
        self.n_steps = Some(n);
        self
    }

    pub fn bidirectional(mut self) -> Self {
        self.mode = SweepMode::Bidirectional;
        self
    }

    pub fn continual(mut self) -> Self {
        self.mode = SweepMode::Continual;
        self
    }

    pub fn build(self) -> Result<Sweep> {
        if self.axes.is_empty() {
            return Err(SweepError::config(
                "a simultaneous sweep needs at least one axis",
            ));
        }

        let mut axes = Vec::with_capacity(self.axes.len());
        for (parameter, start, stop, step) in self.axes {
            let step = match self.n_steps {
                Some(n) => {
                    if n == 0 {
                        return Err(SweepError::config("n_steps must be at least 1"));
                    }
                    (stop - start) / n as f64
                }
                None => step,
            };
            let trajectory = Trajectory::new(start, stop, step, self.mode)?;
            axes.push(Axis {
                parameter,
                trajectory,
            });
        }

        let counts: Vec<u64> = axes.iter().map(|a| a.trajectory.count()).collect();
        if counts.windows(2).any(|w| w[0] != w[1]) {
            return Err(SweepError::config(format!(
                "axes have different point counts and cannot be swept together: {counts:?}"
            )));
        }

        let kind = SimulKind {
            count: counts[0],
            axes,
            index: 0,
            direction: 1,
        };
        finish_build(Box::new(kind), self.cfg, self.save, self.renderer)
    }
}

struct Axis {
    parameter: Parameter,
    trajectory: Trajectory,
}

/// Lockstep stepper: a single index drives every axis.
struct SimulKind {
    axes: Vec<Axis>,
    /// Points per pass, identical for every axis.
    count: u64,
    /// Next point index within the current pass.
    index: u64,
    direction: Direction,
}

impl SimulKind {
    /// Setpoint of axis `a` at index `i`: `start + i * step` along the
    /// current pass orientation.
    fn setpoint(&self, axis: &Axis, index: u64) -> f64 {
        axis.trajectory.start + index as f64 * axis.trajectory.step
    }

    fn flip(&mut self) {
        for axis in &mut self.axes {
            axis.trajectory.flip();
        }
        self.direction = -self.direction;
        self.index = 0;
    }

    fn mode(&self) -> SweepMode {
        self.axes[0].trajectory.mode
    }
}

impl StepKind for SimulKind {
    fn kind_name(&self) -> &'static str {
        "SimulSweep"
    }

    fn describe(&self) -> String {
        let names: Vec<String> = self.axes.iter().map(|a| a.parameter.key()).collect();
        format!("simultaneous sweep of [{}]", names.join(", "))
    }

    fn controlled(&self) -> Vec<Parameter> {
        self.axes.iter().map(|a| a.parameter.clone()).collect()
    }

    fn run_step(&mut self, _ctx: &StepContext) -> Result<StepOutcome> {
        if self.index < self.count {
            let index = self.index;
            self.index += 1;
            let mut setpoints = Vec::with_capacity(self.axes.len());
            // Set in declared order before reading anything.
            for axis in &self.axes {
                let value = self.setpoint(axis, index);
                axis.parameter.safe_set(value)?;
                setpoints.push(value);
            }
            return Ok(StepOutcome::Point(setpoints));
        }
        match self.mode() {
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

    fn direction(&self) -> Direction {
        self.direction
    }

    fn supports_flip(&self) -> bool {
        matches!(self.mode(), SweepMode::Bidirectional | SweepMode::Continual)
    }

    fn flip_direction(&mut self) -> Result<()> {
        self.flip();
        Ok(())
    }

    fn total_points(&self) -> Option<u64> {
        match self.mode() {
            SweepMode::OneShot => Some(self.count),
            SweepMode::Bidirectional => Some(2 * self.count),
            SweepMode::Continual => None,
        }
    }

    fn ramp_targets(&self) -> Vec<RampTarget> {
        self.axes
            .iter()
            .map(|a| RampTarget {
                parameter: a.parameter.clone(),
                target: a.trajectory.start,
                step: a.trajectory.step,
            })
            .collect()
    }

    fn reset_cursor(&mut self) {
        if self.direction == -1 {
            for axis in &mut self.axes {
                axis.trajectory.flip();
            }
            self.direction = 1;
        }
        self.index = 0;
    }

    fn estimate_remaining(&self, cadence: f64) -> Option<f64> {
        match self.mode() {
            SweepMode::Continual => None,
            SweepMode::OneShot => Some((self.count - self.index) as f64 * cadence),
            SweepMode::Bidirectional => {
                let extra = if self.direction == 1 { self.count } else { 0 };
                Some((self.count - self.index + extra) as f64 * cadence)
            }
        }
    }

    fn export(&self, mut record: MetadataRecord) -> MetadataRecord {
        record = record
            .attribute(
                "bidirectional",
                self.mode() == SweepMode::Bidirectional,
            )
            .attribute("continual", self.mode() == SweepMode::Continual)
            .attribute("n_steps", self.count.saturating_sub(1));
        for axis in &self.axes {
            // Export the home orientation regardless of flips.
            let mut home = axis.trajectory.clone();
            if self.direction == -1 {
                home.flip();
            }
            record = record.controlled(&axis.parameter, &home);
        }
        record
    }

    fn plot_axis(&self) -> PlotAxis {
        PlotAxis::Time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn settable(name: &str) -> (Parameter, Arc<Mutex<Vec<f64>>>) {
        let sets = Arc::new(Mutex::new(Vec::new()));
        let log = sets.clone();
        let p = Parameter::builder(name, "dac")
            .getter({
                let log = sets.clone();
                move || Ok(log.lock().last().copied().unwrap_or(0.0))
            })
            .setter(move |v| {
                log.lock().push(v);
                Ok(())
            })
            .build();
        (p, sets)
    }

    #[test]
    fn mismatched_counts_fail_construction() {
        let (a, _) = settable("a");
        let (b, _) = settable("b");
        let err = SimulSweep::new()
            .axis(a, 0.0, 5.0, 0.5)
            .axis(b, 0.0, 10.0, 3.0)
            .build()
            .unwrap_err();
        assert!(matches!(err, SweepError::Config(_)));
    }

    #[test]
    fn axes_advance_in_lockstep() {
        let (a, sets_a) = settable("a");
        let (b, sets_b) = settable("b");
        let t_a = Trajectory::new(0.0, 5.0, 0.5, SweepMode::OneShot).unwrap();
        let t_b = Trajectory::new(0.0, 10.0, 1.0, SweepMode::OneShot).unwrap();
        let mut kind = SimulKind {
            count: t_a.count(),
            axes: vec![
                Axis {
                    parameter: a,
                    trajectory: t_a,
                },
                Axis {
                    parameter: b,
                    trajectory: t_b,
                },
            ],
            index: 0,
            direction: 1,
        };

        let ctx = StepContext { elapsed: 0.0 };
        let mut emitted = 0;
        while let StepOutcome::Point(sp) = kind.run_step(&ctx).unwrap() {
            assert_eq!(sp.len(), 2);
            // b advances at twice a's rate: sp[1] == 2 * sp[0] at every index.
            assert!((sp[1] - 2.0 * sp[0]).abs() < 1e-9);
            emitted += 1;
        }
        assert_eq!(emitted, 11);
        assert_eq!(sets_a.lock().len(), 11);
        assert_eq!(sets_b.lock().len(), 11);
        // Setpoints align to start + i*step per axis.
        assert!((sets_a.lock()[3] - 1.5).abs() < 1e-9);
        assert!((sets_b.lock()[3] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn n_steps_derives_matching_steps() {
        let (a, _) = settable("a");
        let (b, _) = settable("b");
        let sweep = SimulSweep::new()
            .axis(a, 0.0, 5.0, 0.0)
            .axis(b, 10.0, 0.0, 0.0)
            .n_steps(10)
            .build()
            .unwrap();
        let controlled = sweep.controlled();
        assert_eq!(controlled.len(), 2);
    }

    #[test]
    fn flip_reverses_every_axis_together() {
        let (a, _) = settable("a");
        let (b, _) = settable("b");
        let t_a = Trajectory::new(0.0, 1.0, 0.5, SweepMode::Bidirectional).unwrap();
        let t_b = Trajectory::new(0.0, 2.0, 1.0, SweepMode::Bidirectional).unwrap();
        let mut kind = SimulKind {
            count: t_a.count(),
            axes: vec![
                Axis {
                    parameter: a,
                    trajectory: t_a,
                },
                Axis {
                    parameter: b,
                    trajectory: t_b,
                },
            ],
            index: 0,
            direction: 1,
        };
        kind.flip();
        assert_eq!(kind.direction(), -1);
        assert_eq!(kind.axes[0].trajectory.start, 1.0);
        assert_eq!(kind.axes[0].trajectory.step, -0.5);
        assert_eq!(kind.axes[1].trajectory.start, 2.0);
        assert_eq!(kind.axes[1].trajectory.step, -1.0);
    }
}
