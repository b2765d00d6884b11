//! Listening sweep: the controlled parameter is driven externally.
//!
//! The sweep never issues a set. It samples the parameter at the cadence
//! and emits a point whenever the observed value has moved by at least the
//! step threshold since the last emitted point. Completion is external:
//! the sweep runs until stopped.

use super::{
    builder_common, finish_build, StepContext, StepKind, StepOutcome, Sweep, SweepConfig,
};
use crate::error::{Result, SweepError};
use crate::metadata::MetadataRecord;
use crate::parameter::Parameter;
use crate::plot::{PlotAxis, PlotRenderer};
use crate::progress::Direction;
use crate::storage::SaveTarget;

/// Sweep that samples an externally driven parameter on change.
///
/// ```rust,ignore
/// let mut sweep = ListeningSweep::new(source_voltage, 0.01)
///     .inter_delay(0.05)
///     .build()?;
/// sweep.follow_param([drain_current])?;
/// sweep.start()?;   // runs until stop()
/// ```
pub struct ListeningSweep;

impl ListeningSweep {
    /// Listen to `parameter`, emitting when it moves by at least `step`.
    pub fn new(parameter: Parameter, step: f64) -> ListeningSweepBuilder {
        ListeningSweepBuilder {
            parameter,
            step,
            cfg: SweepConfig::default(),
            save: None,
            renderer: None,
        }
    }
}

pub struct ListeningSweepBuilder {
    parameter: Parameter,
    step: f64,
    cfg: SweepConfig,
    save: Option<SaveTarget>,
    renderer: Option<Box<dyn PlotRenderer>>,
}

impl ListeningSweepBuilder {
    builder_common!();

    pub fn build(self) -> Result<Sweep> {
        if self.step <= 0.0 || !self.step.is_finite() {
            return Err(SweepError::config(format!(
                "listening threshold must be a positive finite step, got {}",
                self.step
            )));
        }
        let kind = ListeningKind {
            parameter: self.parameter,
            step: self.step,
            last_emitted: None,
            direction: 1,
        };
        finish_build(Box::new(kind), self.cfg, self.save, self.renderer)
    }
}

struct ListeningKind {
    parameter: Parameter,
    /// Emission threshold: minimum movement since the last emitted value.
    step: f64,
    last_emitted: Option<f64>,
    direction: Direction,
}

impl StepKind for ListeningKind {
    fn kind_name(&self) -> &'static str {
        "ListeningSweep"
    }

    fn describe(&self) -> String {
        format!(
            "listening sweep of {} (threshold {})",
            self.parameter.key(),
            self.step
        )
    }

    fn controlled(&self) -> Vec<Parameter> {
        vec![self.parameter.clone()]
    }

    fn run_step(&mut self, _ctx: &StepContext) -> Result<StepOutcome> {
        let value = self.parameter.safe_get()?;
        let emit = match self.last_emitted {
            // At most one point per cadence tick: repeated motion inside
            // one tick collapses into a single emission.
            Some(last) => (value - last).abs() >= self.step,
            None => true,
        };
        if emit {
            self.last_emitted = Some(value);
            Ok(StepOutcome::Point(vec![value]))
        } else {
            Ok(StepOutcome::Idle)
        }
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    /// Flips only re-segment the emitted stream; the external source owns
    /// the actual motion.
    fn supports_flip(&self) -> bool {
        true
    }

    fn flip_direction(&mut self) -> Result<()> {
        self.direction = -self.direction;
        Ok(())
    }

    fn set_step(&mut self, step: f64) -> Result<()> {
        if step <= 0.0 || !step.is_finite() {
            return Err(SweepError::config(
                "listening threshold must be positive and finite",
            ));
        }
        self.step = step;
        Ok(())
    }

    fn reset_cursor(&mut self) {
        self.last_emitted = None;
        self.direction = 1;
    }

    fn export(&self, record: MetadataRecord) -> MetadataRecord {
        record
            .attribute("listening", true)
            .attribute("step", self.step)
            .controlled(
                &self.parameter,
                // The trajectory is external; record the threshold as the
                // step with equal endpoints.
                &crate::sweep::trajectory::Trajectory {
                    start: 0.0,
                    stop: 0.0,
                    step: self.step,
                    mode: crate::sweep::trajectory::SweepMode::Continual,
                },
            )
    }

    fn plot_axis(&self) -> PlotAxis {
        PlotAxis::Setpoint
    }
}
