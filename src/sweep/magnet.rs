//! Magnet-coupled sweep: the instrument manages its own ramp.
//!
//! Superconducting magnet supplies ramp the field themselves; issuing
//! intermediate setpoints would fight the supply's controller. This sweep
//! hands the target to the instrument once, then samples the field at the
//! cadence until the instrument reports that it holds at the setpoint.

use super::{
    builder_common, finish_build, StepContext, StepKind, StepOutcome, Sweep, SweepConfig,
};
use crate::error::{Result, SweepError};
use crate::metadata::MetadataRecord;
use crate::parameter::Parameter;
use crate::plot::{PlotAxis, PlotRenderer};
use crate::storage::SaveTarget;
use crate::sweep::trajectory::{SweepMode, Trajectory};
use std::sync::Arc;

/// An instrument that owns its ramp: told the target once, polled for
/// arrival.
pub trait RampingInstrument: Send + Sync {
    /// Begin ramping toward `target`. Must not block until arrival.
    fn begin_ramp(&self, target: f64) -> std::result::Result<(), String>;
    /// Whether the instrument holds at its setpoint.
    fn at_setpoint(&self) -> std::result::Result<bool, String>;
}

/// Field sweep delegated to a self-ramping magnet supply.
///
/// ```rust,ignore
/// let mut sweep = MagnetSweep::new(field, magnet, 2.0)
///     .inter_delay(0.5)
///     .build()?;
/// sweep.follow_param([hall_voltage])?;
/// sweep.start()?;
/// ```
pub struct MagnetSweep;

impl MagnetSweep {
    /// Sweep `field` to `target` tesla via `instrument`.
    pub fn new(
        field: Parameter,
        instrument: Arc<dyn RampingInstrument>,
        target: f64,
    ) -> MagnetSweepBuilder {
        MagnetSweepBuilder {
            field,
            instrument,
            target,
            cfg: SweepConfig::default(),
            save: None,
            renderer: None,
        }
    }
}

pub struct MagnetSweepBuilder {
    field: Parameter,
    instrument: Arc<dyn RampingInstrument>,
    target: f64,
    cfg: SweepConfig,
    save: Option<SaveTarget>,
    renderer: Option<Box<dyn PlotRenderer>>,
}

impl MagnetSweepBuilder {
    builder_common!();

    pub fn build(self) -> Result<Sweep> {
        if !self.target.is_finite() {
            return Err(SweepError::config(format!(
                "magnet target must be finite, got {}",
                self.target
            )));
        }
        let kind = MagnetKind {
            field: self.field,
            instrument: self.instrument,
            target: self.target,
            initialized: false,
            arrived: false,
        };
        finish_build(Box::new(kind), self.cfg, self.save, self.renderer)
    }
}

struct MagnetKind {
    field: Parameter,
    instrument: Arc<dyn RampingInstrument>,
    target: f64,
    initialized: bool,
    /// The instrument reported at-setpoint; the point carrying the final
    /// field value has been emitted.
    arrived: bool,
}

impl MagnetKind {
    fn instrument_err(&self, cause: String) -> SweepError {
        crate::error::ParameterError {
            kind: crate::error::ParameterErrorKind::Set,
            parameter: self.field.key(),
            value: Some(self.target),
            cause,
        }
        .into()
    }
}

impl StepKind for MagnetKind {
    fn kind_name(&self) -> &'static str {
        "MagnetSweep"
    }

    fn describe(&self) -> String {
        format!("magnet sweep of {} to {}", self.field.key(), self.target)
    }

    fn controlled(&self) -> Vec<Parameter> {
        vec![self.field.clone()]
    }

    fn run_step(&mut self, _ctx: &StepContext) -> Result<StepOutcome> {
        if self.arrived {
            return Ok(StepOutcome::Finished);
        }
        if !self.initialized {
            self.instrument
                .begin_ramp(self.target)
                .map_err(|e| self.instrument_err(e))?;
            self.initialized = true;
            log::info!("{}: ramp started", self.describe());
        }

        // The field reading is the setpoint: the magnet decides the pace.
        let value = self.field.safe_get()?;
        if self
            .instrument
            .at_setpoint()
            .map_err(|e| self.instrument_err(e))?
        {
            // Emit the final field value; the next call finishes.
            self.arrived = true;
        }
        Ok(StepOutcome::Point(vec![value]))
    }

    fn reset_cursor(&mut self) {
        self.initialized = false;
        self.arrived = false;
    }

    fn export(&self, record: MetadataRecord) -> MetadataRecord {
        let trajectory = Trajectory {
            start: 0.0,
            stop: self.target,
            step: self.target,
            mode: SweepMode::OneShot,
        };
        record
            .attribute("magnet_target", self.target)
            .controlled(&self.field, &trajectory)
    }

    fn plot_axis(&self) -> PlotAxis {
        PlotAxis::Setpoint
    }
}
