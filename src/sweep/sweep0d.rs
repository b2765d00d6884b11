//! Time-only sweep: follow parameters sampled against elapsed time.

use super::{
    builder_common, finish_build, StepContext, StepKind, StepOutcome, Sweep, SweepConfig,
};
use crate::error::Result;
use crate::metadata::MetadataRecord;
use crate::parameter::Parameter;
use crate::plot::{PlotAxis, PlotRenderer};
use crate::storage::SaveTarget;

/// Sweep with no controlled parameter; runs until `max_time` elapses or it
/// is stopped.
///
/// ```rust,ignore
/// let mut monitor = Sweep0D::new().max_time(600.0).inter_delay(1.0).build()?;
/// monitor.follow_param([fridge_temperature])?;
/// monitor.start()?;
/// ```
pub struct Sweep0D;

impl Sweep0D {
    pub fn new() -> Sweep0DBuilder {
        Sweep0DBuilder {
            max_time: None,
            cfg: SweepConfig::default(),
            save: None,
            renderer: None,
        }
    }
}

pub struct Sweep0DBuilder {
    max_time: Option<f64>,
    cfg: SweepConfig,
    save: Option<SaveTarget>,
    renderer: Option<Box<dyn PlotRenderer>>,
}

impl Sweep0DBuilder {
    builder_common!();

    /// Cutoff time in seconds; without one the sweep runs until stopped.
    pub fn max_time(mut self, seconds: f64) -> Self {
        self.max_time = Some(seconds);
        self
    }

    pub fn build(self) -> Result<Sweep> {
        if let Some(t) = self.max_time {
            if !(t.is_finite() && t > 0.0) {
                return Err(crate::error::SweepError::config(format!(
                    "max_time must be a positive finite number of seconds, got {t}"
                )));
            }
        }
        let kind = TimeKind {
            max_time: self.max_time,
        };
        finish_build(Box::new(kind), self.cfg, self.save, self.renderer)
    }
}

struct TimeKind {
    max_time: Option<f64>,
}

impl StepKind for TimeKind {
    fn kind_name(&self) -> &'static str {
        "Sweep0D"
    }

    fn describe(&self) -> String {
        match self.max_time {
            Some(t) => format!("0D sweep for {t} s"),
            None => "continuous 0D sweep".to_string(),
        }
    }

    fn controlled(&self) -> Vec<Parameter> {
        Vec::new()
    }

    fn run_step(&mut self, ctx: &StepContext) -> Result<StepOutcome> {
        if let Some(max_time) = self.max_time {
            if ctx.elapsed >= max_time {
                return Ok(StepOutcome::Finished);
            }
        }
        Ok(StepOutcome::Point(Vec::new()))
    }

    fn reset_cursor(&mut self) {}

    fn estimate_remaining(&self, _cadence: f64) -> Option<f64> {
        self.max_time
    }

    fn export(&self, record: MetadataRecord) -> MetadataRecord {
        match self.max_time {
            Some(t) => record.attribute("max_time", t),
            None => record.attribute("max_time", serde_json::Value::Null),
        }
    }

    fn plot_axis(&self) -> PlotAxis {
        PlotAxis::Time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finishes_once_elapsed_exceeds_max_time() {
        let mut kind = TimeKind {
            max_time: Some(5.0),
        };
        assert!(matches!(
            kind.run_step(&StepContext { elapsed: 1.0 }).unwrap(),
            StepOutcome::Point(_)
        ));
        assert!(matches!(
            kind.run_step(&StepContext { elapsed: 5.0 }).unwrap(),
            StepOutcome::Finished
        ));
    }

    #[test]
    fn continuous_mode_never_finishes_on_its_own() {
        let mut kind = TimeKind { max_time: None };
        for hour in 0..24 {
            assert!(matches!(
                kind.run_step(&StepContext {
                    elapsed: hour as f64 * 3600.0
                })
                .unwrap(),
                StepOutcome::Point(_)
            ));
        }
    }

    #[test]
    fn rejects_non_positive_max_time() {
        assert!(Sweep0D::new().max_time(0.0).build().is_err());
        assert!(Sweep0D::new().max_time(-5.0).build().is_err());
    }
}
