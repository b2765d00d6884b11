//! Leakage-limited sweep: a one-axis sweep with a compliance predicate.
//!
//! After every follow-set read the tracked current is compared against the
//! compliance limit. Two consecutive over-limit samples trip a direction
//! flip; after `max_flips` trips the sweep finishes. Either end of the
//! voltage range also trips a flip, so the sweep walks out and back
//! regardless of which bound it hits first.

use super::sweep1d::OneAxisKind;
use super::trajectory::{SweepMode, Trajectory};
use super::{
    builder_common, finish_build, PostAction, RampTarget, StepContext, StepKind, StepOutcome,
    Sweep, SweepConfig,
};
use crate::error::{Result, SweepError};
use crate::metadata::MetadataRecord;
use crate::parameter::Parameter;
use crate::plot::{PlotAxis, PlotRenderer};
use crate::progress::Direction;
use crate::storage::SaveTarget;

/// Margin on the compliance limit; readings inside it do not count as
/// trips.
const TRIP_MARGIN: f64 = 1.0001;
/// Consecutive over-limit samples required before flipping.
const TRIP_SAMPLES: u32 = 2;

/// Gate-leakage sweep: voltage out and back while watching a current.
///
/// ```rust,ignore
/// let mut sweep = GateLeakage::new(gate_voltage, leak_current, 1e-9, 0.01)
///     .limit(2.0)
///     .build()?;
/// sweep.start()?;
/// ```
pub struct GateLeakage;

impl GateLeakage {
    /// Sweep `parameter` while watching `track` against `max_current`.
    pub fn new(
        parameter: Parameter,
        track: Parameter,
        max_current: f64,
        step: f64,
    ) -> GateLeakageBuilder {
        GateLeakageBuilder {
            parameter,
            track,
            max_current,
            step,
            start: 0.0,
            limit: f64::MAX,
            max_flips: 2,
            cfg: SweepConfig::default(),
            save: None,
            renderer: None,
        }
    }
}

pub struct GateLeakageBuilder {
    parameter: Parameter,
    track: Parameter,
    max_current: f64,
    step: f64,
    start: f64,
    limit: f64,
    max_flips: u32,
    cfg: SweepConfig,
    save: Option<SaveTarget>,
    renderer: Option<Box<dyn PlotRenderer>>,
}

impl GateLeakageBuilder {
    builder_common!();

    /// Starting voltage. Defaults to zero.
    pub fn start_at(mut self, start: f64) -> Self {
        self.start = start;
        self
    }

    /// Hard bound on the voltage range; the sweep flips when it is
    /// reached. Effectively unbounded by default.
    pub fn limit(mut self, limit: f64) -> Self {
        self.limit = limit;
        self
    }

    /// Trips before the sweep finishes. Defaults to 2 (out and back).
    pub fn max_flips(mut self, flips: u32) -> Self {
        self.max_flips = flips;
        self
    }

    pub fn build(self) -> Result<Sweep> {
        if self.max_current <= 0.0 || !self.max_current.is_finite() {
            return Err(SweepError::config(format!(
                "compliance limit must be positive and finite, got {}",
                self.max_current
            )));
        }
        if self.max_flips == 0 {
            return Err(SweepError::config("max_flips must be at least 1"));
        }
        let trajectory = Trajectory::new(self.start, self.limit, self.step, SweepMode::OneShot)?;
        // The track parameter rides along in the follow set.
        let track = self.track.clone();
        let kind = LeakageKind {
            inner: OneAxisKind::new(self.parameter, trajectory, self.cfg.back_multiplier),
            track: self.track,
            max_current: self.max_current,
            max_flips: self.max_flips,
            flips: 0,
            trip_count: 0,
        };
        let mut sweep = finish_build(Box::new(kind), self.cfg, self.save, self.renderer)?;
        sweep.follow_param([track])?;
        Ok(sweep)
    }
}

struct LeakageKind {
    inner: OneAxisKind,
    track: Parameter,
    max_current: f64,
    max_flips: u32,
    flips: u32,
    trip_count: u32,
}

impl LeakageKind {
    fn trip_flip(&mut self) {
        self.flips += 1;
        self.trip_count = 0;
        self.inner.flip();
    }

    /// Over-limit test in the current sweep direction: positive-going
    /// sweeps trip on +limit, negative-going on -limit.
    fn over_limit(&self, reading: f64) -> bool {
        let bound = TRIP_MARGIN * self.max_current.abs();
        if self.inner.direction() == 1 {
            reading >= bound
        } else {
            reading <= -bound
        }
    }
}

impl StepKind for LeakageKind {
    fn kind_name(&self) -> &'static str {
        "GateLeakage"
    }

    fn describe(&self) -> String {
        format!(
            "gate leakage sweep of {} (compliance {} on {})",
            self.inner.describe(),
            self.max_current,
            self.track.key()
        )
    }

    fn controlled(&self) -> Vec<Parameter> {
        self.inner.controlled()
    }

    fn run_step(&mut self, ctx: &StepContext) -> Result<StepOutcome> {
        match self.inner.run_step(ctx)? {
            StepOutcome::Finished => {
                // Range bound reached: flip instead of finishing while
                // flips remain.
                if self.flips + 1 >= self.max_flips {
                    self.flips = self.max_flips;
                    return Ok(StepOutcome::Finished);
                }
                self.trip_flip();
                log::info!("{}: output limit reached, flipping", self.describe());
                Ok(StepOutcome::Break)
            }
            other => Ok(other),
        }
    }

    fn after_read(&mut self, follows: &[(Parameter, f64)]) -> Result<PostAction> {
        let Some((_, reading)) = follows.iter().find(|(p, _)| *p == self.track) else {
            return Ok(PostAction::Continue);
        };
        if self.over_limit(*reading) {
            self.trip_count += 1;
            if self.trip_count >= TRIP_SAMPLES {
                if self.flips + 1 >= self.max_flips {
                    self.flips = self.max_flips;
                    log::warn!(
                        "{}: compliance tripped {} times, finishing",
                        self.describe(),
                        self.max_flips
                    );
                    return Ok(PostAction::Finished);
                }
                self.trip_flip();
                log::warn!("{}: compliance tripped, flipping", self.describe());
                return Ok(PostAction::Break);
            }
        } else {
            self.trip_count = 0;
        }
        Ok(PostAction::Continue)
    }

    fn direction(&self) -> Direction {
        self.inner.direction()
    }

    fn supports_flip(&self) -> bool {
        true
    }

    fn flip_direction(&mut self) -> Result<()> {
        self.trip_flip();
        Ok(())
    }

    fn set_step(&mut self, step: f64) -> Result<()> {
        self.inner.set_step(step)
    }

    fn ramp_targets(&self) -> Vec<RampTarget> {
        self.inner.ramp_targets()
    }

    fn reset_cursor(&mut self) {
        self.inner.reset_cursor();
        self.flips = 0;
        self.trip_count = 0;
    }

    fn export(&self, record: MetadataRecord) -> MetadataRecord {
        self.inner
            .export(record)
            .attribute("max_current", self.max_current)
            .attribute("max_flips", self.max_flips)
            .attribute("track_param", self.track.key())
    }

    fn plot_axis(&self) -> PlotAxis {
        PlotAxis::Setpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn gate() -> (Parameter, Arc<Mutex<f64>>) {
        let store = Arc::new(Mutex::new(0.0));
        let read = store.clone();
        let write = store.clone();
        let p = Parameter::builder("voltage", "gate")
            .unit("V")
            .getter(move || Ok(*read.lock()))
            .setter(move |v| {
                *write.lock() = v;
                Ok(())
            })
            .build();
        (p, store)
    }

    fn current(source: Arc<Mutex<f64>>) -> Parameter {
        Parameter::builder("current", "meter")
            .unit("A")
            .getter(move || Ok(*source.lock()))
            .build()
    }

    fn kind(max_current: f64, limit: f64) -> (LeakageKind, Arc<Mutex<f64>>) {
        let (g, _) = gate();
        let leak = Arc::new(Mutex::new(0.0));
        let track = current(leak.clone());
        let trajectory = Trajectory::new(0.0, limit, 0.1, SweepMode::OneShot).unwrap();
        (
            LeakageKind {
                inner: OneAxisKind::new(g, trajectory, 1.0),
                track,
                max_current,
                max_flips: 2,
                flips: 0,
                trip_count: 0,
            },
            leak,
        )
    }

    fn ctx() -> StepContext {
        StepContext { elapsed: 0.0 }
    }

    #[test]
    fn two_consecutive_over_limit_samples_flip_direction() {
        let (mut kind, leak) = kind(1e-9, 10.0);
        let track = kind.track.clone();

        kind.run_step(&ctx()).unwrap();
        // First over-limit sample arms the trigger but does not flip.
        *leak.lock() = 2e-9;
        let reading = vec![(track.clone(), 2e-9)];
        assert!(matches!(
            kind.after_read(&reading).unwrap(),
            PostAction::Continue
        ));
        assert_eq!(kind.direction(), 1);
        // Second consecutive sample trips the flip.
        assert!(matches!(kind.after_read(&reading).unwrap(), PostAction::Break));
        assert_eq!(kind.direction(), -1);
        assert_eq!(kind.flips, 1);
    }

    #[test]
    fn an_in_range_sample_rearms_the_trigger() {
        let (mut kind, _) = kind(1e-9, 10.0);
        let track = kind.track.clone();

        let high = vec![(track.clone(), 2e-9)];
        let low = vec![(track.clone(), 0.1e-9)];
        kind.after_read(&high).unwrap();
        kind.after_read(&low).unwrap();
        assert!(matches!(kind.after_read(&high).unwrap(), PostAction::Continue));
        assert_eq!(kind.flips, 0);
    }

    #[test]
    fn final_trip_finishes_the_sweep() {
        let (mut kind, _) = kind(1e-9, 10.0);
        let track = kind.track.clone();
        kind.flips = 1; // One trip already spent.

        // On the reverse pass the compliance check watches the negative
        // bound.
        kind.inner.flip();
        let reading = vec![(track.clone(), -2e-9)];
        kind.after_read(&reading).unwrap();
        assert!(matches!(
            kind.after_read(&reading).unwrap(),
            PostAction::Finished
        ));
    }

    #[test]
    fn range_bound_counts_as_a_trip() {
        let (mut kind, _) = kind(1e-3, 0.2);
        // Walk to the bound: 0.0, 0.1, 0.2 then the bound flips.
        for _ in 0..3 {
            assert!(matches!(
                kind.run_step(&ctx()).unwrap(),
                StepOutcome::Point(_)
            ));
        }
        assert!(matches!(kind.run_step(&ctx()).unwrap(), StepOutcome::Break));
        assert_eq!(kind.direction(), -1);
        assert_eq!(kind.flips, 1);
    }
}
