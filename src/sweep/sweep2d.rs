//! Two-axis composed sweep: an outer parameter advanced once per completed
//! inner pass.
//!
//! The composite owns a bidirectional one-axis inner sweep. A supervisor
//! thread sets the outer parameter, waits the settling delay, runs the
//! inner sweep to completion, then advances the outer trajectory. The
//! outer value rides along as a persist column in every inner row, and the
//! heatmap sink keys its grid rows on it. One dataset run spans the whole
//! composite.

use super::sweep1d::Sweep1D;
use super::trajectory::{SweepMode, Trajectory};
use super::{Sweep, SweepConfig, SweepShared};
use crate::error::{Result, SweepError};
use crate::heatmap::{HeatmapRenderer, HeatmapSink, NullHeatmapRenderer};
use crate::metadata::MetadataRecord;
use crate::parameter::Parameter;
use crate::plot::{PlotRenderer, PLOT_CHANNEL_DEPTH};
use crate::progress::{ProgressState, SharedProgress, SweepState};
use crate::registry::{self, ActiveSweep};
use crate::runner::{ControlMessage, DataEvent};
use crate::station::Station;
use crate::storage::{ColumnSpec, Context, SaveTarget};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Axis description: parameter, start, stop, step.
pub type AxisSpec = (Parameter, f64, f64, f64);

/// Two-axis sweep composed from an outer trajectory and an inner
/// bidirectional one-axis sweep.
///
/// ```rust,ignore
/// let mut sweep = Sweep2D::new(
///     (gate_fine, -1.0, 1.0, 0.01),   // inner
///     (gate_coarse, 0.0, 2.0, 0.1),   // outer
/// )
/// .outer_delay(0.5)
/// .save_to(SaveTarget::new("maps", "stability", "dev1"))
/// .build()?;
/// sweep.follow_param([drain_current])?;
/// sweep.start()?;
/// ```
pub struct Sweep2D {
    shared: Arc<SweepShared>,
    inner: Arc<Mutex<Sweep>>,
    outer_param: Parameter,
    inner_param: Parameter,
    outer: Trajectory,
    inner_spec: (f64, f64, f64),
    config: SweepConfig,
    ministeps: u32,
    save_target: Option<SaveTarget>,
    heatmap_renderer: Option<Box<dyn HeatmapRenderer>>,
    /// Index into the follow set of the value mapped by the heatmap.
    heatmap_index: usize,
    heatmap_sink: Option<HeatmapSink>,
    supervisor: Option<std::thread::JoinHandle<()>>,
    on_complete: Option<Arc<dyn Fn(SweepState) + Send + Sync>>,
}

pub struct Sweep2DBuilder {
    inner: AxisSpec,
    outer: AxisSpec,
    ministeps: u32,
    cfg: SweepConfig,
    save: Option<SaveTarget>,
    renderer: Option<Box<dyn PlotRenderer>>,
    heatmap_renderer: Option<Box<dyn HeatmapRenderer>>,
}

impl Sweep2D {
    pub fn new(inner: AxisSpec, outer: AxisSpec) -> Sweep2DBuilder {
        Sweep2DBuilder {
            inner,
            outer,
            ministeps: 1,
            cfg: SweepConfig::default(),
            save: None,
            renderer: None,
            heatmap_renderer: None,
        }
    }
}

impl Sweep2DBuilder {
    super::builder_common!();

    /// Seconds to settle after each outer movement. Must be at least
    /// 0.1 s.
    pub fn outer_delay(mut self, seconds: f64) -> Self {
        self.cfg.outer_delay = seconds;
        self
    }

    /// Sub-steps used to move the outer parameter between setpoints.
    pub fn ministeps(mut self, n: u32) -> Self {
        self.ministeps = n.max(1);
        self
    }

    /// Scale the inner return-pass step (fewer samples on the way back).
    pub fn back_multiplier(mut self, multiplier: f64) -> Self {
        self.cfg.back_multiplier = multiplier;
        self
    }

    /// Renderer for the assembled 2-D grid.
    pub fn heatmap_renderer(mut self, renderer: Box<dyn HeatmapRenderer>) -> Self {
        self.heatmap_renderer = Some(renderer);
        self
    }

    pub fn build(self) -> Result<Sweep2D> {
        self.cfg.validate()?;
        let (outer_param, out_start, out_stop, out_step) = self.outer;
        let (in_param, in_start, in_stop, in_step) = self.inner;
        let outer = Trajectory::new(out_start, out_stop, out_step, SweepMode::OneShot)?;

        let mut inner_builder = Sweep1D::new(in_param.clone(), in_start, in_stop, in_step)
            .bidirectional()
            .back_multiplier(self.cfg.back_multiplier)
            .inter_delay(self.cfg.inter_delay)
            .plot(self.cfg.plot_data)
            .plot_bin(self.cfg.plot_bin);
        if let Some(renderer) = self.renderer {
            inner_builder = inner_builder.renderer(renderer);
        }
        let mut inner = inner_builder.build()?;
        inner.set_persist_param(Some(outer_param.clone()));
        inner.set_finish_measurement(false);

        let shared = SweepShared::new(format!(
            "2D sweep of {} from {out_start} to {out_stop} over {}",
            outer_param.key(),
            inner.describe(),
        ));
        inner.set_parent(&shared);

        Ok(Sweep2D {
            shared,
            inner: Arc::new(Mutex::new(inner)),
            outer_param,
            inner_param: in_param,
            outer,
            inner_spec: (in_start, in_stop, in_step),
            config: self.cfg,
            ministeps: self.ministeps,
            save_target: self.save,
            heatmap_renderer: self.heatmap_renderer,
            heatmap_index: 0,
            heatmap_sink: None,
            supervisor: None,
            on_complete: None,
        })
    }
}

impl Sweep2D {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn describe(&self) -> String {
        self.shared.describe.lock().clone()
    }

    /// Track parameters on every inner point. Registered on the inner
    /// sweep, which owns the acquisition.
    pub fn follow_param(&mut self, params: impl IntoIterator<Item = Parameter>) -> Result<()> {
        let mut inner = self.inner.lock();
        for p in params {
            if p == self.outer_param {
                return Err(SweepError::config(format!(
                    "{} is the outer parameter and is recorded automatically",
                    p.key()
                )));
            }
            inner.follow_param([p])?;
        }
        Ok(())
    }

    /// Select which followed parameter the heatmap maps.
    pub fn follow_heatmap_param(&mut self, parameter: &Parameter) -> Result<()> {
        let inner = self.inner.lock();
        match inner.followed().iter().position(|p| p == parameter) {
            Some(index) => {
                drop(inner);
                self.heatmap_index = index;
                Ok(())
            }
            None => Err(SweepError::config(format!(
                "{} is not followed by this sweep",
                parameter.key()
            ))),
        }
    }

    pub fn attach_save(&mut self, target: SaveTarget) {
        self.save_target = Some(target);
    }

    /// Change the outer settling delay. Applies from the next start; must
    /// be at least 0.1 s.
    pub fn set_outer_delay(&mut self, seconds: f64) -> Result<()> {
        if !(seconds.is_finite() && seconds >= super::MIN_OUTER_DELAY) {
            return Err(SweepError::config(format!(
                "outer_delay must be at least {} s, got {seconds}",
                super::MIN_OUTER_DELAY
            )));
        }
        if self.state().is_active() {
            log::warn!("outer_delay change takes effect on the next start");
        }
        self.config.outer_delay = seconds;
        Ok(())
    }

    /// Change the inner cadence. Applies from the next start.
    pub fn set_inter_delay(&mut self, seconds: f64) -> Result<()> {
        if !(seconds.is_finite() && seconds >= super::MIN_INTER_DELAY) {
            return Err(SweepError::config(format!(
                "inter_delay must be at least {} s, got {seconds}",
                super::MIN_INTER_DELAY
            )));
        }
        self.config.inter_delay = seconds;
        self.inner.lock().set_inter_delay(seconds)
    }

    pub fn progress(&self) -> ProgressState {
        self.shared.progress.snapshot()
    }

    pub fn state(&self) -> SweepState {
        self.shared.progress.state()
    }

    pub fn on_complete(&mut self, callback: impl Fn(SweepState) + Send + Sync + 'static) {
        self.on_complete = Some(Arc::new(callback));
    }

    pub fn set_queued(&mut self, queued: bool) {
        self.shared.queued.store(queued, Ordering::Relaxed);
        self.inner.lock().set_queued(queued);
    }

    pub fn start(&mut self) -> Result<()> {
        self.start_impl(true, false)
    }

    pub fn start_without_ramp(&mut self) -> Result<()> {
        self.start_impl(false, false)
    }

    pub fn start_force(&mut self) -> Result<()> {
        self.start_impl(true, true)
    }

    fn start_impl(&mut self, ramp: bool, force: bool) -> Result<()> {
        let state = self.state();
        if !state.can_start() {
            return Err(SweepError::config(format!(
                "cannot start {} from state {state}",
                self.describe()
            )));
        }
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
        }

        let queued = self.shared.queued.load(Ordering::Relaxed);
        let as_active: Arc<dyn ActiveSweep> = self.shared.clone();
        if !queued {
            if force {
                registry::kill_unrelated(&as_active);
            } else {
                registry::check_no_unrelated(&as_active)?;
            }
        }

        let metadata = self.export_metadata();

        // One dataset run spans every inner pass.
        let mut context = None;
        {
            let mut inner = self.inner.lock();
            if let Some(target) = &self.save_target {
                let mut ctx = Context::open(target.clone())?;
                let handle =
                    ctx.begin_measurement(self.column_schema(&inner), Some(&metadata))?;
                inner.park_measurement(handle);
                context = Some(ctx);
            }

            // Heatmap rides the inner data stream.
            if self.config.plot_data {
                let (tap_tx, tap_rx) = bounded::<DataEvent>(PLOT_CHANNEL_DEPTH);
                let renderer = self
                    .heatmap_renderer
                    .take()
                    .unwrap_or_else(|| Box::new(NullHeatmapRenderer));
                let value_name = inner
                    .followed()
                    .get(self.heatmap_index)
                    .map(|p| p.key())
                    .unwrap_or_default();
                self.heatmap_sink = Some(HeatmapSink::spawn(
                    tap_rx,
                    self.heatmap_index,
                    value_name,
                    renderer,
                ));
                inner.set_extra_tap(Some(tap_tx));
            }
        }

        let (control_tx, control_rx) = bounded::<ControlMessage>(32);
        *self.shared.control_tx.lock() = Some(control_tx.clone());
        self.inner.lock().set_advisory(Some(control_tx));

        if !queued {
            registry::register(&as_active);
        }

        let per_pass = Trajectory::new(
            self.inner_spec.0,
            self.inner_spec.1,
            self.inner_spec.2,
            SweepMode::Bidirectional,
        )
        .map(|t| 2 * t.count())
        .unwrap_or(0);
        self.shared.progress.update(|p| {
            p.state = if ramp {
                SweepState::RampingToStart
            } else {
                SweepState::Running
            };
            p.total_points = Some(per_pass * self.outer.count());
        });

        log::info!("starting {}", self.describe());

        let supervisor = OuterSupervisor {
            shared: self.shared.clone(),
            progress: self.shared.progress.clone(),
            inner: self.inner.clone(),
            outer_param: self.outer_param.clone(),
            outer: self.outer.clone(),
            outer_delay: self.config.outer_delay,
            inter_delay: self.config.inter_delay,
            ministeps: self.ministeps,
            ramp,
            ramp_timeout: self.config.ramp_timeout,
            ramp_tolerance: self.config.ramp_tolerance,
            control_rx,
            context,
            on_complete: self.on_complete.clone(),
        };
        self.supervisor = Some(
            std::thread::Builder::new()
                .name("labsweep-outer".to_string())
                .spawn(move || supervisor.run())
                .expect("failed to spawn outer supervisor thread"),
        );
        Ok(())
    }

    fn column_schema(&self, inner: &Sweep) -> Vec<ColumnSpec> {
        let mut columns = Vec::new();
        for p in inner.controlled() {
            columns.push(ColumnSpec::new(p.key(), p.label(), p.unit()));
        }
        columns.push(ColumnSpec::new(
            self.outer_param.key(),
            self.outer_param.label(),
            self.outer_param.unit(),
        ));
        for p in inner.followed() {
            columns.push(ColumnSpec::new(p.key(), p.label(), p.unit()));
        }
        columns.push(ColumnSpec::new("time", "time", "s"));
        columns
    }

    /// Graceful stop: the in-flight inner pass drains, then the composite
    /// finishes.
    pub fn stop(&mut self) {
        if !self.shared.send_control(ControlMessage::Stop) {
            log::info!("{}: not currently running, nothing to stop", self.describe());
        }
    }

    /// Abrupt termination of both axes.
    pub fn kill(&mut self) {
        if self.state().is_terminal() {
            return;
        }
        if !self.shared.send_control(ControlMessage::Kill) {
            self.inner.lock().kill();
            self.shared.progress.set_state(SweepState::Killed);
            registry::deregister(self.shared.id);
        }
    }

    pub fn wait_done(&self, timeout: Duration) -> Option<ProgressState> {
        self.shared.progress.wait_terminal(timeout)
    }

    /// Return a terminal composite to Ready, rewinding both axes.
    pub fn reset(&mut self) -> Result<()> {
        if self.state().is_active() {
            return Err(SweepError::config("cannot reset a running sweep"));
        }
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
        }
        self.inner.lock().reset()?;
        self.shared.progress.update(|p| {
            *p = ProgressState::default();
        });
        Ok(())
    }

    pub fn clear_error(&mut self) -> Result<()> {
        if self.state() != SweepState::Error {
            return Err(SweepError::config("clear_error requires the Error state"));
        }
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
        }
        {
            let mut inner = self.inner.lock();
            if inner.state() == SweepState::Error {
                inner.clear_error()?;
            }
        }
        self.shared.progress.clear_error();
        Ok(())
    }

    /// Estimated seconds to completion: outer settling plus one inner
    /// cycle per outer point.
    pub fn estimate_time(&self) -> Option<f64> {
        let inner_cycle = self.inner.lock().estimate_time()?;
        let outer_points = self.outer.count() as f64;
        Some(outer_points * (inner_cycle + self.outer_delay_total()))
    }

    fn outer_delay_total(&self) -> f64 {
        self.config.outer_delay * self.ministeps as f64
    }

    pub fn export_metadata(&self) -> Value {
        let inner = self.inner.lock();
        let (in_start, in_stop, in_step) = self.inner_spec;
        let inner_traj =
            Trajectory::new(in_start, in_stop, in_step, SweepMode::Bidirectional)
                .expect("inner trajectory was validated at construction");

        let mut record = MetadataRecord::new("Sweep2D")
            .attribute("inter_delay", self.config.inter_delay)
            .attribute("outer_delay", self.config.outer_delay)
            .attribute("ministeps", self.ministeps as u64)
            .attribute("back_multiplier", self.config.back_multiplier)
            .attribute("plot_bin", self.config.plot_bin as u64)
            .attribute("plot_data", self.config.plot_data)
            .attribute("save_data", self.save_target.is_some())
            .attribute("outer_param", self.outer_param.key())
            .controlled(&self.inner_param, &inner_traj)
            .controlled(&self.outer_param, &self.outer);
        for p in inner.followed() {
            record = record.followed(p);
        }
        record.build()
    }

    /// Rebuild a composed sweep from a metadata record against `station`.
    pub fn from_metadata(record: &Value, station: &Station) -> Result<Sweep2D> {
        super::import::sweep2d_from_metadata(record, station)
    }
}

impl Drop for Sweep2D {
    fn drop(&mut self) {
        if self.state().is_active() {
            self.kill();
        }
    }
}

/// The outer worker: drives the outer parameter and the inner sweep.
struct OuterSupervisor {
    shared: Arc<SweepShared>,
    progress: SharedProgress,
    inner: Arc<Mutex<Sweep>>,
    outer_param: Parameter,
    outer: Trajectory,
    outer_delay: f64,
    inter_delay: f64,
    ministeps: u32,
    ramp: bool,
    ramp_timeout: Duration,
    ramp_tolerance: f64,
    control_rx: Receiver<ControlMessage>,
    context: Option<Context>,
    on_complete: Option<Arc<dyn Fn(SweepState) + Send + Sync>>,
}

enum OuterExit {
    Finished,
    Stopped,
    Killed,
    Failed(String),
}

impl OuterSupervisor {
    fn run(mut self) {
        let exit = self.drive();

        // Release the shared dataset run.
        {
            let mut inner = self.inner.lock();
            inner.set_extra_tap(None);
            inner.set_advisory(None);
            if let Some(handle) = inner.take_measurement() {
                if let Err(e) = handle.finish() {
                    log::error!("closing 2D dataset failed: {}", e);
                }
            }
        }
        if let Some(context) = self.context.take() {
            context.close();
        }

        let final_state = match exit {
            OuterExit::Finished => {
                log::info!("2D sweep complete");
                SweepState::Done
            }
            OuterExit::Stopped => {
                log::info!("2D sweep stopped");
                SweepState::Done
            }
            OuterExit::Killed => {
                log::warn!("2D sweep killed");
                SweepState::Killed
            }
            OuterExit::Failed(ref msg) => {
                log::error!("2D sweep error: {}", msg);
                SweepState::Error
            }
        };
        match exit {
            OuterExit::Failed(msg) => self.progress.mark_error(msg),
            _ => self.progress.set_state(final_state),
        }
        *self.shared.control_tx.lock() = None;
        registry::deregister(self.shared.id);
        if let Some(callback) = &self.on_complete {
            callback(final_state);
        }
    }

    fn drive(&mut self) -> OuterExit {
        if self.ramp {
            match self.ramp_outer_to_start() {
                Ok(None) => {}
                Ok(Some(exit)) => return exit,
                Err(e) => return OuterExit::Failed(e.to_string()),
            }
        }
        self.progress.set_state(SweepState::Running);

        let mut setpoint = self.outer.start;
        let mut first = true;
        loop {
            if let Some(exit) = self.check_control() {
                return exit;
            }

            // Position the outer parameter: directly for the first line,
            // in ministeps for subsequent advances.
            if first {
                if let Err(e) = self.outer_param.safe_set(setpoint) {
                    return OuterExit::Failed(e.to_string());
                }
                if let Some(exit) = self.settle() {
                    return exit;
                }
                first = false;
            }

            self.progress.update(|p| {
                p.current_setpoints = vec![setpoint];
            });

            // One full inner cycle at this outer value.
            match self.run_inner_pass(setpoint) {
                Ok(None) => {}
                Ok(Some(exit)) => return exit,
                Err(e) => return OuterExit::Failed(e.to_string()),
            }

            if !self.outer.has_next(setpoint) {
                return OuterExit::Finished;
            }

            // Advance the outer parameter in ministeps.
            let increment = self.outer.step / self.ministeps as f64;
            for ministep in 1..=self.ministeps {
                if let Some(exit) = self.check_control() {
                    return exit;
                }
                let value = setpoint + ministep as f64 * increment;
                if let Err(e) = self.outer_param.safe_set(value) {
                    return OuterExit::Failed(e.to_string());
                }
                if let Some(exit) = self.settle() {
                    return exit;
                }
            }
            setpoint += self.outer.step;
        }
    }

    /// Start the inner sweep and wait for its terminal state.
    fn run_inner_pass(&mut self, outer_value: f64) -> Result<Option<OuterExit>> {
        let inner_progress = {
            let mut inner = self.inner.lock();
            inner.set_persist(Some(outer_value));
            inner.start()?;
            inner.shared().progress.clone()
        };

        loop {
            if let Some(progress) = inner_progress.wait_terminal(Duration::from_millis(100)) {
                let pass_points = progress.points_emitted;
                self.progress.update(|p| {
                    p.points_emitted += pass_points;
                });
                return Ok(match progress.state {
                    SweepState::Done => {
                        self.inner.lock().prepare_next_pass();
                        None
                    }
                    SweepState::Killed => Some(OuterExit::Killed),
                    SweepState::Error => Some(OuterExit::Failed(format!(
                        "inner sweep failed: {}",
                        progress
                            .error_message
                            .unwrap_or_else(|| "unknown error".to_string())
                    ))),
                    state => Some(OuterExit::Failed(format!(
                        "inner sweep left in unexpected state {state}"
                    ))),
                });
            }
            if let Some(exit) = self.check_control() {
                return Ok(Some(exit));
            }
        }
    }

    /// Drain outer control. Stop lets the current pass finish; Kill tears
    /// both axes down.
    fn check_control(&mut self) -> Option<OuterExit> {
        while let Ok(msg) = self.control_rx.try_recv() {
            match msg {
                ControlMessage::Stop => {
                    log::info!("stop requested for 2D sweep");
                    self.progress.set_state(SweepState::Stopping);
                    let inner_progress = {
                        let mut inner = self.inner.lock();
                        inner.stop();
                        inner.shared().progress.clone()
                    };
                    // Let an in-flight pass drain before reporting stopped.
                    if inner_progress.state().is_active() {
                        let _ = inner_progress.wait_terminal(Duration::from_secs(60));
                    }
                    return Some(OuterExit::Stopped);
                }
                ControlMessage::Kill => {
                    self.inner.lock().kill();
                    return Some(OuterExit::Killed);
                }
                other => {
                    log::warn!("2D sweep ignores control message {:?}", other);
                }
            }
        }
        None
    }

    /// Outer settling delay, interruptible by control.
    fn settle(&mut self) -> Option<OuterExit> {
        let deadline = Instant::now() + Duration::from_secs_f64(self.outer_delay);
        while Instant::now() < deadline {
            if let Some(exit) = self.check_control() {
                return Some(exit);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        None
    }

    /// Bring the outer parameter to its start value before the first
    /// line. `Ok(Some(exit))` reports an interruption by stop/kill.
    fn ramp_outer_to_start(&mut self) -> Result<Option<OuterExit>> {
        let current = self.outer_param.safe_get()?;
        let target = self.outer.start;
        let step = self.outer.step.abs();
        let tolerance = (step / 2.0).max(self.ramp_tolerance * step);
        if (current - target).abs() <= tolerance {
            self.outer_param.safe_set(target)?;
            return Ok(None);
        }

        log::info!(
            "ramping {} from {current} to {target} before the 2D sweep",
            self.outer_param.key()
        );
        let deadline = Instant::now() + self.ramp_timeout;
        let signed_step = step.copysign(target - current);
        let mut value = current;
        loop {
            if let Some(exit) = self.check_control() {
                return Ok(Some(exit));
            }
            if Instant::now() > deadline {
                return Err(SweepError::RampConvergence {
                    parameter: self.outer_param.key(),
                    expected: target,
                    actual: self.outer_param.safe_get().unwrap_or(f64::NAN),
                    tolerance,
                });
            }
            let remaining = target - value;
            if remaining.abs() <= signed_step.abs() {
                break;
            }
            value += signed_step;
            self.outer_param.safe_set(value)?;
            std::thread::sleep(Duration::from_secs_f64(self.inter_delay));
        }
        self.outer_param.safe_set(target)?;

        let actual = self.outer_param.safe_get()?;
        if (actual - target).abs() > tolerance {
            return Err(SweepError::RampConvergence {
                parameter: self.outer_param.key(),
                expected: target,
                actual,
                tolerance,
            });
        }
        Ok(None)
    }
}
