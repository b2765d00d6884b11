//! The sweep hierarchy: lifecycle orchestration over pluggable step kinds.
//!
//! A [`Sweep`] owns everything common to all sweep kinds (the follow set,
//! delays, the acquisition worker and plot sink lifecycles, persistence
//! attachment, registry interaction and metadata export) and delegates the
//! per-step semantics to a [`StepKind`]. Kinds are small state machines:
//! advance a trajectory cursor, report a point, flip, or finish. Composed
//! (two-axis) sweeps live in [`sweep2d`] and drive an inner `Sweep` of
//! their own.

pub mod gate_leakage;
mod import;
pub mod listening;
pub mod magnet;
pub mod simul;
pub mod sweep0d;
pub mod sweep1d;
pub mod sweep2d;
pub mod trajectory;

use crate::error::{Result, SweepError};
use crate::metadata::MetadataRecord;
use crate::parameter::Parameter;
use crate::plot::{PlotAxis, PlotRenderer, PlotSink, NullRenderer, PLOT_CHANNEL_DEPTH};
use crate::progress::{Direction, ProgressState, SharedProgress, SweepState};
use crate::registry::{self, ActiveSweep};
use crate::runner::{self, ControlMessage, DataEvent, RampPlan, RunnerSpec};
use crate::station::Station;
use crate::storage::{ColumnSpec, Context, MeasurementHandle, SaveTarget};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Minimum cadence between points.
pub const MIN_INTER_DELAY: f64 = 0.01;
/// Minimum settling delay between outer steps of a composed sweep.
pub const MIN_OUTER_DELAY: f64 = 0.1;

/// Per-point context handed to the kind by the worker.
pub struct StepContext {
    /// Seconds since the sweep first started, across resumes.
    pub elapsed: f64,
}

/// What one call to [`StepKind::run_step`] produced.
#[derive(Debug)]
pub enum StepOutcome {
    /// A new point at these controlled setpoints (declared order).
    Point(Vec<f64>),
    /// The direction flipped at a trajectory boundary; a break marker is
    /// emitted and the next call yields the first point of the new pass.
    Break,
    /// Nothing to emit this tick (listening sweeps below threshold).
    Idle,
    /// The trajectory is exhausted.
    Finished,
}

/// Verdict of the post-read safety hook.
pub enum PostAction {
    Continue,
    /// A predicate tripped: direction was flipped, emit a break marker.
    Break,
    /// A predicate ended the sweep.
    Finished,
}

/// One parameter the ramp phase must bring to its start value.
pub struct RampTarget {
    pub parameter: Parameter,
    pub target: f64,
    /// Trajectory step of this parameter, used to pace the ramp.
    pub step: f64,
}

/// Per-step semantics of one sweep kind.
///
/// Implementations are plain state machines; everything thread-related is
/// the worker's business. All methods are called from the worker thread
/// while the sweep is running, and from the owning thread otherwise.
pub trait StepKind: Send {
    fn kind_name(&self) -> &'static str;

    /// Human-readable description for logs and errors.
    fn describe(&self) -> String;

    /// Construction-time validation beyond what the builder checked.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Controlled parameters in declared order. Empty for time-only kinds.
    fn controlled(&self) -> Vec<Parameter>;

    /// Advance one step.
    fn run_step(&mut self, ctx: &StepContext) -> Result<StepOutcome>;

    /// Safety hook evaluated after the follow set was read.
    fn after_read(&mut self, _follows: &[(Parameter, f64)]) -> Result<PostAction> {
        Ok(PostAction::Continue)
    }

    fn direction(&self) -> Direction {
        1
    }

    fn supports_flip(&self) -> bool {
        false
    }

    /// Flip at the next trajectory boundary. Only called when
    /// [`StepKind::supports_flip`] is true.
    fn flip_direction(&mut self) -> Result<()> {
        Err(SweepError::config(format!(
            "{} cannot flip direction",
            self.describe()
        )))
    }

    /// Live step-size change from the control channel.
    fn set_step(&mut self, _step: f64) -> Result<()> {
        Err(SweepError::config(format!(
            "{} has no step size",
            self.describe()
        )))
    }

    /// Expected number of points when the trajectory is finite.
    fn total_points(&self) -> Option<u64> {
        None
    }

    /// Parameters the ramp-to-start phase must position.
    fn ramp_targets(&self) -> Vec<RampTarget> {
        Vec::new()
    }

    /// Rewind the cursor to the beginning of the trajectory.
    fn reset_cursor(&mut self);

    /// Estimated seconds to completion at the given cadence.
    fn estimate_remaining(&self, _cadence: f64) -> Option<f64> {
        None
    }

    /// Add kind-specific attributes and controlled entries to the record.
    fn export(&self, record: MetadataRecord) -> MetadataRecord;

    /// The x axis the plot sink should use for follow series.
    fn plot_axis(&self) -> PlotAxis {
        PlotAxis::Setpoint
    }
}

/// Options shared by every sweep kind.
#[derive(Clone)]
pub struct SweepConfig {
    /// Seconds between points.
    pub inter_delay: f64,
    /// Seconds between outer steps (composed sweeps).
    pub outer_delay: f64,
    pub plot_data: bool,
    /// Renderer updates every N points.
    pub plot_bin: usize,
    /// Scales the step on the return pass of bidirectional sweeps.
    pub back_multiplier: f64,
    /// When true, `resume()` rewinds to the trajectory start instead of
    /// continuing from the last emitted point.
    pub restart_on_resume: bool,
    /// Scales the trajectory step during ramp-to-start.
    pub ramp_multiplier: f64,
    /// Hard cap on the ramp's per-step delta.
    pub ramp_step_cap: Option<f64>,
    pub ramp_timeout: Duration,
    /// Ramp convergence tolerance as a fraction of the step size.
    pub ramp_tolerance: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            inter_delay: MIN_INTER_DELAY,
            outer_delay: 1.0,
            plot_data: true,
            plot_bin: 1,
            back_multiplier: 1.0,
            restart_on_resume: false,
            ramp_multiplier: 1.0,
            ramp_step_cap: None,
            ramp_timeout: Duration::from_secs(120),
            ramp_tolerance: 0.5,
        }
    }
}

impl SweepConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.inter_delay.is_finite() && self.inter_delay >= MIN_INTER_DELAY) {
            return Err(SweepError::config(format!(
                "inter_delay must be at least {MIN_INTER_DELAY} s, got {}",
                self.inter_delay
            )));
        }
        if !(self.outer_delay.is_finite() && self.outer_delay >= MIN_OUTER_DELAY) {
            return Err(SweepError::config(format!(
                "outer_delay must be at least {MIN_OUTER_DELAY} s, got {}",
                self.outer_delay
            )));
        }
        if self.back_multiplier <= 0.0 {
            return Err(SweepError::config(format!(
                "back_multiplier must be positive, got {}",
                self.back_multiplier
            )));
        }
        if self.ramp_multiplier <= 0.0 || !self.ramp_multiplier.is_finite() {
            return Err(SweepError::config(format!(
                "ramp_multiplier must be positive and finite, got {}",
                self.ramp_multiplier
            )));
        }
        if self.ramp_tolerance <= 0.0 {
            return Err(SweepError::config(format!(
                "ramp tolerance must be positive, got {}",
                self.ramp_tolerance
            )));
        }
        Ok(())
    }
}

/// State shared between the sweep handle, its worker, and the registry.
pub(crate) struct SweepShared {
    pub id: u64,
    pub describe: Mutex<String>,
    pub progress: SharedProgress,
    pub control_tx: Mutex<Option<Sender<ControlMessage>>>,
    pub parent: Mutex<Weak<SweepShared>>,
    pub queued: AtomicBool,
    /// Elapsed seconds accumulated by completed runs; the time column
    /// continues across stop/resume.
    pub accumulated: Mutex<f64>,
}

impl SweepShared {
    fn new(describe: String) -> Arc<Self> {
        Arc::new(Self {
            id: registry::next_sweep_id(),
            describe: Mutex::new(describe),
            progress: SharedProgress::new(),
            control_tx: Mutex::new(None),
            parent: Mutex::new(Weak::new()),
            queued: AtomicBool::new(false),
            accumulated: Mutex::new(0.0),
        })
    }

    fn send_control(&self, msg: ControlMessage) -> bool {
        match self.control_tx.lock().as_ref() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }
}

impl ActiveSweep for SweepShared {
    fn sweep_id(&self) -> u64 {
        self.id
    }

    fn parent_sweep(&self) -> Option<Arc<dyn ActiveSweep>> {
        self.parent
            .lock()
            .upgrade()
            .map(|p| p as Arc<dyn ActiveSweep>)
    }

    fn is_active(&self) -> bool {
        self.progress.state().is_active()
    }

    fn kill_sweep(&self) {
        if !self.send_control(ControlMessage::Kill) {
            let state = self.progress.state();
            if !state.is_terminal() {
                self.progress.set_state(SweepState::Killed);
            }
        }
    }

    fn describe(&self) -> String {
        self.describe.lock().clone()
    }
}

impl std::fmt::Debug for Sweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweep").field("kind_name", &self.kind_name).finish_non_exhaustive()
    }
}

/// A runnable sweep: one kind plus the common lifecycle machinery.
pub struct Sweep {
    shared: Arc<SweepShared>,
    kind_slot: Arc<Mutex<Option<Box<dyn StepKind>>>>,
    kind_name: &'static str,
    config: SweepConfig,
    follow: Vec<Parameter>,
    save_target: Option<SaveTarget>,
    /// Row sink surviving across runs; composed sweeps share one handle
    /// over many inner passes.
    measurement_slot: Arc<Mutex<Option<MeasurementHandle>>>,
    /// When false the worker parks the handle back into the slot instead
    /// of finishing the run (composed sweeps finish it themselves).
    finish_measurement: bool,
    renderer: Option<Box<dyn PlotRenderer>>,
    plot_sink: Option<PlotSink>,
    /// Extra consumer of the data stream (the 2-D heatmap).
    extra_tap: Option<Sender<DataEvent>>,
    /// Control channel that UI surfaces should post to instead of this
    /// sweep's own; composed sweeps route advisory actions to the outer
    /// supervisor so ESC stops the whole sweep.
    advisory_tx: Option<Sender<ControlMessage>>,
    /// Outer value appended to every row when this is an inner sweep.
    persist: Option<f64>,
    /// The parameter the persist column belongs to (the outer parameter of
    /// a composed sweep); declares the extra column in the schema.
    persist_param_decl: Option<Parameter>,
    on_complete: Option<Arc<dyn Fn(SweepState) + Send + Sync>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl Sweep {
    /// Assemble a sweep from a validated kind and configuration. Called by
    /// the kind builders.
    pub(crate) fn assemble(kind: Box<dyn StepKind>, config: SweepConfig) -> Result<Self> {
        config.validate()?;
        kind.validate()?;
        let kind_name = kind.kind_name();
        let shared = SweepShared::new(kind.describe());
        Ok(Self {
            shared,
            kind_name,
            kind_slot: Arc::new(Mutex::new(Some(kind))),
            config,
            follow: Vec::new(),
            save_target: None,
            measurement_slot: Arc::new(Mutex::new(None)),
            finish_measurement: true,
            renderer: None,
            plot_sink: None,
            extra_tap: None,
            advisory_tx: None,
            persist: None,
            persist_param_decl: None,
            on_complete: None,
            worker: None,
        })
    }

    /// Stable process-unique identifier.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind_name
    }

    pub fn describe(&self) -> String {
        self.shared.describe.lock().clone()
    }

    /// Track parameters after each step, for both saving and plotting.
    ///
    /// The controlled parameters of this sweep are rejected: they are
    /// already recorded as setpoints.
    pub fn follow_param(&mut self, params: impl IntoIterator<Item = Parameter>) -> Result<()> {
        if self.state().is_active() {
            return Err(SweepError::config(
                "cannot update the follow set while the sweep is running",
            ));
        }
        let controlled = self.controlled();
        for p in params {
            if controlled.contains(&p) {
                return Err(SweepError::config(format!(
                    "{} is controlled by this sweep and cannot be followed",
                    p.key()
                )));
            }
            if !self.follow.contains(&p) {
                self.follow.push(p);
            }
        }
        Ok(())
    }

    /// Stop tracking previously followed parameters.
    pub fn remove_param(&mut self, params: impl IntoIterator<Item = Parameter>) -> Result<()> {
        if self.state().is_active() {
            return Err(SweepError::config(
                "cannot update the follow set while the sweep is running",
            ));
        }
        for p in params {
            self.follow.retain(|f| *f != p);
        }
        Ok(())
    }

    pub fn followed(&self) -> &[Parameter] {
        &self.follow
    }

    pub fn controlled(&self) -> Vec<Parameter> {
        match self.kind_slot.lock().as_ref() {
            Some(kind) => kind.controlled(),
            None => Vec::new(),
        }
    }

    /// Route rows of the next runs into this dataset target.
    pub fn attach_save(&mut self, target: SaveTarget) {
        self.save_target = Some(target);
    }

    pub fn save_target(&self) -> Option<&SaveTarget> {
        self.save_target.as_ref()
    }

    /// Replace the live-plot renderer used by the next run.
    pub fn set_renderer(&mut self, renderer: Box<dyn PlotRenderer>) {
        self.renderer = Some(renderer);
    }

    pub fn set_plot_bin(&mut self, plot_bin: usize) {
        self.config.plot_bin = plot_bin.max(1);
    }

    /// Change the cadence. Takes effect immediately when running.
    pub fn set_inter_delay(&mut self, seconds: f64) -> Result<()> {
        if !(seconds.is_finite() && seconds >= MIN_INTER_DELAY) {
            return Err(SweepError::config(format!(
                "inter_delay must be at least {MIN_INTER_DELAY} s, got {seconds}"
            )));
        }
        self.config.inter_delay = seconds;
        self.shared
            .send_control(ControlMessage::SetInterDelay(seconds));
        Ok(())
    }

    /// Callback invoked from the worker when a run reaches a terminal
    /// state.
    pub fn on_complete(&mut self, callback: impl Fn(SweepState) + Send + Sync + 'static) {
        self.on_complete = Some(Arc::new(callback));
    }

    pub fn progress(&self) -> ProgressState {
        self.shared.progress.snapshot()
    }

    pub fn state(&self) -> SweepState {
        self.shared.progress.state()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_active()
    }

    /// Start with ramp-to-start enabled.
    pub fn start(&mut self) -> Result<()> {
        self.start_impl(true, false)
    }

    /// Start without positioning the controlled parameters first.
    pub fn start_without_ramp(&mut self) -> Result<()> {
        self.start_impl(false, false)
    }

    /// Kill every unrelated active sweep, then start.
    pub fn start_force(&mut self) -> Result<()> {
        self.start_impl(true, true)
    }

    fn start_impl(&mut self, ramp: bool, force: bool) -> Result<()> {
        let state = self.state();
        if !state.can_start() {
            return Err(SweepError::config(format!(
                "cannot start {} from state {state}; reset or clear_error first",
                self.describe()
            )));
        }
        self.reap_worker();

        let queued = self.shared.queued.load(Ordering::Relaxed);
        let as_active: Arc<dyn ActiveSweep> = self.shared.clone();
        if !queued {
            if force {
                registry::kill_unrelated(&as_active);
            } else {
                registry::check_no_unrelated(&as_active)?;
            }
        }

        // Prepare the worker inputs while we still own everything.
        let metadata = self.export_metadata();
        let (ramp_plan, total, axis, controlled) = {
            let slot = self.kind_slot.lock();
            let kind = slot
                .as_ref()
                .ok_or_else(|| SweepError::config("sweep kind is unavailable"))?;
            let ramp_plan = if ramp {
                let targets = kind.ramp_targets();
                (!targets.is_empty()).then(|| RampPlan {
                    targets,
                    multiplier: self.config.ramp_multiplier,
                    step_cap: self.config.ramp_step_cap,
                    timeout: self.config.ramp_timeout,
                    tolerance_factor: self.config.ramp_tolerance,
                })
            } else {
                None
            };
            (ramp_plan, kind.total_points(), kind.plot_axis(), kind.controlled())
        };

        // Persistence: reuse a parked handle or open a fresh run.
        let mut context_to_close = None;
        let measurement = match self.measurement_slot.lock().take() {
            Some(handle) => Some(handle),
            None => match &self.save_target {
                Some(target) => {
                    let mut context = Context::open(target.clone())?;
                    let handle = context
                        .begin_measurement(self.column_schema(&controlled), Some(&metadata))?;
                    context_to_close = Some(context);
                    Some(handle)
                }
                None => None,
            },
        };

        let (control_tx, control_rx) = bounded::<ControlMessage>(32);
        *self.shared.control_tx.lock() = Some(control_tx.clone());

        let mut data_taps = Vec::new();
        if self.config.plot_data {
            let (plot_tx, plot_rx) = bounded::<DataEvent>(PLOT_CHANNEL_DEPTH);
            let renderer = self
                .renderer
                .take()
                .unwrap_or_else(|| Box::new(NullRenderer));
            let names = self
                .follow
                .iter()
                .map(|p| (p.key(), p.unit().to_string()))
                .collect();
            let sink_control = self.advisory_tx.clone().unwrap_or(control_tx);
            self.plot_sink = Some(PlotSink::spawn(
                plot_rx,
                Some(sink_control),
                names,
                axis,
                self.config.plot_bin,
                renderer,
            ));
            data_taps.push(plot_tx);
        }
        if let Some(tap) = &self.extra_tap {
            data_taps.push(tap.clone());
        }

        if !queued {
            registry::register(&as_active);
        }

        let base_elapsed = *self.shared.accumulated.lock();
        self.shared.progress.update(|p| {
            p.state = if ramp_plan.is_some() {
                SweepState::RampingToStart
            } else {
                SweepState::Running
            };
            p.total_points = total;
        });

        log::info!("starting {}", self.describe());

        let shared = self.shared.clone();
        let on_complete = self.on_complete.clone();
        let measurement_slot = self.measurement_slot.clone();
        let finish_measurement = self.finish_measurement;
        let spec = RunnerSpec {
            describe: self.describe(),
            progress: self.shared.progress.clone(),
            kind_slot: self.kind_slot.clone(),
            follow: self.follow.clone(),
            persist: self.persist,
            control_rx,
            data_taps,
            measurement,
            inter_delay: self.config.inter_delay,
            ramp: ramp_plan,
            base_elapsed,
            keep_measurement: (!finish_measurement).then_some(measurement_slot),
            on_exit: Box::new(move |final_state, elapsed| {
                *shared.accumulated.lock() = elapsed;
                *shared.control_tx.lock() = None;
                registry::deregister(shared.id);
                if let Some(context) = context_to_close {
                    context.close();
                }
                if let Some(callback) = on_complete {
                    callback(final_state);
                }
            }),
        };
        self.worker = Some(runner::spawn(spec));
        Ok(())
    }

    /// Column schema in emission order: controlled, persist, follows,
    /// elapsed time.
    fn column_schema(&self, controlled: &[Parameter]) -> Vec<ColumnSpec> {
        let mut columns: Vec<ColumnSpec> = controlled
            .iter()
            .map(|p| ColumnSpec::new(p.key(), p.label(), p.unit()))
            .collect();
        if let Some(outer) = &self.persist_param() {
            columns.push(ColumnSpec::new(outer.key(), outer.label(), outer.unit()));
        }
        columns.extend(
            self.follow
                .iter()
                .map(|p| ColumnSpec::new(p.key(), p.label(), p.unit())),
        );
        columns.push(ColumnSpec::new("time", "time", "s"));
        columns
    }

    /// Graceful drain: finish the in-flight point, then transition Done.
    /// Idempotent; a no-op when nothing is running.
    pub fn stop(&mut self) {
        if !self.shared.send_control(ControlMessage::Stop) {
            log::info!("{}: not currently running, nothing to stop", self.describe());
        }
    }

    /// Abrupt termination at the next control checkpoint.
    pub fn kill(&mut self) {
        let state = self.state();
        if state.is_terminal() {
            return;
        }
        if !self.shared.send_control(ControlMessage::Kill) {
            self.shared.progress.set_state(SweepState::Killed);
            registry::deregister(self.shared.id);
        }
        self.reap_worker();
    }

    /// Continue a paused or stopped sweep.
    ///
    /// A paused worker resumes in place. A stopped (Done) sweep re-runs
    /// from the last emitted point, or from the trajectory start when
    /// `restart_on_resume` is configured. Errored or killed sweeps must be
    /// cleared first.
    pub fn resume(&mut self) -> Result<()> {
        match self.state() {
            SweepState::Paused => {
                self.shared.send_control(ControlMessage::Resume);
                Ok(())
            }
            SweepState::Ready | SweepState::Done => {
                self.reap_worker();
                if self.config.restart_on_resume {
                    if let Some(kind) = self.kind_slot.lock().as_mut() {
                        kind.reset_cursor();
                    }
                }
                self.shared.progress.update(|p| p.state = SweepState::Ready);
                self.start_impl(false, false)
            }
            state => Err(SweepError::config(format!(
                "cannot resume {} from state {state}",
                self.describe()
            ))),
        }
    }

    /// Flip at the next trajectory boundary. Legal only while running on a
    /// kind that sweeps bidirectionally or listens.
    pub fn flip_direction(&mut self) -> Result<()> {
        if self.state() != SweepState::Running {
            return Err(SweepError::config(
                "flip_direction is only legal while the sweep is running",
            ));
        }
        self.shared.send_control(ControlMessage::FlipDirection);
        Ok(())
    }

    /// Forward a keyboard control from a UI surface.
    pub fn send_key(&self, key: crate::plot::KeyCommand) {
        if let Some(sink) = &self.plot_sink {
            sink.send_key(key);
        }
    }

    /// Reset the error triple; the only way to re-run after Error.
    pub fn clear_error(&mut self) -> Result<()> {
        if self.state() != SweepState::Error {
            return Err(SweepError::config("clear_error requires the Error state"));
        }
        self.reap_worker();
        self.shared.progress.clear_error();
        Ok(())
    }

    /// Return a terminal sweep to Ready, rewinding the cursor and zeroing
    /// the counters.
    pub fn reset(&mut self) -> Result<()> {
        let state = self.state();
        if state.is_active() || state == SweepState::Paused {
            return Err(SweepError::config("cannot reset a running sweep"));
        }
        self.reap_worker();
        if let Some(kind) = self.kind_slot.lock().as_mut() {
            kind.reset_cursor();
        }
        *self.shared.accumulated.lock() = 0.0;
        self.shared.progress.update(|p| {
            *p = ProgressState::default();
        });
        Ok(())
    }

    /// Block until the sweep reaches a terminal state.
    pub fn wait_done(&self, timeout: Duration) -> Option<ProgressState> {
        self.shared.progress.wait_terminal(timeout)
    }

    /// Ramp every controlled parameter to `value` at the sweep's pace
    /// without starting an acquisition.
    ///
    /// Blocks the calling thread until the ramp converges or the
    /// configured ramp timeout elapses. Legal only while the sweep is
    /// idle; kinds with no settable trajectory (time-only, listening)
    /// have nothing to ramp and return an error.
    pub fn ramp_to(&mut self, value: f64) -> Result<()> {
        if self.state().is_active() {
            return Err(SweepError::config(
                "stop the sweep before ramping its parameters",
            ));
        }
        let targets = {
            let slot = self.kind_slot.lock();
            let kind = slot
                .as_ref()
                .ok_or_else(|| SweepError::config("sweep kind is unavailable"))?;
            kind.ramp_targets()
        };
        if targets.is_empty() {
            return Err(SweepError::config(format!(
                "{} has no controlled parameter to ramp",
                self.describe()
            )));
        }

        let deadline = std::time::Instant::now() + self.config.ramp_timeout;
        for target in &targets {
            let step = (target.step * self.config.ramp_multiplier).abs();
            let tolerance = (target.step.abs() / 2.0)
                .max(self.config.ramp_tolerance * target.step.abs());
            let current = target.parameter.safe_get()?;
            let distance = value - current;
            if distance.abs() > tolerance {
                log::info!(
                    "ramping {} from {current} to {value}",
                    target.parameter.key()
                );
                let signed_step = step.copysign(distance);
                let mut cursor = current;
                while (value - cursor).abs() > signed_step.abs() {
                    if std::time::Instant::now() > deadline {
                        return Err(SweepError::RampConvergence {
                            parameter: target.parameter.key(),
                            expected: value,
                            actual: target.parameter.safe_get().unwrap_or(f64::NAN),
                            tolerance,
                        });
                    }
                    cursor += signed_step;
                    target.parameter.safe_set(cursor)?;
                    std::thread::sleep(Duration::from_secs_f64(self.config.inter_delay));
                }
            }
            target.parameter.safe_set(value)?;
            let actual = target.parameter.safe_get()?;
            if (actual - value).abs() > tolerance {
                return Err(SweepError::RampConvergence {
                    parameter: target.parameter.key(),
                    expected: value,
                    actual,
                    tolerance,
                });
            }
        }
        Ok(())
    }

    /// Ramp every controlled parameter back to zero.
    pub fn ramp_to_zero(&mut self) -> Result<()> {
        self.ramp_to(0.0)
    }

    /// Estimated seconds to completion, from the kind's trajectory.
    pub fn estimate_time(&self) -> Option<f64> {
        let slot = self.kind_slot.lock();
        let remaining = slot
            .as_ref()
            .and_then(|kind| kind.estimate_remaining(self.config.inter_delay));
        if let Some(secs) = remaining {
            let (h, m, s) = split_hms(secs);
            log::info!(
                "estimated time remaining for {}: {h}h:{m:02}m:{s:02}s",
                self.describe()
            );
        }
        remaining
    }

    /// Export the self-describing metadata record.
    pub fn export_metadata(&self) -> Value {
        let slot = self.kind_slot.lock();
        let mut record = MetadataRecord::new(self.kind_name)
            .attribute("inter_delay", self.config.inter_delay)
            .attribute("plot_bin", self.config.plot_bin as u64)
            .attribute("plot_data", self.config.plot_data)
            .attribute("save_data", self.save_target.is_some());
        if let Some(kind) = slot.as_ref() {
            record = kind.export(record);
        }
        for p in &self.follow {
            record = record.followed(p);
        }
        record.build()
    }

    /// Rebuild a sweep from an exported metadata record, resolving
    /// parameter identities against `station`.
    pub fn from_metadata(record: &Value, station: &Station) -> Result<Sweep> {
        crate::sweep::import::sweep_from_metadata(record, station)
    }

    /// Mark this sweep as queue-driven; queued sweeps bypass the
    /// active-sweep registry.
    pub fn set_queued(&mut self, queued: bool) {
        self.shared.queued.store(queued, Ordering::Relaxed);
    }

    pub(crate) fn shared(&self) -> Arc<SweepShared> {
        self.shared.clone()
    }

    pub(crate) fn set_parent(&mut self, parent: &Arc<SweepShared>) {
        *self.shared.parent.lock() = Arc::downgrade(parent);
    }

    pub(crate) fn set_persist(&mut self, value: Option<f64>) {
        self.persist = value;
    }

    fn persist_param(&self) -> Option<Parameter> {
        self.persist_param_decl.clone()
    }

    pub(crate) fn set_persist_param(&mut self, param: Option<Parameter>) {
        self.persist_param_decl = param;
    }

    pub(crate) fn set_finish_measurement(&mut self, finish: bool) {
        self.finish_measurement = finish;
    }

    pub(crate) fn park_measurement(&mut self, handle: MeasurementHandle) {
        *self.measurement_slot.lock() = Some(handle);
    }

    pub(crate) fn take_measurement(&mut self) -> Option<MeasurementHandle> {
        self.measurement_slot.lock().take()
    }

    pub(crate) fn set_extra_tap(&mut self, tap: Option<Sender<DataEvent>>) {
        self.extra_tap = tap;
    }

    pub(crate) fn set_advisory(&mut self, tx: Option<Sender<ControlMessage>>) {
        self.advisory_tx = tx;
    }

    /// Re-arm an inner sweep between outer passes: rewind the trajectory,
    /// return to Ready, clear the per-pass point counter. The elapsed
    /// clock keeps running so the time column is monotone across the whole
    /// composite.
    pub(crate) fn prepare_next_pass(&mut self) {
        self.reap_worker();
        if let Some(kind) = self.kind_slot.lock().as_mut() {
            kind.reset_cursor();
        }
        self.shared.progress.update(|p| {
            p.state = SweepState::Ready;
            p.points_emitted = 0;
            p.direction = 1;
        });
    }

    /// Join a worker that has already exited so the thread handle does not
    /// leak across runs.
    fn reap_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.is_finished() {
                let _ = worker.join();
            } else if self.state().is_terminal() || self.state() == SweepState::Ready {
                let _ = worker.join();
            } else {
                self.worker = Some(worker);
            }
        }
    }
}

impl Drop for Sweep {
    fn drop(&mut self) {
        if self.state().is_active() {
            self.kill();
        }
    }
}

/// Object-safe surface over every sweep shape, used by the queue and
/// other supervisors that hold heterogeneous sweeps.
pub trait AnySweep: Send {
    fn describe(&self) -> String;
    fn state(&self) -> SweepState;
    fn progress(&self) -> ProgressState;
    /// Queue-driven sweeps bypass the active-sweep registry.
    fn set_queued(&mut self, queued: bool);
    fn attach_save(&mut self, target: SaveTarget);
    fn start(&mut self, ramp_to_start: bool) -> Result<()>;
    fn stop(&mut self);
    fn kill(&mut self);
    fn wait_done(&self, timeout: Duration) -> Option<ProgressState>;
    fn export_metadata(&self) -> Value;
    fn estimate_time(&self) -> Option<f64>;
}

impl AnySweep for Sweep {
    fn describe(&self) -> String {
        Sweep::describe(self)
    }
    fn state(&self) -> SweepState {
        Sweep::state(self)
    }
    fn progress(&self) -> ProgressState {
        Sweep::progress(self)
    }
    fn set_queued(&mut self, queued: bool) {
        Sweep::set_queued(self, queued)
    }
    fn attach_save(&mut self, target: SaveTarget) {
        Sweep::attach_save(self, target)
    }
    fn start(&mut self, ramp_to_start: bool) -> Result<()> {
        if ramp_to_start {
            Sweep::start(self)
        } else {
            Sweep::start_without_ramp(self)
        }
    }
    fn stop(&mut self) {
        Sweep::stop(self)
    }
    fn kill(&mut self) {
        Sweep::kill(self)
    }
    fn wait_done(&self, timeout: Duration) -> Option<ProgressState> {
        Sweep::wait_done(self, timeout)
    }
    fn export_metadata(&self) -> Value {
        Sweep::export_metadata(self)
    }
    fn estimate_time(&self) -> Option<f64> {
        Sweep::estimate_time(self)
    }
}

impl AnySweep for sweep2d::Sweep2D {
    fn describe(&self) -> String {
        sweep2d::Sweep2D::describe(self)
    }
    fn state(&self) -> SweepState {
        sweep2d::Sweep2D::state(self)
    }
    fn progress(&self) -> ProgressState {
        sweep2d::Sweep2D::progress(self)
    }
    fn set_queued(&mut self, queued: bool) {
        sweep2d::Sweep2D::set_queued(self, queued)
    }
    fn attach_save(&mut self, target: SaveTarget) {
        sweep2d::Sweep2D::attach_save(self, target)
    }
    fn start(&mut self, ramp_to_start: bool) -> Result<()> {
        if ramp_to_start {
            sweep2d::Sweep2D::start(self)
        } else {
            sweep2d::Sweep2D::start_without_ramp(self)
        }
    }
    fn stop(&mut self) {
        sweep2d::Sweep2D::stop(self)
    }
    fn kill(&mut self) {
        sweep2d::Sweep2D::kill(self)
    }
    fn wait_done(&self, timeout: Duration) -> Option<ProgressState> {
        sweep2d::Sweep2D::wait_done(self, timeout)
    }
    fn export_metadata(&self) -> Value {
        sweep2d::Sweep2D::export_metadata(self)
    }
    fn estimate_time(&self) -> Option<f64> {
        sweep2d::Sweep2D::estimate_time(self)
    }
}

fn split_hms(seconds: f64) -> (u64, u64, u64) {
    let total = seconds.max(0.0).round() as u64;
    (total / 3600, (total % 3600) / 60, total % 60)
}

/// Configuration setters shared by every kind builder. Expects the builder
/// to carry `cfg: SweepConfig`, `save: Option<SaveTarget>` and
/// `renderer: Option<Box<dyn PlotRenderer>>` fields.
macro_rules! builder_common {
    () => {
        /// Seconds between points. Must be at least 0.01 s.
        pub fn inter_delay(mut self, seconds: f64) -> Self {
            self.cfg.inter_delay = seconds;
            self
        }

        /// Enable or disable the live plot sink.
        pub fn plot(mut self, plot: bool) -> Self {
            self.cfg.plot_data = plot;
            self
        }

        /// Call the renderer every `bin` points.
        pub fn plot_bin(mut self, bin: usize) -> Self {
            self.cfg.plot_bin = bin.max(1);
            self
        }

        /// Route rows into this dataset target.
        pub fn save_to(mut self, target: $crate::storage::SaveTarget) -> Self {
            self.save = Some(target);
            self
        }

        /// Renderer driven by the plot sink.
        pub fn renderer(mut self, renderer: Box<dyn $crate::plot::PlotRenderer>) -> Self {
            self.renderer = Some(renderer);
            self
        }

        /// Make `resume()` rewind to the trajectory start instead of
        /// continuing from the last emitted point.
        pub fn restart_on_resume(mut self, restart: bool) -> Self {
            self.cfg.restart_on_resume = restart;
            self
        }

        /// Scale the trajectory step during ramp-to-start.
        pub fn ramp_multiplier(mut self, multiplier: f64) -> Self {
            self.cfg.ramp_multiplier = multiplier;
            self
        }

        /// Wall-clock limit for the ramp-to-start phase.
        pub fn ramp_timeout(mut self, timeout: std::time::Duration) -> Self {
            self.cfg.ramp_timeout = timeout;
            self
        }
    };
}
pub(crate) use builder_common;

/// Assemble a sweep from builder pieces. Shared tail of every `build()`.
pub(crate) fn finish_build(
    kind: Box<dyn StepKind>,
    cfg: SweepConfig,
    save: Option<SaveTarget>,
    renderer: Option<Box<dyn PlotRenderer>>,
) -> Result<Sweep> {
    let mut sweep = Sweep::assemble(kind, cfg)?;
    if let Some(target) = save {
        sweep.attach_save(target);
    }
    if let Some(renderer) = renderer {
        sweep.set_renderer(renderer);
    }
    Ok(sweep)
}
