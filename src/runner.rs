//! The acquisition worker: one background OS thread per running sweep.
//!
//! The runner owns the step loop. Each iteration is a *point*: advance the
//! sweep kind, read the follow set, timestamp, append the row to
//! persistence (blocking), push the tuple to the plot channel (bounded,
//! dropped under backpressure), update the shared progress, then sleep the
//! remainder of the cadence. Control messages are handled strictly between
//! points.

use crate::error::{Result, SweepError};
use crate::parameter::Parameter;
use crate::progress::{Direction, SharedProgress, SweepState};
use crate::storage::MeasurementHandle;
use crate::sweep::{RampTarget, StepContext, StepKind, StepOutcome};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Supervisor → runner commands. Processed between points, never inside
/// one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlMessage {
    /// Graceful drain: finish the in-flight point, then exit Done.
    Stop,
    /// Abandon the current run at the next checkpoint.
    Kill,
    Pause,
    Resume,
    FlipDirection,
    /// Change the cadence (seconds) for subsequent points.
    SetInterDelay(f64),
    /// Change the step size of the controlled trajectory.
    SetStep(f64),
}

/// Runner → sinks data stream.
#[derive(Debug, Clone, PartialEq)]
pub enum DataEvent {
    Point {
        /// Seconds since the sweep first started (monotonic).
        elapsed: f64,
        /// Controlled setpoints in declared order.
        setpoints: Vec<f64>,
        /// Outer-sweep value carried on composed sweeps.
        persist: Option<f64>,
        /// Follow-set readings in declared order.
        values: Vec<f64>,
        direction: Direction,
    },
    /// Direction change or line boundary; rendered as a gap.
    Break { direction: Direction },
    /// Final event of a run; sinks flush and exit.
    Complete,
}

/// Ramp-to-start plan executed before the step loop.
pub(crate) struct RampPlan {
    pub targets: Vec<RampTarget>,
    /// Scales the trajectory step for the ramp passes.
    pub multiplier: f64,
    /// Hard cap on the per-step delta, when configured.
    pub step_cap: Option<f64>,
    pub timeout: Duration,
    /// Convergence tolerance as a fraction of the step size.
    pub tolerance_factor: f64,
}

/// Everything the worker thread needs, assembled by the sweep.
pub(crate) struct RunnerSpec {
    pub describe: String,
    pub progress: SharedProgress,
    pub kind_slot: Arc<Mutex<Option<Box<dyn StepKind>>>>,
    pub follow: Vec<Parameter>,
    /// Outer value appended to every row on composed sweeps.
    pub persist: Option<f64>,
    pub control_rx: Receiver<ControlMessage>,
    pub data_taps: Vec<Sender<DataEvent>>,
    pub measurement: Option<MeasurementHandle>,
    pub inter_delay: f64,
    pub ramp: Option<RampPlan>,
    /// Elapsed seconds accumulated by previous runs of this sweep.
    pub base_elapsed: f64,
    /// When set, the measurement handle is flushed and parked back into
    /// this slot on exit instead of being finished; composed sweeps reuse
    /// one handle across every inner pass.
    pub keep_measurement: Option<Arc<Mutex<Option<MeasurementHandle>>>>,
    /// Invoked exactly once when the worker exits, with the final state
    /// and the total elapsed time.
    pub on_exit: Box<dyn FnOnce(SweepState, f64) + Send>,
}

/// Spawn the acquisition worker for a prepared sweep.
pub(crate) fn spawn(spec: RunnerSpec) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("labsweep-runner".to_string())
        .spawn(move || Worker::new(spec).run())
        .expect("failed to spawn runner thread")
}

enum LoopExit {
    Finished,
    Stopped,
    Killed,
    Failed(SweepError),
}

struct Worker {
    describe: String,
    progress: SharedProgress,
    kind_slot: Arc<Mutex<Option<Box<dyn StepKind>>>>,
    follow: Vec<Parameter>,
    persist: Option<f64>,
    control_rx: Receiver<ControlMessage>,
    data_taps: Vec<Sender<DataEvent>>,
    measurement: Option<MeasurementHandle>,
    inter_delay: f64,
    ramp: Option<RampPlan>,
    base_elapsed: f64,
    keep_measurement: Option<Arc<Mutex<Option<MeasurementHandle>>>>,
    on_exit: Option<Box<dyn FnOnce(SweepState, f64) + Send>>,
    t0: Instant,
    stop_requested: bool,
    kill_requested: bool,
}

impl Worker {
    fn new(spec: RunnerSpec) -> Self {
        Self {
            describe: spec.describe,
            progress: spec.progress,
            kind_slot: spec.kind_slot,
            follow: spec.follow,
            persist: spec.persist,
            control_rx: spec.control_rx,
            data_taps: spec.data_taps,
            measurement: spec.measurement,
            inter_delay: spec.inter_delay.max(0.0),
            ramp: spec.ramp,
            base_elapsed: spec.base_elapsed,
            keep_measurement: spec.keep_measurement,
            on_exit: Some(spec.on_exit),
            t0: Instant::now(),
            stop_requested: false,
            kill_requested: false,
        }
    }

    fn elapsed(&self) -> f64 {
        self.base_elapsed + self.t0.elapsed().as_secs_f64()
    }

    fn run(mut self) {
        let mut kind = match self.kind_slot.lock().take() {
            Some(kind) => kind,
            None => {
                // A second worker raced us; nothing to do.
                log::error!("runner for {} found no step kind", self.describe);
                return;
            }
        };

        let exit = self.drive(&mut kind);

        let final_state = match exit {
            LoopExit::Finished => {
                log::info!("sweep complete: {}", self.describe);
                SweepState::Done
            }
            LoopExit::Stopped => {
                log::info!("sweep stopped: {}", self.describe);
                SweepState::Done
            }
            LoopExit::Killed => {
                log::warn!("sweep killed: {}", self.describe);
                SweepState::Killed
            }
            LoopExit::Failed(ref err) => {
                log::error!("sweep error in {}: {}", self.describe, err);
                SweepState::Error
            }
        };

        // Error state carries its message through mark_error so readers
        // never observe Error without one.
        match exit {
            LoopExit::Failed(err) => self.progress.mark_error(err.to_string()),
            _ => self.progress.set_state(final_state),
        }

        if let Some(mut handle) = self.measurement.take() {
            match &self.keep_measurement {
                Some(slot) => {
                    if let Err(e) = handle.flush() {
                        log::error!("flushing dataset for {} failed: {}", self.describe, e);
                    }
                    *slot.lock() = Some(handle);
                }
                None => {
                    if let Err(e) = handle.finish() {
                        log::error!("closing dataset for {} failed: {}", self.describe, e);
                    }
                }
            }
        }
        self.broadcast_blocking(DataEvent::Complete);

        *self.kind_slot.lock() = Some(kind);

        let elapsed = self.elapsed();
        if let Some(on_exit) = self.on_exit.take() {
            on_exit(final_state, elapsed);
        }
    }

    fn drive(&mut self, kind: &mut Box<dyn StepKind>) -> LoopExit {
        if let Some(ramp) = self.ramp.take() {
            self.progress.set_state(SweepState::RampingToStart);
            match self.run_ramp(&ramp) {
                Ok(true) => {}
                Ok(false) => {
                    return if self.kill_requested {
                        LoopExit::Killed
                    } else {
                        LoopExit::Stopped
                    }
                }
                Err(e) => return LoopExit::Failed(e),
            }
        }

        self.progress.update(|p| {
            p.state = SweepState::Running;
            p.total_points = kind.total_points();
            p.direction = kind.direction();
        });

        loop {
            if let Some(exit) = self.drain_control(kind) {
                return exit;
            }
            if self.progress.state() == SweepState::Paused {
                if let Some(exit) = self.wait_while_paused(kind) {
                    return exit;
                }
            }
            // Any point in flight when Stop arrived has completed by now.
            if self.stop_requested {
                return LoopExit::Stopped;
            }

            let tick = Instant::now();
            let ctx = StepContext {
                elapsed: self.elapsed(),
            };
            let outcome = match kind.run_step(&ctx) {
                Ok(outcome) => outcome,
                Err(e) => return LoopExit::Failed(e),
            };

            match outcome {
                StepOutcome::Point(setpoints) => {
                    match self.emit_point(kind, setpoints) {
                        Ok(Some(exit)) => return exit,
                        Ok(None) => {}
                        Err(e) => return LoopExit::Failed(e),
                    }
                }
                StepOutcome::Break => {
                    let direction = kind.direction();
                    self.progress.update(|p| p.direction = direction);
                    self.broadcast_blocking(DataEvent::Break { direction });
                    // No cadence wait on a direction boundary.
                    continue;
                }
                StepOutcome::Idle => {}
                StepOutcome::Finished => return LoopExit::Finished,
            }

            self.smart_sleep(tick);
        }
    }

    /// Emit one point: read follows, persist, publish, update progress.
    /// Returns an exit when a post-read predicate ends the run.
    fn emit_point(
        &mut self,
        kind: &mut Box<dyn StepKind>,
        setpoints: Vec<f64>,
    ) -> Result<Option<LoopExit>> {
        let mut follows = Vec::with_capacity(self.follow.len());
        for p in &self.follow {
            follows.push((p.clone(), p.safe_get()?));
        }
        let elapsed = self.elapsed();

        if let Some(handle) = self.measurement.as_mut() {
            let mut row =
                Vec::with_capacity(setpoints.len() + follows.len() + 2);
            row.extend_from_slice(&setpoints);
            if let Some(outer) = self.persist {
                row.push(outer);
            }
            row.extend(follows.iter().map(|(_, v)| *v));
            row.push(elapsed);
            handle.append(&row)?;
        }

        let direction = kind.direction();
        self.broadcast_droppable(DataEvent::Point {
            elapsed,
            setpoints: setpoints.clone(),
            persist: self.persist,
            values: follows.iter().map(|(_, v)| *v).collect(),
            direction,
        });

        self.progress.update(|p| {
            p.points_emitted += 1;
            p.current_setpoints = setpoints.clone();
            p.direction = direction;
        });

        match kind.after_read(&follows)? {
            crate::sweep::PostAction::Continue => Ok(None),
            crate::sweep::PostAction::Break => {
                let direction = kind.direction();
                self.progress.update(|p| p.direction = direction);
                self.broadcast_blocking(DataEvent::Break { direction });
                Ok(None)
            }
            crate::sweep::PostAction::Finished => Ok(Some(LoopExit::Finished)),
        }
    }

    /// Handle every pending control message. Returns an exit for Kill.
    fn drain_control(&mut self, kind: &mut Box<dyn StepKind>) -> Option<LoopExit> {
        while let Ok(msg) = self.control_rx.try_recv() {
            if let Some(exit) = self.apply_control(msg, kind) {
                return Some(exit);
            }
        }
        None
    }

    fn apply_control(
        &mut self,
        msg: ControlMessage,
        kind: &mut Box<dyn StepKind>,
    ) -> Option<LoopExit> {
        match msg {
            ControlMessage::Stop => {
                // Idempotent; the drain completes the in-flight point.
                if !self.stop_requested {
                    log::info!("stop requested for {}", self.describe);
                    self.stop_requested = true;
                    self.progress.set_state(SweepState::Stopping);
                }
            }
            ControlMessage::Kill => {
                self.kill_requested = true;
                return Some(LoopExit::Killed);
            }
            ControlMessage::Pause => {
                if self.progress.state() == SweepState::Running {
                    log::info!("paused {}", self.describe);
                    self.progress.set_state(SweepState::Paused);
                }
            }
            ControlMessage::Resume => {
                if self.progress.state() == SweepState::Paused {
                    log::info!("resumed {}", self.describe);
                    self.progress.set_state(SweepState::Running);
                }
            }
            ControlMessage::FlipDirection => {
                if kind.supports_flip() {
                    if let Err(e) = kind.flip_direction() {
                        log::warn!("flip rejected for {}: {}", self.describe, e);
                    } else {
                        let direction = kind.direction();
                        self.progress.update(|p| p.direction = direction);
                        self.broadcast_blocking(DataEvent::Break { direction });
                    }
                } else {
                    log::warn!(
                        "{} does not support direction flips",
                        self.describe
                    );
                }
            }
            ControlMessage::SetInterDelay(secs) => {
                if secs.is_finite() && secs >= 0.0 {
                    self.inter_delay = secs;
                }
            }
            ControlMessage::SetStep(step) => {
                if let Err(e) = kind.set_step(step) {
                    log::warn!("step change rejected for {}: {}", self.describe, e);
                }
            }
        }
        None
    }

    /// Park until resumed. Returns Some(exit) to leave the step loop.
    fn wait_while_paused(&mut self, kind: &mut Box<dyn StepKind>) -> Option<LoopExit> {
        loop {
            match self.control_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(msg) => {
                    if let Some(exit) = self.apply_control(msg, kind) {
                        return Some(exit);
                    }
                    if self.progress.state() != SweepState::Paused || self.stop_requested {
                        return None;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.progress.state() != SweepState::Paused {
                        return None;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Some(LoopExit::Killed);
                }
            }
        }
    }

    /// Ramp every target parameter to its start value. Returns Ok(false)
    /// when interrupted by stop/kill.
    fn run_ramp(&mut self, plan: &RampPlan) -> Result<bool> {
        let deadline = Instant::now() + plan.timeout;
        for target in &plan.targets {
            let mut step = (target.step * plan.multiplier).abs();
            if let Some(cap) = plan.step_cap {
                step = step.min(cap.abs());
            }
            if step == 0.0 {
                return Err(SweepError::config(
                    "ramp step must be non-zero".to_string(),
                ));
            }
            let current = target.parameter.safe_get()?;
            let distance = target.target - current;
            let tolerance =
                (target.step.abs() / 2.0).max(plan.tolerance_factor * target.step.abs());

            if distance.abs() > tolerance {
                log::info!(
                    "ramping {} from {} to {} (step {})",
                    target.parameter.key(),
                    current,
                    target.target,
                    step
                );
                let signed_step = step.copysign(distance);
                let mut value = current;
                loop {
                    while let Ok(msg) = self.control_rx.try_recv() {
                        match msg {
                            ControlMessage::Kill => {
                                self.kill_requested = true;
                                return Ok(false);
                            }
                            ControlMessage::Stop => {
                                self.stop_requested = true;
                                return Ok(false);
                            }
                            _ => {}
                        }
                    }
                    if Instant::now() > deadline {
                        return Err(SweepError::RampConvergence {
                            parameter: target.parameter.key(),
                            expected: target.target,
                            actual: target.parameter.safe_get().unwrap_or(f64::NAN),
                            tolerance,
                        });
                    }
                    let remaining = target.target - value;
                    if remaining.abs() <= signed_step.abs() {
                        break;
                    }
                    value += signed_step;
                    target.parameter.safe_set(value)?;
                    std::thread::sleep(Duration::from_secs_f64(self.inter_delay));
                }
                target.parameter.safe_set(target.target)?;
            } else {
                // Already in tolerance; pin the exact start value.
                target.parameter.safe_set(target.target)?;
            }

            let actual = target.parameter.safe_get()?;
            if (actual - target.target).abs() > tolerance {
                return Err(SweepError::RampConvergence {
                    parameter: target.parameter.key(),
                    expected: target.target,
                    actual,
                    tolerance,
                });
            }
        }
        Ok(true)
    }

    /// Sleep whatever remains of the cadence after the point's own cost.
    fn smart_sleep(&self, tick: Instant) {
        let spent = tick.elapsed().as_secs_f64();
        let remaining = self.inter_delay - spent;
        if remaining > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(remaining));
        }
    }

    /// Points may be dropped under backpressure; renders are best-effort.
    fn broadcast_droppable(&self, event: DataEvent) {
        for tap in &self.data_taps {
            let _ = tap.try_send(event.clone());
        }
    }

    /// Markers must not be lost: breaks segment the stream and Complete
    /// releases the sinks.
    fn broadcast_blocking(&self, event: DataEvent) {
        for tap in &self.data_taps {
            let _ = tap.send_timeout(event.clone(), Duration::from_secs(1));
        }
    }
}
