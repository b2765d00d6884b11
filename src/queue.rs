//! Sweep queue: ordered acquisition runs with per-sweep persistence.
//!
//! A queue holds sweeps, user callables, and persistence-target switches.
//! A supervisor thread pops entries in order: sweeps get their dataset
//! context attached and run to a terminal state; callables run inline;
//! target switches rotate the dataset used by subsequent sweeps. Any entry
//! error moves the queue to Error and preserves the remaining entries.

use crate::error::{Result, SweepError};
use crate::progress::{SharedProgress, SweepState};
use crate::storage::SaveTarget;
use crate::sweep::AnySweep;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// User hook runnable from the queue.
pub type QueueHook = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// One queued action.
pub enum QueueEntry {
    /// A sweep, optionally with its own dataset target.
    Sweep {
        sweep: Box<dyn AnySweep>,
        target: Option<SaveTarget>,
    },
    /// A callable invoked synchronously between sweeps.
    Call { label: String, hook: QueueHook },
    /// Rotate the dataset target for subsequent sweeps.
    Target(SaveTarget),
}

impl QueueEntry {
    pub fn sweep(sweep: impl AnySweep + 'static) -> Self {
        QueueEntry::Sweep {
            sweep: Box::new(sweep),
            target: None,
        }
    }

    /// A sweep recording into its own dataset target.
    pub fn sweep_saving(sweep: impl AnySweep + 'static, target: SaveTarget) -> Self {
        QueueEntry::Sweep {
            sweep: Box::new(sweep),
            target: Some(target),
        }
    }

    pub fn call(
        label: impl Into<String>,
        hook: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        QueueEntry::Call {
            label: label.into(),
            hook: Box::new(hook),
        }
    }

    pub fn target(target: SaveTarget) -> Self {
        QueueEntry::Target(target)
    }

    /// Label shown in logs and by [`SweepQueue::entries`].
    pub fn describe(&self) -> String {
        match self {
            QueueEntry::Sweep { sweep, .. } => sweep.describe(),
            QueueEntry::Call { label, .. } => format!("call {label}"),
            QueueEntry::Target(target) => format!("switch dataset to {target}"),
        }
    }
}

impl From<SaveTarget> for QueueEntry {
    fn from(target: SaveTarget) -> Self {
        QueueEntry::Target(target)
    }
}

/// Ordered runner of sweeps and hooks.
///
/// ```rust,ignore
/// let mut queue = SweepQueue::new();
/// queue += QueueEntry::sweep_saving(cooldown_sweep, SaveTarget::new("db", "cooldown", "s1"));
/// queue += QueueEntry::call("log", || { println!("halfway"); Ok(()) });
/// queue += QueueEntry::sweep(gate_sweep);
/// queue.start()?;
/// queue.wait_done(Duration::from_secs(3600));
/// ```
pub struct SweepQueue {
    entries: Arc<Mutex<VecDeque<QueueEntry>>>,
    progress: SharedProgress,
    /// Seconds between consecutive entries.
    inter_sweep_delay: f64,
    stop_flag: Arc<AtomicBool>,
    kill_flag: Arc<AtomicBool>,
    supervisor: Option<std::thread::JoinHandle<()>>,
}

impl Default for SweepQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SweepQueue {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            progress: SharedProgress::new(),
            inter_sweep_delay: 0.1,
            stop_flag: Arc::new(AtomicBool::new(false)),
            kill_flag: Arc::new(AtomicBool::new(false)),
            supervisor: None,
        }
    }

    /// Seconds to pause between consecutive entries.
    pub fn inter_sweep_delay(mut self, seconds: f64) -> Self {
        self.inter_sweep_delay = seconds.max(0.0);
        self
    }

    pub fn append(&mut self, entry: QueueEntry) {
        self.entries.lock().push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Labels of the remaining entries, front first.
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().iter().map(QueueEntry::describe).collect()
    }

    pub fn state(&self) -> SweepState {
        self.progress.state()
    }

    /// First error message, when the queue is in Error.
    pub fn error_message(&self) -> Option<String> {
        self.progress.snapshot().error_message
    }

    /// Estimated seconds for the remaining sweeps.
    pub fn estimate_time(&self) -> f64 {
        self.entries
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                QueueEntry::Sweep { sweep, .. } => sweep.estimate_time(),
                _ => None,
            })
            .sum()
    }

    /// Begin consuming entries on a supervisor thread.
    pub fn start(&mut self) -> Result<()> {
        if self.state().is_active() {
            return Err(SweepError::Queue(
                "queue is already running".to_string(),
            ));
        }
        if self.is_empty() {
            return Err(SweepError::Queue("no sweeps loaded".to_string()));
        }
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
        }
        self.stop_flag.store(false, Ordering::SeqCst);
        self.kill_flag.store(false, Ordering::SeqCst);
        self.progress.update(|p| {
            p.state = SweepState::Running;
            p.error_message = None;
            p.error_count = 0;
        });

        let supervisor = QueueSupervisor {
            entries: self.entries.clone(),
            progress: self.progress.clone(),
            inter_sweep_delay: self.inter_sweep_delay,
            stop_flag: self.stop_flag.clone(),
            kill_flag: self.kill_flag.clone(),
        };
        self.supervisor = Some(
            std::thread::Builder::new()
                .name("labsweep-queue".to_string())
                .spawn(move || supervisor.run())
                .expect("failed to spawn queue supervisor thread"),
        );
        Ok(())
    }

    /// Stop the current sweep gracefully and halt consumption. Remaining
    /// entries stay queued.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Kill the current sweep and halt consumption. Remaining entries
    /// stay queued.
    pub fn kill(&mut self) {
        self.kill_flag.store(true, Ordering::SeqCst);
    }

    /// Block until the queue reaches a terminal state.
    pub fn wait_done(&self, timeout: Duration) -> Option<SweepState> {
        self.progress.wait_terminal(timeout).map(|p| p.state)
    }

    /// Reset a terminal queue back to Ready, keeping its entries.
    pub fn reset(&mut self) -> Result<()> {
        if self.state().is_active() {
            return Err(SweepError::Queue("cannot reset a running queue".to_string()));
        }
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
        }
        self.progress.clear_error();
        Ok(())
    }
}

impl std::ops::AddAssign<QueueEntry> for SweepQueue {
    fn add_assign(&mut self, entry: QueueEntry) {
        self.append(entry);
    }
}

impl Drop for SweepQueue {
    fn drop(&mut self) {
        if self.state().is_active() {
            self.kill();
        }
    }
}

struct QueueSupervisor {
    entries: Arc<Mutex<VecDeque<QueueEntry>>>,
    progress: SharedProgress,
    inter_sweep_delay: f64,
    stop_flag: Arc<AtomicBool>,
    kill_flag: Arc<AtomicBool>,
}

impl QueueSupervisor {
    fn run(self) {
        let mut current_target: Option<SaveTarget> = None;
        let mut ran_anything = false;

        loop {
            if self.kill_flag.load(Ordering::SeqCst) {
                self.progress.set_state(SweepState::Killed);
                return;
            }
            if self.stop_flag.load(Ordering::SeqCst) {
                log::info!("queue stopped; {} entries remain", self.entries.lock().len());
                self.progress.set_state(SweepState::Done);
                return;
            }

            let entry = match self.entries.lock().pop_front() {
                Some(entry) => entry,
                None => {
                    log::info!("finished all queue entries");
                    self.progress.set_state(SweepState::Done);
                    return;
                }
            };

            if ran_anything && self.inter_sweep_delay > 0.0 {
                std::thread::sleep(Duration::from_secs_f64(self.inter_sweep_delay));
            }
            ran_anything = true;

            match entry {
                QueueEntry::Target(target) => {
                    log::info!("queue dataset target set to {target}");
                    current_target = Some(target);
                }
                QueueEntry::Call { label, hook } => {
                    log::info!("queue running callable '{label}'");
                    if let Err(e) = hook() {
                        log::error!("queue callable '{label}' failed: {e:#}");
                        self.progress
                            .mark_error(format!("queue callable '{label}' failed: {e:#}"));
                        return;
                    }
                }
                QueueEntry::Sweep { mut sweep, target } => {
                    if let Err(()) = self.run_sweep(&mut sweep, target, &current_target) {
                        return;
                    }
                }
            }
        }
    }

    /// Run one sweep to a terminal state. `Err(())` halts consumption;
    /// the queue state has already been set.
    fn run_sweep(
        &self,
        sweep: &mut Box<dyn AnySweep>,
        own_target: Option<SaveTarget>,
        current_target: &Option<SaveTarget>,
    ) -> std::result::Result<(), ()> {
        let label = sweep.describe();
        sweep.set_queued(true);
        if let Some(target) = own_target.clone().or_else(|| current_target.clone()) {
            sweep.attach_save(target);
        }

        log::info!("queue starting {label}");
        if let Err(e) = sweep.start(true) {
            log::error!("queue could not start {label}: {e}");
            self.progress
                .mark_error(format!("could not start {label}: {e}"));
            return Err(());
        }

        loop {
            if self.kill_flag.load(Ordering::SeqCst) {
                sweep.kill();
                let _ = sweep.wait_done(Duration::from_secs(10));
                self.progress.set_state(SweepState::Killed);
                return Err(());
            }
            if self.stop_flag.load(Ordering::SeqCst) {
                sweep.stop();
                let _ = sweep.wait_done(Duration::from_secs(60));
                self.progress.set_state(SweepState::Done);
                return Err(());
            }

            let Some(progress) = sweep.wait_done(Duration::from_millis(100)) else {
                continue;
            };
            return match progress.state {
                SweepState::Done => {
                    log::info!("queue finished {label}");
                    Ok(())
                }
                SweepState::Error => {
                    let cause = progress
                        .error_message
                        .unwrap_or_else(|| "unknown error".to_string());
                    log::error!("queue sweep {label} failed: {cause}");
                    self.progress.mark_error(format!("{label} failed: {cause}"));
                    Err(())
                }
                SweepState::Killed => {
                    log::warn!("queue sweep {label} was killed");
                    self.progress.set_state(SweepState::Killed);
                    Err(())
                }
                state => {
                    self.progress
                        .mark_error(format!("{label} ended in unexpected state {state}"));
                    Err(())
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[test]
    fn entries_report_their_labels() {
        let mut queue = SweepQueue::new();
        queue += QueueEntry::call("flush caches", || Ok(()));
        queue += QueueEntry::target(SaveTarget::new("db", "exp", "s1"));
        assert_eq!(queue.len(), 2);
        let labels = queue.entries();
        assert!(labels[0].contains("flush caches"));
        assert!(labels[1].contains("db/exp/s1"));
    }

    #[test]
    fn empty_queue_refuses_to_start() {
        let mut queue = SweepQueue::new();
        assert!(matches!(queue.start(), Err(SweepError::Queue(_))));
    }

    #[test]
    fn callables_run_in_order_and_finish_the_queue() {
        let order = Arc::new(PlMutex::new(Vec::new()));
        let mut queue = SweepQueue::new().inter_sweep_delay(0.0);
        for i in 0..3 {
            let order = order.clone();
            queue += QueueEntry::call(format!("hook {i}"), move || {
                order.lock().push(i);
                Ok(())
            });
        }
        queue.start().unwrap();
        assert_eq!(queue.wait_done(Duration::from_secs(5)), Some(SweepState::Done));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn failing_callable_preserves_remaining_entries() {
        let mut queue = SweepQueue::new().inter_sweep_delay(0.0);
        queue += QueueEntry::call("bad", || anyhow::bail!("instrument unplugged"));
        queue += QueueEntry::call("never runs", || Ok(()));
        queue.start().unwrap();
        assert_eq!(
            queue.wait_done(Duration::from_secs(5)),
            Some(SweepState::Error)
        );
        assert_eq!(queue.len(), 1);
        assert!(queue.error_message().unwrap().contains("instrument unplugged"));
    }
}
