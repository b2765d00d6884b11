//! Process-wide registry enforcing at-most-one unrelated running sweep.
//!
//! The registry holds weak back-references only; a sweep dropped by its
//! owner disappears from the registry on the next sweep-start. Queue-driven
//! sweeps never enter the registry (the queue serializes its own entries).

use crate::error::{Result, SweepError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_SWEEP_ID: AtomicU64 = AtomicU64::new(1);
static ACTIVE_SWEEPS: Mutex<Vec<Weak<dyn ActiveSweep>>> = Mutex::new(Vec::new());

/// Allocate a process-unique sweep identifier.
pub fn next_sweep_id() -> u64 {
    NEXT_SWEEP_ID.fetch_add(1, Ordering::Relaxed)
}

/// The registry's view of a sweep: identity, ancestry, liveness, kill.
pub trait ActiveSweep: Send + Sync {
    fn sweep_id(&self) -> u64;
    /// The owning (outer) sweep, for composed sweeps.
    fn parent_sweep(&self) -> Option<Arc<dyn ActiveSweep>>;
    /// Whether the sweep still holds an acquisition worker.
    fn is_active(&self) -> bool;
    /// Abrupt termination, used by `start_force`.
    fn kill_sweep(&self);
    /// Human-readable description for errors and logs.
    fn describe(&self) -> String;
}

/// The chain of sweep ids from `sweep` up to its root. The parent relation
/// is a tree by construction, so the walk terminates; the depth guard only
/// protects against a misassembled hierarchy.
fn ancestor_ids(sweep: &Arc<dyn ActiveSweep>) -> Vec<u64> {
    let mut ids = vec![sweep.sweep_id()];
    let mut cursor = sweep.parent_sweep();
    while let Some(node) = cursor {
        if ids.len() > 64 || ids.contains(&node.sweep_id()) {
            break;
        }
        ids.push(node.sweep_id());
        cursor = node.parent_sweep();
    }
    ids
}

/// Two sweeps are related iff their ancestor chains intersect: same sweep,
/// ancestor/descendant, or siblings under a common outer sweep.
pub fn is_related(a: &Arc<dyn ActiveSweep>, b: &Arc<dyn ActiveSweep>) -> bool {
    let ids_a = ancestor_ids(a);
    ancestor_ids(b).iter().any(|id| ids_a.contains(id))
}

fn collect_live(members: &mut Vec<Weak<dyn ActiveSweep>>) -> Vec<Arc<dyn ActiveSweep>> {
    members.retain(|w| w.strong_count() > 0);
    members.iter().filter_map(Weak::upgrade).collect()
}

/// Fail when an unrelated sweep is currently active.
pub fn check_no_unrelated(candidate: &Arc<dyn ActiveSweep>) -> Result<()> {
    let mut members = ACTIVE_SWEEPS.lock();
    for member in collect_live(&mut members) {
        if member.is_active() && !is_related(&member, candidate) {
            return Err(SweepError::Concurrency(format!(
                "Another sweep is active: {}. Stop it first or use start_force().",
                member.describe()
            )));
        }
    }
    Ok(())
}

/// Kill every active member unrelated to `candidate`. Returns how many
/// sweeps were killed.
pub fn kill_unrelated(candidate: &Arc<dyn ActiveSweep>) -> usize {
    let victims: Vec<Arc<dyn ActiveSweep>> = {
        let mut members = ACTIVE_SWEEPS.lock();
        collect_live(&mut members)
            .into_iter()
            .filter(|m| m.is_active() && !is_related(m, candidate))
            .collect()
    };
    // Kill outside the registry lock: kill paths deregister.
    for victim in &victims {
        log::warn!("start_force killing active sweep {}", victim.describe());
        victim.kill_sweep();
    }
    victims.len()
}

/// Insert a sweep. Idempotent per id.
pub fn register(sweep: &Arc<dyn ActiveSweep>) {
    let mut members = ACTIVE_SWEEPS.lock();
    let id = sweep.sweep_id();
    let present = members
        .iter()
        .filter_map(Weak::upgrade)
        .any(|m| m.sweep_id() == id);
    if !present {
        members.push(Arc::downgrade(sweep));
    }
}

/// Remove a sweep on its transition to a terminal state.
pub fn deregister(id: u64) {
    let mut members = ACTIVE_SWEEPS.lock();
    members.retain(|w| match w.upgrade() {
        Some(m) => m.sweep_id() != id,
        None => false,
    });
}

/// Currently registered live members. Mostly useful for diagnostics.
pub fn active_members() -> Vec<Arc<dyn ActiveSweep>> {
    let mut members = ACTIVE_SWEEPS.lock();
    collect_live(&mut members)
}

/// Drop every registration. Test hook.
pub fn reset_registry() {
    ACTIVE_SWEEPS.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    // The registry is process-global; serialize the tests that use it.
    static REGISTRY_TEST_LOCK: PlMutex<()> = PlMutex::new(());

    struct FakeSweep {
        id: u64,
        parent: PlMutex<Option<Arc<dyn ActiveSweep>>>,
        active: PlMutex<bool>,
        killed: PlMutex<bool>,
    }

    impl FakeSweep {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: next_sweep_id(),
                parent: PlMutex::new(None),
                active: PlMutex::new(true),
                killed: PlMutex::new(false),
            })
        }

        fn as_dyn(self: &Arc<Self>) -> Arc<dyn ActiveSweep> {
            self.clone()
        }
    }

    impl ActiveSweep for FakeSweep {
        fn sweep_id(&self) -> u64 {
            self.id
        }
        fn parent_sweep(&self) -> Option<Arc<dyn ActiveSweep>> {
            self.parent.lock().clone()
        }
        fn is_active(&self) -> bool {
            *self.active.lock()
        }
        fn kill_sweep(&self) {
            *self.killed.lock() = true;
            *self.active.lock() = false;
        }
        fn describe(&self) -> String {
            format!("fake sweep #{}", self.id)
        }
    }

    #[test]
    fn unrelated_active_sweep_blocks_start() {
        let _guard = REGISTRY_TEST_LOCK.lock();
        reset_registry();
        let a = FakeSweep::new();
        let b = FakeSweep::new();
        register(&a.as_dyn());

        let err = check_no_unrelated(&b.as_dyn()).unwrap_err();
        assert!(err.to_string().contains("Another sweep is active"));

        deregister(a.id);
        assert!(check_no_unrelated(&b.as_dyn()).is_ok());
        reset_registry();
    }

    #[test]
    fn inner_sweep_is_related_to_its_outer() {
        let _guard = REGISTRY_TEST_LOCK.lock();
        reset_registry();
        let outer = FakeSweep::new();
        let inner = FakeSweep::new();
        *inner.parent.lock() = Some(outer.as_dyn());

        register(&outer.as_dyn());
        assert!(check_no_unrelated(&inner.as_dyn()).is_ok());

        // And the outer is related to its registered inner.
        reset_registry();
        register(&inner.as_dyn());
        assert!(check_no_unrelated(&outer.as_dyn()).is_ok());
        reset_registry();
    }

    #[test]
    fn siblings_under_one_outer_are_related() {
        let _guard = REGISTRY_TEST_LOCK.lock();
        reset_registry();
        let outer = FakeSweep::new();
        let left = FakeSweep::new();
        let right = FakeSweep::new();
        *left.parent.lock() = Some(outer.as_dyn());
        *right.parent.lock() = Some(outer.as_dyn());

        register(&left.as_dyn());
        assert!(check_no_unrelated(&right.as_dyn()).is_ok());
        reset_registry();
    }

    #[test]
    fn force_kills_only_unrelated_members() {
        let _guard = REGISTRY_TEST_LOCK.lock();
        reset_registry();
        let stranger = FakeSweep::new();
        let outer = FakeSweep::new();
        let inner = FakeSweep::new();
        *inner.parent.lock() = Some(outer.as_dyn());

        register(&stranger.as_dyn());
        register(&outer.as_dyn());

        let killed = kill_unrelated(&inner.as_dyn());
        assert_eq!(killed, 1);
        assert!(*stranger.killed.lock());
        assert!(!*outer.killed.lock());
        reset_registry();
    }

    #[test]
    fn dropped_sweeps_vanish_from_the_registry() {
        let _guard = REGISTRY_TEST_LOCK.lock();
        reset_registry();
        let a = FakeSweep::new();
        register(&a.as_dyn());
        drop(a);
        assert!(active_members().is_empty());
        reset_registry();
    }

    #[test]
    fn inactive_members_do_not_block() {
        let _guard = REGISTRY_TEST_LOCK.lock();
        reset_registry();
        let a = FakeSweep::new();
        *a.active.lock() = false;
        register(&a.as_dyn());

        let b = FakeSweep::new();
        assert!(check_no_unrelated(&b.as_dyn()).is_ok());
        reset_registry();
    }
}
