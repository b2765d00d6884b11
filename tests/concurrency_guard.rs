//! The process-wide active-sweep guard.

mod common;

use common::{engine_lock, MockDac};
use labsweep::{Sweep1D, SweepError, SweepState};
use std::time::Duration;

#[test]
fn second_unrelated_start_fails_until_the_first_finishes() {
    let _guard = engine_lock();

    let dac_one = MockDac::new(0.0);
    let mut first = Sweep1D::new(dac_one.voltage("v1"), 0.0, 0.5, 0.01)
        .inter_delay(0.01)
        .plot(false)
        .build()
        .unwrap();

    let dac_two = MockDac::new(0.0);
    let mut second = Sweep1D::new(dac_two.voltage("v2"), 0.0, 0.1, 0.1)
        .inter_delay(0.01)
        .plot(false)
        .build()
        .unwrap();

    first.start().unwrap();

    // While the first is active, an unrelated start is refused and the
    // refused sweep's state is untouched.
    let err = second.start().unwrap_err();
    assert!(matches!(err, SweepError::Concurrency(_)));
    assert!(err.to_string().contains("Another sweep is active"));
    assert_eq!(second.state(), SweepState::Ready);

    let first_final = first.wait_done(Duration::from_secs(60)).unwrap();
    assert_eq!(first_final.state, SweepState::Done);

    // No force needed once the registry has drained.
    second.start().unwrap();
    let second_final = second.wait_done(Duration::from_secs(60)).unwrap();
    assert_eq!(second_final.state, SweepState::Done);
}

#[test]
fn start_force_kills_the_unrelated_sweep() {
    let _guard = engine_lock();

    let dac_one = MockDac::new(0.0);
    let mut victim = Sweep1D::new(dac_one.voltage("v1"), 0.0, 5.0, 0.01)
        .inter_delay(0.01)
        .plot(false)
        .build()
        .unwrap();

    let dac_two = MockDac::new(0.0);
    let mut usurper = Sweep1D::new(dac_two.voltage("v2"), 0.0, 0.2, 0.1)
        .inter_delay(0.01)
        .plot(false)
        .build()
        .unwrap();

    victim.start().unwrap();
    usurper.start_force().unwrap();

    let victim_final = victim.wait_done(Duration::from_secs(30)).unwrap();
    assert_eq!(victim_final.state, SweepState::Killed);

    let usurper_final = usurper.wait_done(Duration::from_secs(60)).unwrap();
    assert_eq!(usurper_final.state, SweepState::Done);
}

#[test]
fn registry_never_holds_two_unrelated_running_sweeps() {
    let _guard = engine_lock();

    let dac = MockDac::new(0.0);
    let mut sweep = Sweep1D::new(dac.voltage("v"), 0.0, 5.0, 0.01)
        .inter_delay(0.01)
        .plot(false)
        .build()
        .unwrap();
    sweep.start().unwrap();

    let actives = labsweep::registry::active_members();
    assert_eq!(actives.iter().filter(|m| m.is_active()).count(), 1);

    // Removal happens on the terminal transition.
    sweep.kill();
    sweep.wait_done(Duration::from_secs(30));
    assert!(labsweep::registry::active_members()
        .iter()
        .all(|m| !m.is_active()));
}
