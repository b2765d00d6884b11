//! Metadata export / import round-trips.

mod common;

use common::{constant_meter, MockDac};
use labsweep::{
    GateLeakage, ListeningSweep, SimulSweep, Station, Sweep, Sweep0D, Sweep1D, Sweep2D,
};

fn station_with(dacs: &[&MockDac], names: &[&str]) -> Station {
    let mut station = Station::new();
    for (dac, name) in dacs.iter().zip(names) {
        station.add(dac.voltage(name));
    }
    station
}

/// Export, import against a matching station, re-export, compare the
/// canonical encodings byte for byte.
fn assert_round_trip(exported: serde_json::Value, station: &Station) {
    let rebuilt = Sweep::from_metadata(&exported, station).unwrap();
    let re_exported = rebuilt.export_metadata();
    assert_eq!(
        serde_json::to_string(&exported).unwrap(),
        serde_json::to_string(&re_exported).unwrap()
    );
}

#[test]
fn sweep0d_round_trips() {
    let sweep = Sweep0D::new()
        .max_time(300.0)
        .inter_delay(0.5)
        .plot(false)
        .build()
        .unwrap();
    let station = Station::new();
    assert_round_trip(sweep.export_metadata(), &station);
}

#[test]
fn sweep1d_round_trips_with_follow_set() {
    let dac = MockDac::new(0.0);
    let mut sweep = Sweep1D::new(dac.voltage("gate"), -1.0, 1.0, 0.05)
        .bidirectional()
        .inter_delay(0.02)
        .plot_bin(4)
        .plot(false)
        .build()
        .unwrap();
    sweep.follow_param([constant_meter("current", 0.0)]).unwrap();

    let mut station = station_with(&[&dac], &["gate"]);
    station.add(constant_meter("current", 0.0));

    let exported = sweep.export_metadata();
    assert_eq!(exported["kind"], "Sweep1D");
    assert_eq!(exported["attributes"]["bidirectional"], true);
    assert_eq!(exported["controlled"]["dac.gate"]["start"], -1.0);
    assert_eq!(exported["followed"]["meter.current"], "meter");
    assert_round_trip(exported, &station);
}

#[test]
fn simul_sweep_round_trips() {
    let dac_a = MockDac::new(0.0);
    let dac_b = MockDac::new(0.0);
    let sweep = SimulSweep::new()
        .axis(dac_a.voltage("a"), 0.0, 5.0, 0.5)
        .axis(dac_b.voltage("b"), 0.0, 10.0, 1.0)
        .bidirectional()
        .inter_delay(0.02)
        .plot(false)
        .build()
        .unwrap();

    let mut station = Station::new();
    station.add(dac_a.voltage("a"));
    station.add(dac_b.voltage("b"));
    assert_round_trip(sweep.export_metadata(), &station);
}

#[test]
fn listening_sweep_round_trips() {
    let dac = MockDac::new(0.0);
    let sweep = ListeningSweep::new(dac.voltage("field"), 0.01)
        .inter_delay(0.05)
        .plot(false)
        .build()
        .unwrap();
    let station = station_with(&[&dac], &["field"]);
    assert_round_trip(sweep.export_metadata(), &station);
}

#[test]
fn gate_leakage_round_trips() {
    let dac = MockDac::new(0.0);
    let sweep = GateLeakage::new(
        dac.voltage("gate"),
        constant_meter("leak", 0.0),
        1e-9,
        0.01,
    )
    .limit(2.0)
    .inter_delay(0.02)
    .plot(false)
    .build()
    .unwrap();

    let mut station = station_with(&[&dac], &["gate"]);
    station.add(constant_meter("leak", 0.0));
    assert_round_trip(sweep.export_metadata(), &station);
}

#[test]
fn sweep2d_round_trips() {
    let dac_in = MockDac::new(0.0);
    let dac_out = MockDac::new(0.0);
    let mut sweep = Sweep2D::new(
        (dac_in.voltage("fine"), -1.0, 1.0, 0.1),
        (dac_out.voltage("coarse"), 0.0, 2.0, 0.5),
    )
    .outer_delay(0.2)
    .ministeps(2)
    .inter_delay(0.02)
    .plot(false)
    .build()
    .unwrap();
    sweep.follow_param([constant_meter("current", 0.0)]).unwrap();

    let mut station = Station::new();
    station.add(dac_in.voltage("fine"));
    station.add(dac_out.voltage("coarse"));
    station.add(constant_meter("current", 0.0));

    let exported = sweep.export_metadata();
    assert_eq!(exported["kind"], "Sweep2D");
    assert_eq!(exported["attributes"]["outer_param"], "dac.coarse");

    let rebuilt = Sweep2D::from_metadata(&exported, &station).unwrap();
    let re_exported = rebuilt.export_metadata();
    assert_eq!(
        serde_json::to_string(&exported).unwrap(),
        serde_json::to_string(&re_exported).unwrap()
    );
}

#[test]
fn unknown_kind_is_rejected() {
    let record = serde_json::json!({
        "kind": "WarpSweep",
        "module": "labsweep::sweep",
        "attributes": {},
        "controlled": null,
        "followed": {},
    });
    let station = Station::new();
    assert!(Sweep::from_metadata(&record, &station).is_err());
}
