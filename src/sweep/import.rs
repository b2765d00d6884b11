//! Reconstruction of sweeps from exported metadata records.
//!
//! The inverse of `export_metadata`: parameter identities in the record are
//! resolved against a [`Station`] holding live handles, and the kind string
//! selects the builder. Importing and re-exporting yields the identical
//! record.

use super::gate_leakage::GateLeakage;
use super::listening::ListeningSweep;
use super::simul::SimulSweep;
use super::sweep0d::Sweep0D;
use super::sweep1d::Sweep1D;
use super::sweep2d::Sweep2D;
use super::Sweep;
use crate::error::{Result, SweepError};
use crate::metadata::{ControlledEntry, MetadataReader};
use crate::station::Station;
use serde_json::Value;

pub(crate) fn sweep_from_metadata(record: &Value, station: &Station) -> Result<Sweep> {
    let reader = MetadataReader::new(record)?;
    let kind = reader.kind()?;

    let mut sweep = match kind {
        "Sweep0D" => import_sweep0d(&reader)?,
        "Sweep1D" => import_sweep1d(&reader, station)?,
        "SimulSweep" => import_simul(&reader, station)?,
        "ListeningSweep" => import_listening(&reader, station)?,
        "GateLeakage" => import_gate_leakage(&reader, station)?,
        "MagnetSweep" => {
            return Err(SweepError::config(
                "a magnet sweep needs its live ramping instrument; rebuild it with MagnetSweep::new",
            ))
        }
        "Sweep2D" => {
            return Err(SweepError::config(
                "use Sweep2D::from_metadata for two-axis records",
            ))
        }
        other => {
            return Err(SweepError::config(format!(
                "unknown sweep kind in metadata: {other}"
            )))
        }
    };

    attach_followed(&mut sweep, &reader, station)?;
    Ok(sweep)
}

fn attach_followed(
    sweep: &mut Sweep,
    reader: &MetadataReader<'_>,
    station: &Station,
) -> Result<()> {
    let controlled: Vec<String> = sweep.controlled().iter().map(|p| p.key()).collect();
    for key in reader.followed()? {
        if controlled.contains(&key) {
            continue;
        }
        sweep.follow_param([station.resolve(&key)?])?;
    }
    Ok(())
}

fn single_controlled(reader: &MetadataReader<'_>) -> Result<ControlledEntry> {
    let mut entries = reader.controlled()?;
    match entries.len() {
        1 => Ok(entries.remove(0)),
        n => Err(SweepError::config(format!(
            "expected exactly one controlled parameter in the record, found {n}"
        ))),
    }
}

fn import_sweep0d(reader: &MetadataReader<'_>) -> Result<Sweep> {
    let mut builder = Sweep0D::new();
    if let Some(max_time) = reader.attr_f64("max_time") {
        builder = builder.max_time(max_time);
    }
    builder = builder
        .inter_delay(reader.attr_f64("inter_delay").unwrap_or(0.01))
        .plot(reader.attr_bool("plot_data").unwrap_or(true))
        .plot_bin(reader.attr_u64("plot_bin").unwrap_or(1) as usize);
    builder.build()
}

fn import_sweep1d(reader: &MetadataReader<'_>, station: &Station) -> Result<Sweep> {
    let entry = single_controlled(reader)?;
    let parameter = station.resolve(&entry.key)?;
    let mut builder = Sweep1D::new(parameter, entry.start, entry.stop, entry.step)
        .inter_delay(reader.attr_f64("inter_delay").unwrap_or(0.01))
        .plot(reader.attr_bool("plot_data").unwrap_or(true))
        .plot_bin(reader.attr_u64("plot_bin").unwrap_or(1) as usize)
        .back_multiplier(reader.attr_f64("back_multiplier").unwrap_or(1.0));
    if reader.attr_bool("bidirectional").unwrap_or(false) {
        builder = builder.bidirectional();
    }
    if reader.attr_bool("continual").unwrap_or(false) {
        builder = builder.continual();
    }
    builder.build()
}

fn import_simul(reader: &MetadataReader<'_>, station: &Station) -> Result<Sweep> {
    let entries = reader.controlled()?;
    if entries.is_empty() {
        return Err(SweepError::config(
            "simultaneous sweep record has no controlled parameters",
        ));
    }
    let mut builder = SimulSweep::new()
        .inter_delay(reader.attr_f64("inter_delay").unwrap_or(0.01))
        .plot(reader.attr_bool("plot_data").unwrap_or(true))
        .plot_bin(reader.attr_u64("plot_bin").unwrap_or(1) as usize);
    for entry in entries {
        let parameter = station.resolve(&entry.key)?;
        builder = builder.axis(parameter, entry.start, entry.stop, entry.step);
    }
    if reader.attr_bool("bidirectional").unwrap_or(false) {
        builder = builder.bidirectional();
    }
    if reader.attr_bool("continual").unwrap_or(false) {
        builder = builder.continual();
    }
    builder.build()
}

fn import_listening(reader: &MetadataReader<'_>, station: &Station) -> Result<Sweep> {
    let entry = single_controlled(reader)?;
    let parameter = station.resolve(&entry.key)?;
    let step = reader
        .attr_f64("step")
        .ok_or_else(|| SweepError::config("listening record is missing the 'step' attribute"))?;
    ListeningSweep::new(parameter, step)
        .inter_delay(reader.attr_f64("inter_delay").unwrap_or(0.01))
        .plot(reader.attr_bool("plot_data").unwrap_or(true))
        .plot_bin(reader.attr_u64("plot_bin").unwrap_or(1) as usize)
        .build()
}

fn import_gate_leakage(reader: &MetadataReader<'_>, station: &Station) -> Result<Sweep> {
    let entry = single_controlled(reader)?;
    let parameter = station.resolve(&entry.key)?;
    let max_current = reader.attr_f64("max_current").ok_or_else(|| {
        SweepError::config("gate leakage record is missing the 'max_current' attribute")
    })?;
    let track_key = reader.attr_str("track_param").ok_or_else(|| {
        SweepError::config("gate leakage record is missing the 'track_param' attribute")
    })?;
    let track = station.resolve(&track_key)?;
    GateLeakage::new(parameter, track, max_current, entry.step)
        .start_at(entry.start)
        .limit(entry.stop)
        .max_flips(reader.attr_u64("max_flips").unwrap_or(2) as u32)
        .inter_delay(reader.attr_f64("inter_delay").unwrap_or(0.01))
        .plot(reader.attr_bool("plot_data").unwrap_or(true))
        .plot_bin(reader.attr_u64("plot_bin").unwrap_or(1) as usize)
        .build()
}

pub(crate) fn sweep2d_from_metadata(record: &Value, station: &Station) -> Result<Sweep2D> {
    let reader = MetadataReader::new(record)?;
    if reader.kind()? != "Sweep2D" {
        return Err(SweepError::config(format!(
            "expected a Sweep2D record, found kind {}",
            reader.kind()?
        )));
    }
    let outer_key = reader.attr_str("outer_param").ok_or_else(|| {
        SweepError::config("two-axis record is missing the 'outer_param' attribute")
    })?;

    let entries = reader.controlled()?;
    let outer_entry = entries
        .iter()
        .find(|e| e.key == outer_key)
        .ok_or_else(|| {
            SweepError::config(format!(
                "outer parameter {outer_key} not present in controlled entries"
            ))
        })?;
    let inner_entry = entries.iter().find(|e| e.key != outer_key).ok_or_else(|| {
        SweepError::config("two-axis record is missing the inner controlled entry")
    })?;

    let outer_param = station.resolve(&outer_entry.key)?;
    let inner_param = station.resolve(&inner_entry.key)?;

    let builder = Sweep2D::new(
        (
            inner_param,
            inner_entry.start,
            inner_entry.stop,
            inner_entry.step,
        ),
        (
            outer_param,
            outer_entry.start,
            outer_entry.stop,
            outer_entry.step,
        ),
    )
    .inter_delay(reader.attr_f64("inter_delay").unwrap_or(0.01))
    .outer_delay(reader.attr_f64("outer_delay").unwrap_or(1.0))
    .ministeps(reader.attr_u64("ministeps").unwrap_or(1) as u32)
    .back_multiplier(reader.attr_f64("back_multiplier").unwrap_or(1.0))
    .plot(reader.attr_bool("plot_data").unwrap_or(true))
    .plot_bin(reader.attr_u64("plot_bin").unwrap_or(1) as usize);
    let mut sweep = builder.build()?;

    let controlled = [outer_entry.key.clone(), inner_entry.key.clone()];
    for key in reader.followed()? {
        if controlled.contains(&key) {
            continue;
        }
        sweep.follow_param([station.resolve(&key)?])?;
    }
    Ok(sweep)
}
