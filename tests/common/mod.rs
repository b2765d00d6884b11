//! Shared test fixtures: mock instruments with failure injection.
#![allow(dead_code)]

use labsweep::Parameter;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// The active-sweep registry and the data-directory override are
/// process-global; tests that start sweeps or redirect storage take this
/// lock so they do not interleave.
static ENGINE_LOCK: Mutex<()> = Mutex::new(());

pub fn engine_lock() -> MutexGuard<'static, ()> {
    let guard = ENGINE_LOCK.lock();
    labsweep::registry::reset_registry();
    guard
}

/// A settable mock channel backed by shared storage.
pub struct MockDac {
    pub value: Arc<Mutex<f64>>,
    pub set_log: Arc<Mutex<Vec<f64>>>,
}

impl MockDac {
    pub fn new(initial: f64) -> Self {
        Self {
            value: Arc::new(Mutex::new(initial)),
            set_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A well-behaved voltage channel.
    pub fn voltage(&self, name: &str) -> Parameter {
        let read = self.value.clone();
        let write = self.value.clone();
        let log = self.set_log.clone();
        Parameter::builder(name, "dac")
            .unit("V")
            .getter(move || Ok(*read.lock()))
            .setter(move |v| {
                *write.lock() = v;
                log.lock().push(v);
                Ok(())
            })
            .build()
    }

    /// A channel whose set starts failing after `ok_sets` successes.
    pub fn failing_voltage(&self, name: &str, ok_sets: usize) -> Parameter {
        let read = self.value.clone();
        let write = self.value.clone();
        let log = self.set_log.clone();
        Parameter::builder(name, "dac")
            .unit("V")
            .getter(move || Ok(*read.lock()))
            .setter(move |v| {
                let mut log = log.lock();
                if log.len() >= ok_sets {
                    return Err("output stage fault".to_string());
                }
                *write.lock() = v;
                log.push(v);
                Ok(())
            })
            .build()
    }
}

/// A follow parameter that reads back another channel's storage, so its
/// value tracks the last setpoint.
pub fn tracking_meter(name: &str, source: &Arc<Mutex<f64>>) -> Parameter {
    let read = source.clone();
    Parameter::builder(name, "meter")
        .unit("A")
        .getter(move || Ok(*read.lock()))
        .build()
}

/// A follow parameter pinned to a fixed reading.
pub fn constant_meter(name: &str, value: f64) -> Parameter {
    Parameter::builder(name, "meter")
        .unit("A")
        .getter(move || Ok(value))
        .build()
}

/// Read every data row of the single dataset file under `dir`
/// (recursively), skipping metadata comments and the header.
pub fn read_rows(dir: &std::path::Path) -> Vec<Vec<f64>> {
    let mut files = Vec::new();
    collect_csv(dir, &mut files);
    assert_eq!(
        files.len(),
        1,
        "expected exactly one dataset file under {dir:?}, found {files:?}"
    );
    read_rows_of(&files[0])
}

/// Parse the data rows of one dataset file.
pub fn read_rows_of(path: &std::path::Path) -> Vec<Vec<f64>> {
    let contents = std::fs::read_to_string(path).expect("dataset file should be readable");
    contents
        .lines()
        .filter(|line| !line.starts_with('#') && !line.is_empty())
        .skip(1)
        .map(|line| {
            line.split(',')
                .map(|cell| cell.parse::<f64>().expect("numeric cell"))
                .collect()
        })
        .collect()
}

pub fn collect_csv(dir: &std::path::Path, out: &mut Vec<std::path::PathBuf>) {
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                collect_csv(&path, out);
            } else if path.extension().is_some_and(|e| e == "csv") {
                out.push(path);
            }
        }
    }
}
