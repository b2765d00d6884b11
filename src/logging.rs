//! Per-run log capture for sweep execution.
//!
//! Installs a [`log::Log`] implementation that appends every record at
//! `Info` and above to `sweeps_<YYYYMMDD_HHMMSS>.log` under the logs data
//! directory, mirroring to stderr so interactive sessions still see
//! transitions. The file is named once per process at install time.

use crate::config::{data_path, Subdir};
use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Once;

static INIT: Once = Once::new();

/// Logger writing timestamped records to the per-run sweep log file.
pub struct SweepLogger {
    file: Mutex<Option<File>>,
    path: PathBuf,
    mirror_stderr: bool,
}

impl SweepLogger {
    fn open(mirror_stderr: bool) -> std::io::Result<Self> {
        let dir = data_path(Subdir::Logs)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("sweeps_{}.log", stamp));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            mirror_stderr,
        })
    }

    /// Location of the log file backing this logger.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Log for SweepLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "{} | {} | {} | {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.target(),
            record.level(),
            record.args()
        );
        if let Some(file) = self.file.lock().as_mut() {
            let _ = writeln!(file, "{}", line);
        }
        if self.mirror_stderr {
            eprintln!("{}", line);
        }
    }

    fn flush(&self) {
        if let Some(file) = self.file.lock().as_mut() {
            let _ = file.flush();
        }
    }
}

/// Install the sweep logger as the global [`log`] sink.
///
/// Safe to call repeatedly; only the first call in the process installs a
/// logger. Returns the log file path when this call performed the
/// installation.
pub fn init_sweep_logging(mirror_stderr: bool) -> Option<PathBuf> {
    let mut installed = None;
    INIT.call_once(|| {
        if let Ok(logger) = SweepLogger::open(mirror_stderr) {
            let path = logger.path().clone();
            if log::set_boxed_logger(Box::new(logger)).is_ok() {
                log::set_max_level(LevelFilter::Info);
                installed = Some(path);
            }
        }
    });
    installed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{reset_data_dir, set_data_dir};

    #[test]
    fn logger_writes_to_per_run_file() {
        let _guard = crate::config::test_support::lock_data_dir();
        let tmp = tempfile::tempdir().unwrap();
        set_data_dir(tmp.path());

        let logger = SweepLogger::open(false).unwrap();
        let path = logger.path().clone();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("sweeps_"));
        assert!(name.ends_with(".log"));

        logger.log(
            &Record::builder()
                .args(format_args!("sweep started"))
                .level(Level::Info)
                .target("labsweep::test")
                .build(),
        );
        logger.flush();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("sweep started"));
        assert!(contents.contains("INFO"));
        reset_data_dir();
    }
}
