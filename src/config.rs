//! Data-directory discovery for the sweep engine.
//!
//! All on-disk artifacts (dataset files, per-run sweep logs, configuration
//! snapshots) live under a single base directory resolved by precedence:
//!
//! 1. Programmatic override via [`set_data_dir`]
//! 2. The `LABSWEEP_HOME` environment variable
//! 3. The OS user-data directory (e.g. `~/.local/share/labsweep`)
//!
//! Sub-directories are created lazily on first access, never at
//! initialization, so merely linking the crate touches nothing on disk.

use crate::error::{Result, SweepError};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};

/// Environment variable that overrides the base data directory.
pub const HOME_ENV_VAR: &str = "LABSWEEP_HOME";

static DATA_DIR_OVERRIDE: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Known sub-directories of the data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subdir {
    /// Dataset files written through the persistence facade.
    Databases,
    /// Per-run sweep logs (`sweeps_<timestamp>.log`).
    Logs,
    /// Station / configuration snapshots.
    Cfg,
}

impl Subdir {
    fn dir_name(self) -> &'static str {
        match self {
            Subdir::Databases => "databases",
            Subdir::Logs => "logs",
            Subdir::Cfg => "cfg",
        }
    }
}

/// Override the base directory used for all engine data files.
///
/// Takes effect for every subsequent [`data_dir`]/[`data_path`] call in the
/// process. Returns the normalized absolute path that will be used.
pub fn set_data_dir(path: impl AsRef<Path>) -> PathBuf {
    let mut candidate = path.as_ref().to_path_buf();
    if candidate.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            candidate = cwd.join(candidate);
        }
    }
    *DATA_DIR_OVERRIDE.write() = Some(candidate.clone());
    candidate
}

/// Clear a previous [`set_data_dir`] override. Intended for tests.
pub fn reset_data_dir() {
    *DATA_DIR_OVERRIDE.write() = None;
}

/// The base directory for engine data, resolved by precedence but not
/// created.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = DATA_DIR_OVERRIDE.read().clone() {
        return dir;
    }
    if let Some(env) = std::env::var_os(HOME_ENV_VAR) {
        let p = PathBuf::from(env);
        if !p.as_os_str().is_empty() {
            return p;
        }
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("labsweep")
}

/// The path of a known sub-directory, created on first access.
pub fn data_path(subdir: Subdir) -> Result<PathBuf> {
    let target = data_dir().join(subdir.dir_name());
    std::fs::create_dir_all(&target).map_err(|e| {
        SweepError::persistence(format!(
            "could not create data directory {}: {}",
            target.display(),
            e
        ))
    })?;
    Ok(target)
}

#[cfg(test)]
pub(crate) mod test_support {
    use parking_lot::{Mutex, MutexGuard};

    static DATA_DIR_LOCK: Mutex<()> = Mutex::new(());

    /// Serializes unit tests that touch the process-global data directory.
    pub(crate) fn lock_data_dir() -> MutexGuard<'static, ()> {
        DATA_DIR_LOCK.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_takes_precedence_over_env() {
        let _guard = test_support::lock_data_dir();
        let tmp = tempfile::tempdir().unwrap();
        set_data_dir(tmp.path());
        assert_eq!(data_dir(), tmp.path());

        let db = data_path(Subdir::Databases).unwrap();
        assert!(db.ends_with("databases"));
        assert!(db.is_dir());

        reset_data_dir();
    }

    #[test]
    fn subdirs_are_created_lazily() {
        let _guard = test_support::lock_data_dir();
        let tmp = tempfile::tempdir().unwrap();
        set_data_dir(tmp.path().join("nested"));
        // Nothing exists until a subdir is requested.
        assert!(!tmp.path().join("nested").exists());
        let logs = data_path(Subdir::Logs).unwrap();
        assert!(logs.is_dir());
        reset_data_dir();
    }
}
