//! Persistence facade: the only module that touches dataset files.
//!
//! A [`SaveTarget`] names a dataset (database, experiment, sample). Opening
//! it yields a [`Context`]; each run within the context registers its
//! column schema exactly once via [`Context::begin_measurement`] and then
//! appends rows through the returned [`MeasurementHandle`]. Rows are stored
//! as CSV with the sweep's metadata record embedded as `# `-prefixed header
//! lines, so every dataset file is self-describing.

use crate::config::{data_path, Subdir};
use crate::error::{Result, SweepError};
use serde_json::Value;
use std::fs::File;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Where a sweep's rows go: dataset file, experiment label, sample label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveTarget {
    pub database: String,
    pub experiment: String,
    pub sample: String,
}

impl SaveTarget {
    pub fn new(
        database: impl Into<String>,
        experiment: impl Into<String>,
        sample: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            experiment: experiment.into(),
            sample: sample.into(),
        }
    }
}

impl std::fmt::Display for SaveTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.database, self.experiment, self.sample)
    }
}

/// One column of a measurement schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub label: String,
    pub unit: String,
}

impl ColumnSpec {
    pub fn new(
        name: impl Into<String>,
        label: impl Into<String>,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            unit: unit.into(),
        }
    }

    fn header(&self) -> String {
        if self.unit.is_empty() {
            self.name.clone()
        } else {
            format!("{} ({})", self.name, self.unit)
        }
    }
}

/// Transactional scope around one dataset / experiment / sample triple.
pub struct Context {
    target: SaveTarget,
    dir: PathBuf,
    runs_started: u32,
}

impl Context {
    /// Open (creating if needed) the dataset directory for `target`.
    ///
    /// Relative database names resolve under the `databases/` data
    /// directory; absolute paths are used as-is.
    pub fn open(target: SaveTarget) -> Result<Self> {
        let base = Path::new(&target.database);
        let dir = if base.is_absolute() {
            base.to_path_buf()
        } else {
            let stem = base
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| target.database.clone());
            data_path(Subdir::Databases)?.join(stem)
        };
        std::fs::create_dir_all(&dir).map_err(|e| {
            SweepError::persistence(format!(
                "could not open dataset {}: {}",
                dir.display(),
                e
            ))
        })?;
        log::info!("opened dataset context {} at {}", target, dir.display());
        Ok(Self {
            target,
            dir,
            runs_started: 0,
        })
    }

    pub fn target(&self) -> &SaveTarget {
        &self.target
    }

    /// Register the column schema for a new run and return the row sink.
    ///
    /// The schema is written exactly once, before any row; `metadata` is
    /// embedded ahead of it as comment lines.
    pub fn begin_measurement(
        &mut self,
        columns: Vec<ColumnSpec>,
        metadata: Option<&Value>,
    ) -> Result<MeasurementHandle> {
        if columns.is_empty() {
            return Err(SweepError::persistence(
                "measurement schema must have at least one column",
            ));
        }
        self.runs_started += 1;
        let run_id = Uuid::new_v4();
        let file_name = sanitize(&format!(
            "{}_{}_{}.csv",
            run_id.simple(),
            self.target.experiment,
            self.target.sample
        ));
        let path = self.dir.join(file_name);
        let mut file = File::create(&path).map_err(|e| {
            SweepError::persistence(format!("could not create {}: {}", path.display(), e))
        })?;

        if let Some(meta) = metadata {
            use std::io::Write;
            let pretty = serde_json::to_string_pretty(meta)
                .map_err(|e| SweepError::persistence(format!("metadata encode failed: {e}")))?;
            for line in pretty.lines() {
                writeln!(file, "# {line}").map_err(|e| {
                    SweepError::persistence(format!("metadata write failed: {e}"))
                })?;
            }
        }

        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record(columns.iter().map(ColumnSpec::header))
            .map_err(|e| SweepError::persistence(format!("schema write failed: {e}")))?;

        log::info!(
            "run {} of {} recording {} columns to {}",
            self.runs_started,
            self.target,
            columns.len(),
            path.display()
        );
        Ok(MeasurementHandle {
            writer,
            path,
            run_id: run_id.to_string(),
            width: columns.len(),
            rows: 0,
        })
    }

    /// Close the context. Nothing is buffered at this level; the method
    /// exists so supervisors can make the scope explicit.
    pub fn close(self) {
        log::info!("closed dataset context {}", self.target);
    }
}

/// Row sink for one run. Single-writer: owned by the acquisition worker.
pub struct MeasurementHandle {
    writer: csv::Writer<File>,
    path: PathBuf,
    run_id: String,
    width: usize,
    rows: u64,
}

impl MeasurementHandle {
    /// Append one row in schema order. Width mismatches are persistence
    /// errors; missing values are never substituted.
    pub fn append(&mut self, row: &[f64]) -> Result<()> {
        if row.len() != self.width {
            return Err(SweepError::persistence(format!(
                "row width {} does not match schema width {}",
                row.len(),
                self.width
            )));
        }
        self.writer
            .write_record(row.iter().map(|v| v.to_string()))
            .map_err(|e| SweepError::persistence(format!("row append failed: {e}")))?;
        self.rows += 1;
        Ok(())
    }

    /// Flush buffered rows to disk without ending the run.
    pub fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| SweepError::persistence(format!("flush failed: {e}")))
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and end the run, returning the dataset file path.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.flush()?;
        log::info!("finished run {} ({} rows)", self.run_id, self.rows);
        Ok(self.path)
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '?' | '*' | '<' | '>' | '"' | '\'' | '/' | '\\' | ':' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{reset_data_dir, set_data_dir};
    use serde_json::json;

    fn columns() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("voltage", "Gate voltage", "V"),
            ColumnSpec::new("current", "Drain current", "A"),
            ColumnSpec::new("time", "time", "s"),
        ]
    }

    #[test]
    fn rows_land_in_schema_order() {
        let _guard = crate::config::test_support::lock_data_dir();
        let tmp = tempfile::tempdir().unwrap();
        set_data_dir(tmp.path());

        let mut ctx = Context::open(SaveTarget::new("测试db", "cooldown", "wafer A")).unwrap();
        let mut handle = ctx.begin_measurement(columns(), None).unwrap();
        handle.append(&[0.0, 1e-9, 0.01]).unwrap();
        handle.append(&[0.1, 2e-9, 0.02]).unwrap();
        assert_eq!(handle.rows(), 2);
        let path = handle.finish().unwrap();
        ctx.close();

        let contents = std::fs::read_to_string(path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next().unwrap(), "voltage (V),current (A),time (s)");
        assert!(lines.next().unwrap().starts_with("0,"));
        reset_data_dir();
    }

    #[test]
    fn metadata_is_embedded_as_comment_lines() {
        let _guard = crate::config::test_support::lock_data_dir();
        let tmp = tempfile::tempdir().unwrap();
        set_data_dir(tmp.path());

        let mut ctx = Context::open(SaveTarget::new("db", "exp", "s1")).unwrap();
        let meta = json!({"kind": "Sweep1D", "attributes": {"inter_delay": 0.01}});
        let handle = ctx.begin_measurement(columns(), Some(&meta)).unwrap();
        let path = handle.finish().unwrap();

        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.starts_with("# {"));
        assert!(contents.contains("\"kind\": \"Sweep1D\""));
        // Header row follows the comment block.
        assert!(contents.contains("voltage (V),current (A),time (s)"));
        reset_data_dir();
    }

    #[test]
    fn width_mismatch_is_a_persistence_error() {
        let _guard = crate::config::test_support::lock_data_dir();
        let tmp = tempfile::tempdir().unwrap();
        set_data_dir(tmp.path());

        let mut ctx = Context::open(SaveTarget::new("db", "exp", "s1")).unwrap();
        let mut handle = ctx.begin_measurement(columns(), None).unwrap();
        let err = handle.append(&[1.0]).unwrap_err();
        assert!(matches!(err, SweepError::Persistence(_)));
        reset_data_dir();
    }
}
