//! Append-only JSONL log of executed steps.
//!
//! One [`StepRecord`] per line, in execution order.  A log read back with
//! [`StepLog::load`] is validated before use: indices must run `0, 1, 2, …`,
//! path length may never decrease, and `STOP` may only appear on the last
//! line.  Anything else is a [`NavError::CorruptStepLog`].

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use subnav_types::{NavError, StepRecord};

use crate::ExportError;

/// Handle to a JSONL step log on disk.
#[derive(Debug, Clone)]
pub struct StepLog {
    path: PathBuf,
}

impl StepLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, creating the file and its parent directory.
    pub fn append(&self, record: &StepRecord) -> Result<(), ExportError> {
        append_line(&self.path, record)
    }

    /// Read and validate the whole log.  A missing file is an empty log.
    pub fn load(&self) -> Result<Vec<StepRecord>, ExportError> {
        let Some(text) = read_optional(&self.path)? else {
            return Ok(Vec::new());
        };
        let records = parse(&text)?;
        validate(&records)?;
        Ok(records)
    }
}

/// Append `value` as one JSON line.
pub(crate) fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<(), ExportError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(value)?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// File contents, or `None` when it does not exist.
pub(crate) fn read_optional(path: &Path) -> Result<Option<String>, ExportError> {
    match fs::read_to_string(path) {
        Ok(t) => Ok(Some(t)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Parse JSONL text.  Blank lines are skipped; line numbers are 1-based.
pub fn parse(text: &str) -> Result<Vec<StepRecord>, NavError> {
    text.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| {
            serde_json::from_str(l).map_err(|e| NavError::CorruptStepLog {
                line: i + 1,
                details: e.to_string(),
            })
        })
        .collect()
}

/// Check ordering, path-length monotonicity and STOP placement.
pub fn validate(records: &[StepRecord]) -> Result<(), NavError> {
    let mut last_path = 0.0_f64;
    for (i, record) in records.iter().enumerate() {
        let line = i + 1;
        if record.step != i {
            return Err(NavError::CorruptStepLog {
                line,
                details: format!("expected step {i}, found {}", record.step),
            });
        }
        if record.metrics.path_length + 1e-9 < last_path {
            return Err(NavError::CorruptStepLog {
                line,
                details: format!(
                    "path length decreased from {last_path:.3} to {:.3}",
                    record.metrics.path_length
                ),
            });
        }
        if record.action.is_stop() && line != records.len() {
            return Err(NavError::CorruptStepLog {
                line,
                details: "STOP before the end of the log".to_string(),
            });
        }
        last_path = record.metrics.path_length;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use subnav_types::{Action, ActionSource, MetricsSnapshot};

    fn record(step: usize, action: Action, path_length: f64) -> StepRecord {
        StepRecord {
            step,
            action,
            source: ActionSource::Executor,
            subtask_sequence: 1,
            metrics: MetricsSnapshot {
                distance_to_goal: 4.0,
                path_length,
                ..MetricsSnapshot::default()
            },
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn append_then_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = StepLog::new(dir.path().join("ep/steps.jsonl"));
        log.append(&record(0, Action::MoveForward, 0.25)).unwrap();
        log.append(&record(1, Action::TurnLeft, 0.25)).unwrap();
        log.append(&record(2, Action::Stop, 0.25)).unwrap();

        let loaded = log.load().unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[1].action, Action::TurnLeft);
        assert_eq!(loaded[2].step, 2);
    }

    #[test]
    fn missing_file_is_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = StepLog::new(dir.path().join("absent.jsonl"));
        assert!(log.load().unwrap().is_empty());
    }

    #[test]
    fn garbage_line_reports_its_number() {
        let good = serde_json::to_string(&record(0, Action::MoveForward, 0.25)).unwrap();
        let text = format!("{good}\n{{not json\n");
        let err = parse(&text).unwrap_err();
        assert!(matches!(err, NavError::CorruptStepLog { line: 2, .. }));
    }

    #[test]
    fn gap_in_indices_is_corrupt() {
        let records = vec![
            record(0, Action::MoveForward, 0.25),
            record(2, Action::MoveForward, 0.5),
        ];
        let err = validate(&records).unwrap_err();
        assert!(matches!(err, NavError::CorruptStepLog { line: 2, .. }));
    }

    #[test]
    fn decreasing_path_length_is_corrupt() {
        let records = vec![
            record(0, Action::MoveForward, 0.5),
            record(1, Action::MoveForward, 0.25),
        ];
        assert!(validate(&records).is_err());
    }

    #[test]
    fn stop_before_last_line_is_corrupt() {
        let records = vec![
            record(0, Action::Stop, 0.0),
            record(1, Action::MoveForward, 0.25),
        ];
        let err = validate(&records).unwrap_err();
        assert!(matches!(err, NavError::CorruptStepLog { line: 1, .. }));
    }

    #[test]
    fn corrupt_file_surfaces_through_load() {
        let dir = tempfile::tempdir().unwrap();
        let log = StepLog::new(dir.path().join("steps.jsonl"));
        log.append(&record(1, Action::MoveForward, 0.25)).unwrap();
        let err = log.load().unwrap_err();
        assert!(matches!(
            err,
            ExportError::Nav(NavError::CorruptStepLog { line: 1, .. })
        ));
    }
}
