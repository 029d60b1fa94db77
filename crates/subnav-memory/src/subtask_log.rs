//! Append-only JSONL log of subtask records.
//!
//! A record is appended when a subtask is issued and again when it is
//! completed.  [`SubtaskLog::load`] keeps the latest line per sequence
//! number, so the full history (completion steps included) can be rebuilt
//! for a resumed episode.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use subnav_types::{NavError, SubtaskRecord};

use crate::ExportError;
use crate::step_log::{append_line, read_optional};

#[derive(Debug, Clone)]
pub struct SubtaskLog {
    path: PathBuf,
}

impl SubtaskLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &SubtaskRecord) -> Result<(), ExportError> {
        append_line(&self.path, record)
    }

    /// Latest record per sequence, in sequence order.  A missing file is an
    /// empty history.
    pub fn load(&self) -> Result<Vec<SubtaskRecord>, ExportError> {
        match read_optional(&self.path)? {
            Some(text) => Ok(parse(&text)?),
            None => Ok(Vec::new()),
        }
    }
}

/// Parse JSONL text into the latest record per sequence.
pub fn parse(text: &str) -> Result<Vec<SubtaskRecord>, NavError> {
    let mut latest = BTreeMap::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: SubtaskRecord =
            serde_json::from_str(line).map_err(|e| NavError::CorruptStepLog {
                line: i + 1,
                details: format!("subtask log: {e}"),
            })?;
        latest.insert(record.subtask.sequence, record);
    }
    Ok(latest.into_values().collect())
}
