//! Export boundary for episode records.
//!
//! The controller pushes every [`StepRecord`] and every issued subtask
//! through an [`EpisodeSink`] as it happens and hands over the
//! [`EpisodeSummary`] once, when the episode terminates.
//!
//! # On-disk layout ([`JsonExporter`])
//!
//! ```text
//! <root>/
//! ├── aggregate.json
//! └── episode_<id>/
//!     ├── episode_summary.json
//!     ├── steps.jsonl                 (StepLog, used for resume)
//!     ├── subtasks.jsonl              (SubtaskLog, used for resume)
//!     ├── steps/step_0000.json
//!     ├── subtasks/subtask_1_initial.json
//!     └── compass/<phase>_step<N>.png (written by the aggregator)
//! ```
//!
//! A fresh start of an episode clears its directory first, so records of an
//! earlier attempt never mix with the new ones.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use subnav_metrics::RunAggregate;
use subnav_types::{EpisodeSummary, StepRecord, SubtaskRecord};
use tracing::{debug, info};

use crate::ExportError;
use crate::step_log::StepLog;
use crate::subtask_log::SubtaskLog;

/// Receives episode records as they are produced.
pub trait EpisodeSink: Send {
    /// Called before an episode starts from scratch (not on resume).
    fn begin_episode(&mut self, _episode_id: &str) -> Result<(), ExportError> {
        Ok(())
    }

    fn record_step(&mut self, episode_id: &str, record: &StepRecord) -> Result<(), ExportError>;

    fn record_subtask(
        &mut self,
        episode_id: &str,
        record: &SubtaskRecord,
    ) -> Result<(), ExportError>;

    /// Called exactly once per episode.
    fn finish_episode(&mut self, summary: &EpisodeSummary) -> Result<(), ExportError>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EpisodeSink for NullSink {
    fn record_step(&mut self, _: &str, _: &StepRecord) -> Result<(), ExportError> {
        Ok(())
    }

    fn record_subtask(&mut self, _: &str, _: &SubtaskRecord) -> Result<(), ExportError> {
        Ok(())
    }

    fn finish_episode(&mut self, _: &EpisodeSummary) -> Result<(), ExportError> {
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// JsonExporter
// ────────────────────────────────────────────────────────────────────────────

/// Writes pretty-printed JSON files under a root output directory.
#[derive(Debug, Clone)]
pub struct JsonExporter {
    root: PathBuf,
}

impl JsonExporter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn episode_dir(&self, episode_id: &str) -> PathBuf {
        self.root.join(format!("episode_{episode_id}"))
    }

    /// Where the observation aggregator should put compass composites.
    pub fn compass_dir(&self, episode_id: &str) -> PathBuf {
        self.episode_dir(episode_id).join("compass")
    }

    pub fn step_log(&self, episode_id: &str) -> StepLog {
        StepLog::new(self.episode_dir(episode_id).join("steps.jsonl"))
    }

    pub fn subtask_log(&self, episode_id: &str) -> SubtaskLog {
        SubtaskLog::new(self.episode_dir(episode_id).join("subtasks.jsonl"))
    }

    /// Write the cross-episode aggregate to `<root>/aggregate.json`.
    pub fn write_aggregate(&self, aggregate: &RunAggregate) -> Result<PathBuf, ExportError> {
        let path = self.root.join("aggregate.json");
        write_json(&path, aggregate)?;
        Ok(path)
    }
}

impl EpisodeSink for JsonExporter {
    fn begin_episode(&mut self, episode_id: &str) -> Result<(), ExportError> {
        let dir = self.episode_dir(episode_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(dir = %dir.display(), "cleared records of an earlier attempt");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn record_step(&mut self, episode_id: &str, record: &StepRecord) -> Result<(), ExportError> {
        let path = self
            .episode_dir(episode_id)
            .join("steps")
            .join(format!("step_{:04}.json", record.step));
        write_json(&path, record)?;
        self.step_log(episode_id).append(record)
    }

    fn record_subtask(
        &mut self,
        episode_id: &str,
        record: &SubtaskRecord,
    ) -> Result<(), ExportError> {
        let path = self.episode_dir(episode_id).join("subtasks").join(format!(
            "subtask_{}_{}.json",
            record.subtask.sequence, record.phase
        ));
        write_json(&path, record)?;
        self.subtask_log(episode_id).append(record)
    }

    fn finish_episode(&mut self, summary: &EpisodeSummary) -> Result<(), ExportError> {
        let path = self
            .episode_dir(&summary.episode_id)
            .join("episode_summary.json");
        write_json(&path, summary)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ExportError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    debug!(path = %path.display(), "record written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use subnav_types::{
        Action, ActionSource, MetricsSnapshot, Subtask, SubtaskOrigin, TerminationReason,
    };
    use uuid::Uuid;

    fn step(step: usize) -> StepRecord {
        StepRecord {
            step,
            action: Action::MoveForward,
            source: ActionSource::Executor,
            subtask_sequence: 1,
            metrics: MetricsSnapshot::default(),
            timestamp: Utc::now(),
        }
    }

    fn subtask_record() -> SubtaskRecord {
        SubtaskRecord {
            subtask: Subtask {
                sequence: 1,
                description: "Walk to the hallway".to_string(),
                planning_hints: "Straight".to_string(),
                completion_criteria: "Hallway visible".to_string(),
                reasoning: None,
                origin: SubtaskOrigin::Fallback,
            },
            phase: "initial".to_string(),
            issued_at_step: 0,
            completed_at_step: None,
        }
    }

    fn summary(id: &str) -> EpisodeSummary {
        EpisodeSummary {
            run_id: Uuid::new_v4(),
            episode_id: id.to_string(),
            scene_id: "scene".to_string(),
            instruction: "Go".to_string(),
            total_steps: 1,
            total_subtasks: 1,
            fallback_subtasks: 1,
            fallback_verdicts: 0,
            termination: TerminationReason::Stopped,
            failed: false,
            final_metrics: MetricsSnapshot::default(),
            subtask_history: vec![subtask_record()],
            steps: vec![step(0)],
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn exporter_writes_expected_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = JsonExporter::new(dir.path());
        exporter.record_step("7", &step(0)).unwrap();
        exporter.record_step("7", &step(1)).unwrap();
        exporter.record_subtask("7", &subtask_record()).unwrap();
        exporter.finish_episode(&summary("7")).unwrap();

        let ep = dir.path().join("episode_7");
        assert!(ep.join("steps/step_0000.json").exists());
        assert!(ep.join("steps/step_0001.json").exists());
        assert!(ep.join("subtasks/subtask_1_initial.json").exists());
        assert!(ep.join("episode_summary.json").exists());
        assert_eq!(exporter.step_log("7").load().unwrap().len(), 2);
    }

    #[test]
    fn begin_episode_discards_earlier_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = JsonExporter::new(dir.path());
        exporter.record_step("7", &step(0)).unwrap();
        exporter.record_step("7", &step(1)).unwrap();
        exporter.record_subtask("7", &subtask_record()).unwrap();
        exporter.record_step("8", &step(0)).unwrap();

        exporter.begin_episode("7").unwrap();
        exporter.record_step("7", &step(0)).unwrap();

        assert_eq!(exporter.step_log("7").load().unwrap().len(), 1);
        assert!(exporter.subtask_log("7").load().unwrap().is_empty());
        assert!(!dir.path().join("episode_7/steps/step_0001.json").exists());
        assert_eq!(exporter.step_log("8").load().unwrap().len(), 1);
    }

    #[test]
    fn begin_episode_without_records_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = JsonExporter::new(dir.path());
        exporter.begin_episode("new").unwrap();
    }

    #[test]
    fn subtasks_are_logged_for_resume() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = JsonExporter::new(dir.path());
        let mut record = subtask_record();
        exporter.record_subtask("3", &record).unwrap();
        record.completed_at_step = Some(4);
        exporter.record_subtask("3", &record).unwrap();

        let history = exporter.subtask_log("3").load().unwrap();
        assert_eq!(history, vec![record]);
    }

    #[test]
    fn fallback_flag_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = JsonExporter::new(dir.path());
        exporter.record_subtask("1", &subtask_record()).unwrap();
        let text =
            fs::read_to_string(dir.path().join("episode_1/subtasks/subtask_1_initial.json")).unwrap();
        assert!(text.contains("\"origin\": \"fallback\""));
    }

    #[test]
    fn aggregate_lands_at_root() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = JsonExporter::new(dir.path());
        let path = exporter.write_aggregate(&RunAggregate::default()).unwrap();
        assert_eq!(path, dir.path().join("aggregate.json"));
        let back: RunAggregate = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(back, RunAggregate::default());
    }

    #[test]
    fn null_sink_accepts_everything() {
        let mut sink = NullSink;
        sink.record_step("x", &step(0)).unwrap();
        sink.finish_episode(&summary("x")).unwrap();
    }
}
