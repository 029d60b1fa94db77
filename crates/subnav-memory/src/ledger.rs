//! Evaluation ledger.
//!
//! Remembers which episodes a batch run has already finished so an
//! interrupted run can pick up where it stopped, and keeps their final
//! metrics for the run aggregate.
//!
//! # Storage layout
//!
//! | column           | type    | description                           |
//! |------------------|---------|---------------------------------------|
//! | episode_id       | TEXT    | primary key                           |
//! | run_id           | TEXT    | UUID of the controller run            |
//! | finished_at      | TEXT    | RFC-3339 time (UTC)                   |
//! | termination      | TEXT    | termination reason as JSON            |
//! | failed           | INTEGER | 1 when the episode ended in a failure |
//! | distance_to_goal | REAL    |                                       |
//! | success          | INTEGER |                                       |
//! | spl              | REAL    |                                       |
//! | path_length      | REAL    |                                       |
//! | oracle_success   | INTEGER |                                       |
//!
//! # Example
//!
//! ```rust
//! use subnav_memory::EvaluationLedger;
//!
//! let ledger = EvaluationLedger::open_in_memory().unwrap();
//! assert!(!ledger.is_evaluated("42").unwrap());
//! ```

use std::collections::HashSet;
use std::path::Path;

use rusqlite::{Connection, params};
use subnav_metrics::RunAggregate;
use subnav_types::{EpisodeSummary, MetricsSnapshot};
use tracing::info;

use crate::ExportError;

/// SQLite-backed record of finished episodes.
pub struct EvaluationLedger {
    conn: Connection,
}

impl EvaluationLedger {
    /// Open (or create) a ledger database at `path`.
    pub fn open(path: &Path) -> Result<Self, ExportError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let ledger = Self {
            conn: Connection::open(path)?,
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    pub fn open_in_memory() -> Result<Self, ExportError> {
        let ledger = Self {
            conn: Connection::open_in_memory()?,
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn init_schema(&self) -> Result<(), ExportError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS evaluated_episodes (
                episode_id       TEXT NOT NULL PRIMARY KEY,
                run_id           TEXT NOT NULL,
                finished_at      TEXT NOT NULL,
                termination      TEXT NOT NULL,
                failed           INTEGER NOT NULL,
                distance_to_goal REAL NOT NULL,
                success          INTEGER NOT NULL,
                spl              REAL NOT NULL,
                path_length      REAL NOT NULL,
                oracle_success   INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Store (or replace) the outcome of a finished episode.
    pub fn record(&self, summary: &EpisodeSummary) -> Result<(), ExportError> {
        let m = &summary.final_metrics;
        let termination = serde_json::to_string(&summary.termination)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO evaluated_episodes
                 (episode_id, run_id, finished_at, termination, failed,
                  distance_to_goal, success, spl, path_length, oracle_success)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                summary.episode_id,
                summary.run_id.to_string(),
                summary.finished_at.to_rfc3339(),
                termination,
                summary.failed,
                m.distance_to_goal,
                m.success,
                m.spl.unwrap_or(0.0),
                m.path_length,
                m.oracle_success,
            ],
        )?;
        info!(episode_id = %summary.episode_id, failed = summary.failed, "episode recorded in ledger");
        Ok(())
    }

    pub fn is_evaluated(&self, episode_id: &str) -> Result<bool, ExportError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM evaluated_episodes WHERE episode_id = ?1",
            params![episode_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn evaluated_ids(&self) -> Result<HashSet<String>, ExportError> {
        let mut stmt = self
            .conn
            .prepare("SELECT episode_id FROM evaluated_episodes")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    /// Averages over every recorded episode that did not fail.
    pub fn aggregate(&self) -> Result<RunAggregate, ExportError> {
        let mut stmt = self.conn.prepare(
            "SELECT failed, distance_to_goal, success, spl, path_length, oracle_success
             FROM evaluated_episodes",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let failed: bool = row.get(0)?;
                let snapshot = MetricsSnapshot {
                    distance_to_goal: row.get(1)?,
                    success: row.get(2)?,
                    spl: Some(row.get(3)?),
                    path_length: row.get(4)?,
                    oracle_success: row.get(5)?,
                };
                Ok((snapshot, !failed))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RunAggregate::from_results(
            rows.iter().map(|(m, completed)| (m, *completed)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use subnav_types::TerminationReason;
    use uuid::Uuid;

    fn summary(id: &str, success: bool, termination: TerminationReason) -> EpisodeSummary {
        EpisodeSummary {
            run_id: Uuid::new_v4(),
            episode_id: id.to_string(),
            scene_id: "scene".to_string(),
            instruction: "Go".to_string(),
            total_steps: 3,
            total_subtasks: 1,
            fallback_subtasks: 0,
            fallback_verdicts: 0,
            failed: termination.is_failure(),
            termination,
            final_metrics: MetricsSnapshot {
                distance_to_goal: if success { 1.0 } else { 5.0 },
                path_length: 2.0,
                success,
                oracle_success: true,
                spl: Some(if success { 1.0 } else { 0.0 }),
            },
            subtask_history: Vec::new(),
            steps: Vec::new(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn recorded_episodes_are_evaluated() {
        let ledger = EvaluationLedger::open_in_memory().unwrap();
        ledger
            .record(&summary("1", true, TerminationReason::Stopped))
            .unwrap();
        assert!(ledger.is_evaluated("1").unwrap());
        assert!(!ledger.is_evaluated("2").unwrap());
        assert_eq!(ledger.evaluated_ids().unwrap().len(), 1);
    }

    #[test]
    fn rerecording_replaces_row() {
        let ledger = EvaluationLedger::open_in_memory().unwrap();
        ledger
            .record(&summary("1", false, TerminationReason::Stopped))
            .unwrap();
        ledger
            .record(&summary("1", true, TerminationReason::Stopped))
            .unwrap();
        let agg = ledger.aggregate().unwrap();
        assert_eq!(agg.episodes, 1);
        assert!((agg.success - 1.0).abs() < 1e-12);
    }

    #[test]
    fn aggregate_skips_failed_episodes() {
        let ledger = EvaluationLedger::open_in_memory().unwrap();
        ledger
            .record(&summary("1", true, TerminationReason::Stopped))
            .unwrap();
        ledger
            .record(&summary("2", false, TerminationReason::StepBudgetExceeded))
            .unwrap();
        ledger
            .record(&summary(
                "3",
                false,
                TerminationReason::SimulatorFailure("boom".into()),
            ))
            .unwrap();
        let agg = ledger.aggregate().unwrap();
        assert_eq!(agg.episodes, 2);
        assert_eq!(agg.skipped, 1);
        assert!((agg.success - 0.5).abs() < 1e-12);
        assert!((agg.distance_to_goal - 3.0).abs() < 1e-12);
    }

    #[test]
    fn ledger_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.sqlite");
        {
            let ledger = EvaluationLedger::open(&path).unwrap();
            ledger
                .record(&summary("9", true, TerminationReason::Stopped))
                .unwrap();
        }
        let ledger = EvaluationLedger::open(&path).unwrap();
        assert!(ledger.is_evaluated("9").unwrap());
    }
}
