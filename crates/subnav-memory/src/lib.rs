//! `subnav-memory` – persistence of episode records.
//!
//! # Modules
//!
//! - [`sink`] – the [`EpisodeSink`][sink::EpisodeSink] export boundary, the
//!   on-disk [`JsonExporter`][sink::JsonExporter] and a discarding
//!   [`NullSink`][sink::NullSink].
//! - [`step_log`] – append-only JSONL [`StepLog`][step_log::StepLog] of
//!   executed steps, validated on load so interrupted episodes can resume.
//! - [`subtask_log`] – [`SubtaskLog`][subtask_log::SubtaskLog] of issued and
//!   completed subtasks, so a resumed episode keeps its full history.
//! - [`ledger`] – [`EvaluationLedger`][ledger::EvaluationLedger]: a SQLite
//!   table of finished episodes used to skip already-evaluated ids and to
//!   compute the run aggregate.

pub mod ledger;
pub mod sink;
pub mod step_log;
pub mod subtask_log;

use thiserror::Error;

pub use ledger::EvaluationLedger;
pub use sink::{EpisodeSink, JsonExporter, NullSink};
pub use step_log::StepLog;
pub use subtask_log::SubtaskLog;

/// Errors raised while persisting episode data.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Nav(#[from] subnav_types::NavError),
}
