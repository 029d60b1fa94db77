//! [`EpisodeRunner`] – batch evaluation over many episodes.
//!
//! The runner drives an [`EpisodeController`] per episode with actions from
//! an [`ActionPolicy`], exports every record through a [`JsonExporter`], and
//! keeps an [`EvaluationLedger`] so an interrupted run picks up where it
//! left off:
//!
//! - ids already in the ledger are skipped;
//! - an episode with a non-empty step log is resumed rather than restarted,
//!   keeping the subtask history logged before the interruption;
//! - a log that already ends with `STOP` is summarized and recorded as is.
//!
//! An episode that cannot be resumed is reported in
//! [`RunReport::rejected`]; the rest of the batch still runs.
//!
//! A policy that has no action left ends the episode with a forced stop.

use std::collections::HashMap;

use serde::Deserialize;
use subnav_hal::Simulator;
use subnav_memory::{EpisodeSink, EvaluationLedger, ExportError, JsonExporter, NullSink};
use subnav_metrics::RunAggregate;
use subnav_perception::ObservationAggregator;
use subnav_types::{Action, Episode, EpisodeSummary, NavError, Subtask};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::episode::{ControllerConfig, EpisodeController};
use crate::planner::SubtaskPlanner;

/// Errors that abort a batch run.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Nav(#[from] NavError),
    #[error("export failed: {0}")]
    Export(#[from] ExportError),
}

// ─────────────────────────────────────────────────────────────────────────────
// Action policies
// ─────────────────────────────────────────────────────────────────────────────

/// What a policy sees when asked for the next action.
#[derive(Debug)]
pub struct DecisionContext<'c> {
    pub episode: &'c Episode,
    /// Index the next step will get.
    pub step: usize,
    pub subtask: &'c Subtask,
    pub advice: Option<&'c str>,
}

/// Source of executor actions.
pub trait ActionPolicy: Send {
    /// `None` when the policy has nothing more to do for this episode.
    fn next_action(&mut self, context: &DecisionContext<'_>) -> Option<Action>;
}

/// Replays a fixed action list per episode id, indexed by step so resumed
/// episodes continue where their log ends.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPolicy {
    scripts: HashMap<String, Vec<Action>>,
}

impl ScriptedPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, episode_id: impl Into<String>, actions: Vec<Action>) -> Self {
        self.scripts.insert(episode_id.into(), actions);
        self
    }

    /// Parse `{"<episode_id>": [1, 1, 2, 0], ...}` using action ids.
    pub fn from_json(text: &str) -> Result<Self, NavError> {
        #[derive(Deserialize)]
        #[serde(transparent)]
        struct Scripts(HashMap<String, Vec<u8>>);

        let Scripts(raw) = serde_json::from_str(text)
            .map_err(|e| NavError::Configuration(format!("invalid action script: {e}")))?;
        let mut scripts = HashMap::with_capacity(raw.len());
        for (id, actions) in raw {
            let actions = actions
                .into_iter()
                .map(Action::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| NavError::Configuration(format!("episode {id}: {e}")))?;
            scripts.insert(id, actions);
        }
        Ok(Self { scripts })
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

impl ActionPolicy for ScriptedPolicy {
    fn next_action(&mut self, context: &DecisionContext<'_>) -> Option<Action> {
        self.scripts
            .get(&context.episode.episode_id)?
            .get(context.step)
            .copied()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EpisodeRunner
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of [`EpisodeRunner::run_all`].
#[derive(Debug, Default)]
pub struct RunReport {
    pub summaries: Vec<EpisodeSummary>,
    /// Ids skipped because the ledger already had them.
    pub already_evaluated: Vec<String>,
    /// Episodes that could not be run, e.g. because their step log is corrupt.
    pub rejected: Vec<(String, NavError)>,
    pub aggregate: RunAggregate,
}

pub struct EpisodeRunner {
    planner: SubtaskPlanner,
    config: ControllerConfig,
    exporter: Option<JsonExporter>,
    ledger: Option<EvaluationLedger>,
    composites: bool,
    run_id: Uuid,
}

impl EpisodeRunner {
    pub fn new(planner: SubtaskPlanner, config: ControllerConfig) -> Self {
        Self {
            planner,
            config,
            exporter: None,
            ledger: None,
            composites: true,
            run_id: Uuid::new_v4(),
        }
    }

    /// Export records under the exporter's root and resume from its step logs.
    pub fn with_exporter(mut self, exporter: JsonExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn with_ledger(mut self, ledger: EvaluationLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Skip writing compass composites.
    pub fn without_composites(mut self) -> Self {
        self.composites = false;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn ledger(&self) -> Option<&EvaluationLedger> {
        self.ledger.as_ref()
    }

    /// Run (or resume) one episode to termination.
    ///
    /// # Errors
    ///
    /// [`NavError::CorruptStepLog`] when an existing step log cannot be
    /// resumed, or an export error from the ledger.
    #[instrument(skip(self, sim, episode, policy), fields(episode_id = %episode.episode_id))]
    pub async fn run_episode(
        &mut self,
        sim: &mut dyn Simulator,
        episode: &Episode,
        policy: &mut dyn ActionPolicy,
    ) -> Result<EpisodeSummary, RunError> {
        let id = episode.episode_id.as_str();
        let mut aggregator = ObservationAggregator::new();
        let mut logged = Vec::new();
        let mut subtasks = Vec::new();
        if let Some(exporter) = &self.exporter {
            if self.composites {
                aggregator = aggregator.with_artifact_dir(exporter.compass_dir(id));
            }
            logged = exporter.step_log(id).load().map_err(persisted)?;
            if !logged.is_empty() {
                subtasks = exporter.subtask_log(id).load().map_err(persisted)?;
            }
        }

        let mut null = NullSink;
        let mut exporter = self.exporter.clone();
        let sink: &mut dyn EpisodeSink = match exporter.as_mut() {
            Some(e) => e,
            None => &mut null,
        };

        let builder = EpisodeController::builder(episode.clone(), sim, self.planner.clone())
            .aggregator(aggregator)
            .sink(sink)
            .config(self.config.clone())
            .run_id(self.run_id);
        let mut controller = if logged.is_empty() {
            builder.start().await
        } else {
            info!(logged = logged.len(), "resuming from step log");
            builder.resume(&logged, &subtasks).await?
        };

        while !controller.is_terminated() {
            let action = {
                let Some(subtask) = controller.current_subtask() else {
                    break;
                };
                let context = DecisionContext {
                    episode: controller.episode(),
                    step: controller.steps().len(),
                    subtask,
                    advice: controller.advice(),
                };
                policy.next_action(&context)
            };
            match action {
                Some(action) => {
                    controller.execute(action).await?;
                }
                None => {
                    info!("policy exhausted; forcing stop");
                    controller.force_stop();
                }
            }
        }

        let summary = controller.into_summary()?;
        if let Some(ledger) = &self.ledger {
            ledger.record(&summary)?;
        }
        Ok(summary)
    }

    /// Run every episode not yet in the ledger, in the order given.
    #[instrument(skip_all, fields(run_id = %self.run_id, episodes = episodes.len()))]
    pub async fn run_all(
        &mut self,
        sim: &mut dyn Simulator,
        episodes: &[Episode],
        policy: &mut dyn ActionPolicy,
    ) -> Result<RunReport, RunError> {
        let done = match &self.ledger {
            Some(ledger) => ledger.evaluated_ids()?,
            None => Default::default(),
        };
        let mut report = RunReport::default();

        for (i, episode) in episodes.iter().enumerate() {
            if done.contains(&episode.episode_id) {
                info!(episode_id = %episode.episode_id, "already evaluated; skipping");
                report.already_evaluated.push(episode.episode_id.clone());
                continue;
            }
            info!(
                episode_id = %episode.episode_id,
                progress = format!("{}/{}", i + 1, episodes.len()),
                "evaluating episode"
            );
            match self.run_episode(sim, episode, policy).await {
                Ok(summary) => report.summaries.push(summary),
                Err(RunError::Nav(e)) if !matches!(e, NavError::Configuration(_)) => {
                    warn!(episode_id = %episode.episode_id, error = %e, "episode rejected");
                    report.rejected.push((episode.episode_id.clone(), e));
                }
                Err(e) => return Err(e),
            }
        }

        report.aggregate = match &self.ledger {
            Some(ledger) => ledger.aggregate()?,
            None => RunAggregate::from_results(
                report
                    .summaries
                    .iter()
                    .map(|s| (&s.final_metrics, !s.failed)),
            ),
        };
        if let Some(exporter) = &self.exporter {
            let path = exporter.write_aggregate(&report.aggregate)?;
            info!(path = %path.display(), "aggregate written");
        }
        info!(
            evaluated = report.summaries.len(),
            success = report.aggregate.success,
            spl = report.aggregate.spl,
            "run complete"
        );
        Ok(report)
    }
}

/// Errors reading an episode's own logs concern that episode only.
fn persisted(e: ExportError) -> RunError {
    match e {
        ExportError::Nav(e) => RunError::Nav(e),
        e => RunError::Export(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subnav_types::{Pose, Position};

    fn episode(id: &str) -> Episode {
        Episode {
            episode_id: id.into(),
            scene_id: "s".into(),
            instruction: "go".into(),
            start: Pose::default(),
            goal: Position::new(1.0, 0.0, 0.0),
            shortest_path_length: 1.0,
        }
    }

    fn subtask() -> Subtask {
        crate::planner::fallback_subtask(1)
    }

    #[test]
    fn scripted_policy_indexes_by_step() {
        let mut policy =
            ScriptedPolicy::new().with_script("a", vec![Action::MoveForward, Action::Stop]);
        let ep = episode("a");
        let st = subtask();
        let ctx = |step| DecisionContext {
            episode: &ep,
            step,
            subtask: &st,
            advice: None,
        };
        assert_eq!(policy.next_action(&ctx(0)), Some(Action::MoveForward));
        assert_eq!(policy.next_action(&ctx(1)), Some(Action::Stop));
        assert_eq!(policy.next_action(&ctx(2)), None);
    }

    #[test]
    fn unknown_episode_has_no_actions() {
        let mut policy = ScriptedPolicy::new();
        let ep = episode("zzz");
        let st = subtask();
        let ctx = DecisionContext {
            episode: &ep,
            step: 0,
            subtask: &st,
            advice: None,
        };
        assert_eq!(policy.next_action(&ctx), None);
    }

    #[test]
    fn policy_from_json_uses_action_ids() {
        let policy = ScriptedPolicy::from_json(r#"{"a": [1, 2, 3, 0], "b": []}"#).unwrap();
        assert_eq!(policy.len(), 2);
        assert_eq!(
            policy.scripts["a"],
            vec![
                Action::MoveForward,
                Action::TurnLeft,
                Action::TurnRight,
                Action::Stop
            ]
        );
    }

    #[test]
    fn policy_from_json_rejects_unknown_ids() {
        let err = ScriptedPolicy::from_json(r#"{"a": [7]}"#).unwrap_err();
        assert!(matches!(err, NavError::Configuration(_)));
        assert!(ScriptedPolicy::from_json("not json").is_err());
    }
}
