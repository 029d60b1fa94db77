//! [`EpisodeController`] – the subtask lifecycle state machine.
//!
//! One controller owns one episode from reset to summary:
//!
//! ```text
//!              start
//!                │  aggregate "initial" bundle, plan subtask #1
//!                ▼
//!  ┌──────► AwaitingAction ──execute(action)──► simulator step, metrics
//!  │             │                                  │
//!  │          verify()                              ├─ STOP / sim done ─────────┐
//!  │             ▼                                  ├─ step budget / no progress┤ (controller STOP)
//!  │         Verifying ── planner verdict           └─ simulator error ─────────┤
//!  │             │                                                              ▼
//!  └─ not done / next subtask      finished (no next subtask, controller STOP) ─► Terminated
//! ```
//!
//! `force_stop` reaches `Terminated` from any state.  `Terminated` is
//! absorbing: [`EpisodeController::into_summary`] consumes the controller and
//! hands the [`EpisodeSummary`] to the sink exactly once.
//!
//! Simulator errors end the episode with a failure flag instead of
//! propagating.  Planner failures never reach the controller (the planner
//! falls back).  Sink failures are logged and ignored.

use std::mem;

use chrono::Utc;
use subnav_hal::Simulator;
use subnav_memory::{EpisodeSink, step_log};
use subnav_metrics::MetricsEngine;
use subnav_perception::{ObservationAggregator, ObservationBundle};
use subnav_types::{
    Action, ActionSource, Episode, EpisodeSummary, MetricsSnapshot, NavError, RawObservation,
    StepRecord, Subtask, SubtaskRecord, TerminationReason,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::loop_guard::LoopGuard;
use crate::planner::{SubtaskPlanner, TaskCheck, Verification};

/// Tolerance when comparing a replayed path length with the logged one.
const REPLAY_TOLERANCE_M: f64 = 1e-6;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Per-episode limits and triggers.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Executed actions after which the controller stops the episode.
    pub max_steps: usize,
    /// Stop after more than this many consecutive steps without a change in
    /// distance to goal.
    pub early_stop_rotation: usize,
    /// Verify automatically every N executed actions; 0 disables.
    pub verify_every: usize,
    /// Minimum task-check confidence for an automatic stop.
    pub stop_confidence: f64,
    /// Stop when the task check reports done with enough confidence.
    pub auto_stop_on_task_check: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_steps: 500,
            early_stop_rotation: 20,
            verify_every: 0,
            stop_confidence: 0.85,
            auto_stop_on_task_check: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of an episode.
#[derive(Debug, Clone, PartialEq)]
pub enum EpisodeState {
    /// Waiting for the next action or a verification trigger.
    AwaitingAction {
        subtask: Subtask,
        advice: Option<String>,
    },
    /// A planner request about `subtask` is in flight.
    Verifying { subtask: Subtask },
    Terminated { reason: TerminationReason },
}

impl EpisodeState {
    pub fn name(&self) -> &'static str {
        match self {
            EpisodeState::AwaitingAction { .. } => "awaiting_action",
            EpisodeState::Verifying { .. } => "verifying",
            EpisodeState::Terminated { .. } => "terminated",
        }
    }

    /// The current subtask; `None` once terminated.
    pub fn subtask(&self) -> Option<&Subtask> {
        match self {
            EpisodeState::AwaitingAction { subtask, .. } | EpisodeState::Verifying { subtask } => {
                Some(subtask)
            }
            EpisodeState::Terminated { .. } => None,
        }
    }
}

/// What one call to [`EpisodeController::execute`] did.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    /// The executor's step; `None` when the simulator rejected it.
    pub record: Option<StepRecord>,
    /// Set when the episode ended during this call.
    pub terminated: Option<TerminationReason>,
    /// Set when a periodic verification ran after the step.
    pub verification: Option<Verification>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Collects an episode's collaborators before [`start`](Self::start) or
/// [`resume`](Self::resume).
pub struct EpisodeBuilder<'a> {
    episode: Episode,
    sim: &'a mut dyn Simulator,
    planner: SubtaskPlanner,
    aggregator: ObservationAggregator,
    sink: Option<&'a mut dyn EpisodeSink>,
    config: ControllerConfig,
    run_id: Uuid,
}

impl<'a> EpisodeBuilder<'a> {
    pub fn aggregator(mut self, aggregator: ObservationAggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn sink(mut self, sink: &'a mut dyn EpisodeSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    fn assemble(self) -> EpisodeController<'a> {
        let start = self.episode.start;
        EpisodeController {
            guard: LoopGuard::for_unchanged_steps(self.config.early_stop_rotation),
            metrics: MetricsEngine::new(start),
            episode: self.episode,
            sim: self.sim,
            planner: self.planner,
            aggregator: self.aggregator,
            sink: self.sink,
            config: self.config,
            run_id: self.run_id,
            state: EpisodeState::Terminated {
                reason: TerminationReason::SimulatorFailure("not started".to_string()),
            },
            observation: RawObservation::new(),
            sim_done: false,
            steps: Vec::new(),
            history: Vec::new(),
            current_sequence: 0,
            steps_since_verify: 0,
            fallback_verdicts: 0,
        }
    }

    /// Reset the simulator and plan the first subtask.
    ///
    /// A failed reset or an incomplete first observation yields a controller
    /// that is already terminated with a failure reason.
    #[instrument(skip_all, fields(episode_id = %self.episode.episode_id))]
    pub async fn start(self) -> EpisodeController<'a> {
        let mut controller = self.assemble();
        if let Some(sink) = controller.sink.as_deref_mut()
            && let Err(e) = sink.begin_episode(&controller.episode.episode_id)
        {
            warn!(error = %e, "failed to clear earlier records");
        }
        let observation = match controller.sim.reset(&controller.episode.episode_id) {
            Ok(obs) => obs,
            Err(e) => {
                warn!(error = %e, "simulator reset failed");
                controller.terminate(TerminationReason::SimulatorFailure(e.to_string()));
                return controller;
            }
        };
        controller.observation = observation;
        controller.rebase_metrics();
        info!(instruction = %controller.episode.instruction, "episode started");
        controller.plan_from_scratch("initial").await;
        controller
    }

    /// Rebuild an interrupted episode from its step log and subtask history
    /// and plan a fresh subtask from where it stopped.
    ///
    /// A log that already ends with `STOP` yields a controller terminated
    /// with [`TerminationReason::RecoveredFromLog`], ready to summarize.  A
    /// failed reset yields a controller terminated as failed, as in
    /// [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// [`NavError::CorruptStepLog`] when the log is inconsistent or cannot be
    /// replayed.
    #[instrument(skip_all, fields(episode_id = %self.episode.episode_id, logged = records.len()))]
    pub async fn resume(
        self,
        records: &[StepRecord],
        subtasks: &[SubtaskRecord],
    ) -> Result<EpisodeController<'a>, NavError> {
        step_log::validate(records)?;

        let mut controller = self.assemble();
        let observation = match controller.sim.reset(&controller.episode.episode_id) {
            Ok(obs) => obs,
            Err(e) => {
                warn!(error = %e, "simulator reset failed");
                controller.terminate(TerminationReason::SimulatorFailure(e.to_string()));
                return Ok(controller);
            }
        };
        controller.observation = observation;
        controller.rebase_metrics();

        for (i, logged) in records.iter().enumerate() {
            let line = i + 1;
            let result =
                controller
                    .sim
                    .step(logged.action)
                    .map_err(|e| NavError::CorruptStepLog {
                        line,
                        details: format!("replay failed: {e}"),
                    })?;
            let snapshot =
                controller.score(&result.pose, result.geodesic_distance, logged.action.is_stop());
            if (snapshot.path_length - logged.metrics.path_length).abs() > REPLAY_TOLERANCE_M {
                return Err(NavError::CorruptStepLog {
                    line,
                    details: format!(
                        "replayed path length {:.3} differs from logged {:.3}",
                        snapshot.path_length, logged.metrics.path_length
                    ),
                });
            }
            controller.guard.record(snapshot.distance_to_goal);
            controller.observation = result.observation;
            controller.sim_done = result.done;
            controller.current_sequence = controller.current_sequence.max(logged.subtask_sequence);
            controller.steps.push(logged.clone());
        }
        controller.history = subtasks
            .iter()
            .filter(|r| r.issued_at_step <= records.len())
            .cloned()
            .collect();
        if let Some(last) = controller.history.last() {
            controller.current_sequence = controller.current_sequence.max(last.subtask.sequence);
        }
        info!(
            steps = controller.steps.len(),
            subtasks = controller.history.len(),
            "episode replayed"
        );

        if records.last().is_some_and(|r| r.action.is_stop()) {
            controller.terminate(TerminationReason::RecoveredFromLog);
        } else if controller.sim_done {
            controller.terminate(TerminationReason::SimulatorDone);
        } else {
            controller.plan_from_scratch("resume").await;
        }
        Ok(controller)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EpisodeController
// ─────────────────────────────────────────────────────────────────────────────

/// Drives one episode.  See the module docs for the state machine.
pub struct EpisodeController<'a> {
    episode: Episode,
    sim: &'a mut dyn Simulator,
    planner: SubtaskPlanner,
    aggregator: ObservationAggregator,
    sink: Option<&'a mut dyn EpisodeSink>,
    config: ControllerConfig,
    run_id: Uuid,
    state: EpisodeState,
    metrics: MetricsEngine,
    guard: LoopGuard,
    /// Sensors after the most recent reset or step.
    observation: RawObservation,
    sim_done: bool,
    steps: Vec<StepRecord>,
    history: Vec<SubtaskRecord>,
    current_sequence: u32,
    steps_since_verify: usize,
    fallback_verdicts: usize,
}

impl<'a> EpisodeController<'a> {
    pub fn builder(
        episode: Episode,
        sim: &'a mut dyn Simulator,
        planner: SubtaskPlanner,
    ) -> EpisodeBuilder<'a> {
        EpisodeBuilder {
            episode,
            sim,
            planner,
            aggregator: ObservationAggregator::new(),
            sink: None,
            config: ControllerConfig::default(),
            run_id: Uuid::new_v4(),
        }
    }

    // ── accessors ────────────────────────────────────────────────────────────

    pub fn episode(&self) -> &Episode {
        &self.episode
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> &EpisodeState {
        &self.state
    }

    pub fn current_subtask(&self) -> Option<&Subtask> {
        self.state.subtask()
    }

    /// Advice from the latest verification that did not complete the subtask.
    pub fn advice(&self) -> Option<&str> {
        match &self.state {
            EpisodeState::AwaitingAction { advice, .. } => advice.as_deref(),
            _ => None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, EpisodeState::Terminated { .. })
    }

    pub fn termination(&self) -> Option<&TerminationReason> {
        match &self.state {
            EpisodeState::Terminated { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn subtask_history(&self) -> &[SubtaskRecord] {
        &self.history
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    // ── operations ───────────────────────────────────────────────────────────

    /// Dispatch an executor action.
    ///
    /// # Errors
    ///
    /// [`NavError::IllegalTransition`] unless the episode is awaiting an
    /// action.  Simulator failures are not errors: they terminate the episode
    /// and are reported in the [`StepReport`].
    #[instrument(skip(self), fields(episode_id = %self.episode.episode_id))]
    pub async fn execute(&mut self, action: Action) -> Result<StepReport, NavError> {
        if !matches!(self.state, EpisodeState::AwaitingAction { .. }) {
            return Err(self.illegal("execute"));
        }

        let record = match self.dispatch(action, ActionSource::Executor) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, %action, "simulator rejected action");
                let reason = TerminationReason::SimulatorFailure(e.to_string());
                self.terminate(reason.clone());
                return Ok(StepReport {
                    record: None,
                    terminated: Some(reason),
                    verification: None,
                });
            }
        };
        self.steps_since_verify += 1;

        if action.is_stop() {
            self.terminate(TerminationReason::Stopped);
        } else if self.sim_done {
            self.terminate(TerminationReason::SimulatorDone);
        } else if self.steps.len() >= self.config.max_steps {
            info!(max_steps = self.config.max_steps, "step budget exhausted");
            self.controller_stop(TerminationReason::StepBudgetExceeded);
        } else if self.guard.is_stuck() {
            info!(
                unchanged = self.guard.unchanged_streak(),
                "no progress towards goal; stopping"
            );
            self.controller_stop(TerminationReason::RotationLimit);
        }

        let mut verification = None;
        if !self.is_terminated()
            && self.config.verify_every > 0
            && self.steps_since_verify >= self.config.verify_every
        {
            // An incomplete observation has already terminated the episode.
            match self.verify().await {
                Ok(v) => verification = Some(v),
                Err(e) => warn!(error = %e, "periodic verification failed"),
            }
        }

        Ok(StepReport {
            record: Some(record),
            terminated: self.termination().cloned(),
            verification,
        })
    }

    /// Ask the planner whether the current subtask is complete and apply the
    /// verdict.
    ///
    /// # Errors
    ///
    /// [`NavError::IllegalTransition`] unless awaiting an action.
    /// [`NavError::IncompleteObservation`] when the sensors are missing a
    /// heading; the episode is terminated as failed before returning.
    #[instrument(skip(self), fields(episode_id = %self.episode.episode_id))]
    pub async fn verify(&mut self) -> Result<Verification, NavError> {
        let subtask = match &self.state {
            EpisodeState::AwaitingAction { subtask, .. } => subtask.clone(),
            _ => return Err(self.illegal("verify")),
        };
        self.state = EpisodeState::Verifying {
            subtask: subtask.clone(),
        };
        self.steps_since_verify = 0;

        let phase = format!("verification_{}", subtask.sequence);
        let bundle = self.decision_point(&phase)?;
        let verdict = self
            .planner
            .verify_and_plan_next(&self.episode.instruction, &subtask, &bundle, &self.history)
            .await;
        self.fallback_verdicts += usize::from(verdict.fallback);

        if verdict.is_finished() {
            self.complete_current();
            info!("planner judged the episode finished");
            self.controller_stop(TerminationReason::PlannerFinished);
        } else if let (true, Some(next)) = (verdict.completed, &verdict.next_subtask) {
            self.complete_current();
            let phase = format!("subtask{}", next.sequence);
            self.issue(next.clone(), &phase);
        } else {
            self.state = EpisodeState::AwaitingAction {
                subtask,
                advice: verdict.advice.clone(),
            };
        }
        Ok(verdict)
    }

    /// Run the whole-task completion check.  Stops the episode when
    /// automatic stopping is enabled and the check is confident enough.
    ///
    /// # Errors
    ///
    /// As for [`verify`](Self::verify).
    #[instrument(skip(self), fields(episode_id = %self.episode.episode_id))]
    pub async fn check_completion(&mut self) -> Result<TaskCheck, NavError> {
        let (subtask, advice) = match &self.state {
            EpisodeState::AwaitingAction { subtask, advice } => (subtask.clone(), advice.clone()),
            _ => return Err(self.illegal("check completion")),
        };
        self.state = EpisodeState::Verifying {
            subtask: subtask.clone(),
        };

        let bundle = self.decision_point("task_check")?;
        let check = self
            .planner
            .check_task_completion(&self.episode.instruction, &bundle)
            .await;
        self.fallback_verdicts += usize::from(check.fallback);
        self.state = EpisodeState::AwaitingAction { subtask, advice };

        if self.config.auto_stop_on_task_check
            && check.done
            && check.confidence >= self.config.stop_confidence
        {
            info!(confidence = check.confidence, "task check confident; stopping");
            self.controller_stop(TerminationReason::TaskCheckStop);
        }
        Ok(check)
    }

    /// End the episode now, dispatching `STOP` if the simulator is still
    /// running.  Idempotent once terminated.
    #[instrument(skip(self), fields(episode_id = %self.episode.episode_id))]
    pub fn force_stop(&mut self) -> TerminationReason {
        if let EpisodeState::Terminated { reason } = &self.state {
            return reason.clone();
        }
        if !self.sim_done
            && let Err(e) = self.dispatch(Action::Stop, ActionSource::Controller)
        {
            warn!(error = %e, "STOP during force stop failed");
        }
        self.terminate(TerminationReason::ForceStopped);
        TerminationReason::ForceStopped
    }

    /// Consume a terminated controller and hand its summary to the sink.
    ///
    /// # Errors
    ///
    /// [`NavError::IllegalTransition`] while the episode is still active.
    pub fn into_summary(mut self) -> Result<EpisodeSummary, NavError> {
        let termination = match &self.state {
            EpisodeState::Terminated { reason } => reason.clone(),
            _ => return Err(self.illegal("summarize")),
        };
        let summary = EpisodeSummary {
            run_id: self.run_id,
            episode_id: self.episode.episode_id.clone(),
            scene_id: self.episode.scene_id.clone(),
            instruction: self.episode.instruction.clone(),
            total_steps: self.steps.len(),
            total_subtasks: self.history.len(),
            fallback_subtasks: self
                .history
                .iter()
                .filter(|r| r.subtask.is_fallback())
                .count(),
            fallback_verdicts: self.fallback_verdicts,
            failed: termination.is_failure(),
            termination,
            final_metrics: self.metrics.finalize(),
            subtask_history: mem::take(&mut self.history),
            steps: mem::take(&mut self.steps),
            finished_at: Utc::now(),
        };
        if let Some(sink) = self.sink.as_deref_mut()
            && let Err(e) = sink.finish_episode(&summary)
        {
            warn!(error = %e, "failed to export episode summary");
        }
        info!(
            episode_id = %summary.episode_id,
            steps = summary.total_steps,
            success = summary.final_metrics.success,
            spl = summary.final_metrics.spl.unwrap_or(0.0),
            "episode summarized"
        );
        Ok(summary)
    }

    // ── internals ────────────────────────────────────────────────────────────

    fn illegal(&self, operation: &str) -> NavError {
        NavError::IllegalTransition {
            state: self.state.name().to_string(),
            operation: operation.to_string(),
        }
    }

    /// Restart metrics and the progress guard from the simulator's pose.
    fn rebase_metrics(&mut self) {
        let pose = self.sim.pose();
        self.metrics = MetricsEngine::new(pose);
        self.guard.reset();
        self.guard
            .record(pose.position.distance_to(&self.sim.goal_position()));
    }

    fn score(
        &mut self,
        pose: &subnav_types::Pose,
        geodesic: Option<f64>,
        is_stop: bool,
    ) -> MetricsSnapshot {
        let shortest = self.sim.shortest_path_length();
        match geodesic {
            Some(d) => self
                .metrics
                .update_with_distance(pose, d, shortest, is_stop),
            None => self
                .metrics
                .update(pose, &self.sim.goal_position(), shortest, is_stop),
        }
    }

    /// Step the simulator, score and record the step.
    fn dispatch(&mut self, action: Action, source: ActionSource) -> Result<StepRecord, NavError> {
        let result = self.sim.step(action)?;
        let snapshot = self.score(&result.pose, result.geodesic_distance, action.is_stop());
        self.guard.record(snapshot.distance_to_goal);
        self.observation = result.observation;
        self.sim_done = result.done || action.is_stop();

        let record = StepRecord {
            step: self.steps.len(),
            action,
            source,
            subtask_sequence: self.current_sequence,
            metrics: snapshot,
            timestamp: Utc::now(),
        };
        if let Some(sink) = self.sink.as_deref_mut()
            && let Err(e) = sink.record_step(&self.episode.episode_id, &record)
        {
            warn!(error = %e, step = record.step, "failed to export step");
        }
        self.steps.push(record.clone());
        Ok(record)
    }

    /// Controller-issued STOP followed by termination with `reason`.
    fn controller_stop(&mut self, reason: TerminationReason) {
        if self.sim_done {
            self.terminate(reason);
            return;
        }
        match self.dispatch(Action::Stop, ActionSource::Controller) {
            Ok(_) => self.terminate(reason),
            Err(e) => {
                warn!(error = %e, "controller STOP failed");
                self.terminate(TerminationReason::SimulatorFailure(e.to_string()));
            }
        }
    }

    fn terminate(&mut self, reason: TerminationReason) {
        info!(
            episode_id = %self.episode.episode_id,
            reason = ?reason,
            steps = self.steps.len(),
            "episode terminated"
        );
        self.state = EpisodeState::Terminated { reason };
    }

    /// Aggregate the current sensors.  An incomplete observation terminates
    /// the episode.
    fn decision_point(&mut self, phase: &str) -> Result<ObservationBundle, NavError> {
        match self
            .aggregator
            .aggregate(&self.observation, phase, self.steps.len())
        {
            Ok(bundle) => Ok(bundle),
            Err(e) => {
                warn!(error = %e, phase, "observation incomplete");
                self.terminate(TerminationReason::ObservationFailure(e.to_string()));
                Err(e)
            }
        }
    }

    /// Plan a subtask with no prior context (episode start or resume).
    async fn plan_from_scratch(&mut self, phase: &str) {
        let Ok(bundle) = self.decision_point(phase) else {
            return;
        };
        let mut subtask = self
            .planner
            .plan_initial(&self.episode.instruction, &bundle)
            .await;
        subtask.sequence = self.current_sequence + 1;
        self.issue(subtask, phase);
    }

    /// Make `subtask` current.
    fn issue(&mut self, subtask: Subtask, phase: &str) {
        let record = SubtaskRecord {
            subtask: subtask.clone(),
            phase: phase.to_string(),
            issued_at_step: self.steps.len(),
            completed_at_step: None,
        };
        if let Some(sink) = self.sink.as_deref_mut()
            && let Err(e) = sink.record_subtask(&self.episode.episode_id, &record)
        {
            warn!(error = %e, "failed to export subtask");
        }
        info!(
            sequence = subtask.sequence,
            fallback = subtask.is_fallback(),
            description = %subtask.description,
            "subtask issued"
        );
        self.history.push(record);
        self.current_sequence = subtask.sequence;
        self.state = EpisodeState::AwaitingAction {
            subtask,
            advice: None,
        };
    }

    fn complete_current(&mut self) {
        let step = self.steps.len();
        let Some(record) = self.history.last_mut() else {
            return;
        };
        record.completed_at_step = Some(step);
        if let Some(sink) = self.sink.as_deref_mut()
            && let Err(e) = sink.record_subtask(&self.episode.episode_id, record)
        {
            warn!(error = %e, "failed to export subtask completion");
        }
    }
}
