//! [`SubtaskPlanner`] – structured planning on top of a [`ReasoningService`].
//!
//! Three requests: the initial subtask, verification of the current subtask
//! (with the next one when it is done), and an independent check of the whole
//! task.  Each request is bounded by a timeout and retried once when the
//! service fails, times out or returns a malformed reply.
//!
//! Every request has two forms:
//!
//! - `try_*` returns a [`PlanningError`] after the retry is spent;
//! - the plain form never fails.  It logs the error and returns a
//!   deterministic default tagged as a fallback, so the control loop always
//!   has something to act on.
//!
//! The planner holds no episode state; the controller applies its results.

use std::sync::Arc;
use std::time::Duration;

use subnav_perception::ObservationBundle;
use subnav_types::{Subtask, SubtaskOrigin, SubtaskRecord};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::llm_driver::{ImageAttachment, LlmError, ReasoningRequest, ReasoningService};
use crate::prompts::{self, SubtaskReply, TaskCheckReply, VerificationReply};

/// One call plus one retry.
pub const MAX_ATTEMPTS: usize = 2;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

pub const FALLBACK_DESCRIPTION: &str = "Move forward and reassess the surroundings";
pub const FALLBACK_HINTS: &str =
    "Keep moving straight and watch for landmarks named in the instruction";
pub const FALLBACK_CRITERIA: &str = "A landmark mentioned in the instruction is visible";
pub const DEFAULT_ADVICE: &str = "Continue executing the current subtask as planned.";

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Why a planning request produced no usable answer.
#[derive(Error, Debug)]
pub enum PlanningError {
    #[error("reasoning service failed: {0}")]
    Service(#[from] LlmError),
    #[error("reasoning service did not answer within {0:?}")]
    Timeout(Duration),
    #[error("malformed reply: {0}")]
    Malformed(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Results
// ─────────────────────────────────────────────────────────────────────────────

/// Verdict on the current subtask.
#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    pub completed: bool,
    /// The subtask to switch to.  `None` with `completed` means the whole
    /// episode is judged finished.
    pub next_subtask: Option<Subtask>,
    /// Guidance for the executor; present whenever `completed` is false.
    pub advice: Option<String>,
    pub analysis: Option<String>,
    /// `true` when this is the default verdict after a planning failure.
    pub fallback: bool,
}

impl Verification {
    /// Completed with no next subtask.
    pub fn is_finished(&self) -> bool {
        self.completed && self.next_subtask.is_none()
    }

    fn fallback(reason: &PlanningError) -> Self {
        Self {
            completed: false,
            next_subtask: None,
            advice: Some(DEFAULT_ADVICE.to_string()),
            analysis: Some(format!("verification unavailable: {reason}")),
            fallback: true,
        }
    }
}

/// Result of the whole-task completion check.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCheck {
    pub done: bool,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    pub analysis: String,
    pub recommendation: Option<String>,
    pub fallback: bool,
}

impl TaskCheck {
    fn fallback(reason: &PlanningError) -> Self {
        Self {
            done: false,
            confidence: 0.0,
            analysis: format!("task completion check unavailable: {reason}"),
            recommendation: None,
            fallback: true,
        }
    }
}

/// The default subtask used when planning fails.
pub fn fallback_subtask(sequence: u32) -> Subtask {
    Subtask {
        sequence,
        description: FALLBACK_DESCRIPTION.to_string(),
        planning_hints: FALLBACK_HINTS.to_string(),
        completion_criteria: FALLBACK_CRITERIA.to_string(),
        reasoning: None,
        origin: SubtaskOrigin::Fallback,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SubtaskPlanner
// ─────────────────────────────────────────────────────────────────────────────

/// Stateless request/response wrapper around a [`ReasoningService`].
#[derive(Clone)]
pub struct SubtaskPlanner {
    service: Arc<dyn ReasoningService>,
    timeout: Duration,
    send_schema: bool,
}

impl SubtaskPlanner {
    pub fn new(service: Arc<dyn ReasoningService>) -> Self {
        Self {
            service,
            timeout: DEFAULT_TIMEOUT,
            send_schema: false,
        }
    }

    /// Bound each attempt to `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send the reply's JSON schema as `response_format`.  Only useful with
    /// servers that support structured output.
    pub fn with_response_schema(mut self, enabled: bool) -> Self {
        self.send_schema = enabled;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    // ── initial planning ─────────────────────────────────────────────────────

    #[instrument(skip_all)]
    pub async fn try_plan_initial(
        &self,
        instruction: &str,
        bundle: &ObservationBundle,
    ) -> Result<Subtask, PlanningError> {
        let prompt = prompts::initial_prompt(instruction, bundle.summary());
        let request = self.request::<SubtaskReply>(prompt, bundle);
        let subtask = self
            .attempt(&request, |text| {
                prompts::parse_reply::<SubtaskReply>(text)?.into_subtask(1)
            })
            .await?;
        info!(description = %subtask.description, "initial subtask planned");
        Ok(subtask)
    }

    /// First subtask of an episode, or the fallback subtask.
    pub async fn plan_initial(&self, instruction: &str, bundle: &ObservationBundle) -> Subtask {
        match self.try_plan_initial(instruction, bundle).await {
            Ok(subtask) => subtask,
            Err(e) => {
                warn!(error = %e, "initial planning failed; using fallback subtask");
                fallback_subtask(1)
            }
        }
    }

    // ── verification ─────────────────────────────────────────────────────────

    #[instrument(skip_all, fields(subtask = current.sequence))]
    pub async fn try_verify_and_plan_next(
        &self,
        instruction: &str,
        current: &Subtask,
        bundle: &ObservationBundle,
        history: &[SubtaskRecord],
    ) -> Result<Verification, PlanningError> {
        let prompt = prompts::verification_prompt(instruction, current, bundle.summary(), history);
        let request = self.request::<VerificationReply>(prompt, bundle);
        let next_sequence = current.sequence + 1;
        let verification = self
            .attempt(&request, |text| {
                interpret_verification(prompts::parse_reply(text)?, next_sequence)
            })
            .await?;
        info!(
            completed = verification.completed,
            finished = verification.is_finished(),
            "subtask verified"
        );
        Ok(verification)
    }

    /// Verdict on `current`, or "not completed, carry on" on failure.
    pub async fn verify_and_plan_next(
        &self,
        instruction: &str,
        current: &Subtask,
        bundle: &ObservationBundle,
        history: &[SubtaskRecord],
    ) -> Verification {
        match self
            .try_verify_and_plan_next(instruction, current, bundle, history)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "verification failed; continuing current subtask");
                Verification::fallback(&e)
            }
        }
    }

    // ── task completion ──────────────────────────────────────────────────────

    #[instrument(skip_all)]
    pub async fn try_check_task_completion(
        &self,
        instruction: &str,
        bundle: &ObservationBundle,
    ) -> Result<TaskCheck, PlanningError> {
        let prompt = prompts::task_completion_prompt(instruction, bundle.summary());
        let request = self.request::<TaskCheckReply>(prompt, bundle);
        let check = self
            .attempt(&request, |text| {
                let reply: TaskCheckReply = prompts::parse_reply(text)?;
                if reply.analysis.trim().is_empty() {
                    return Err(PlanningError::Malformed(
                        "missing or empty field `analysis`".to_string(),
                    ));
                }
                Ok(TaskCheck {
                    done: reply.task_completed,
                    confidence: clamp_confidence(reply.confidence),
                    analysis: reply.analysis,
                    recommendation: reply.recommendation.filter(|r| !r.trim().is_empty()),
                    fallback: false,
                })
            })
            .await?;
        info!(done = check.done, confidence = check.confidence, "task completion checked");
        Ok(check)
    }

    /// Whole-task verdict, or "not done, zero confidence" on failure.
    pub async fn check_task_completion(
        &self,
        instruction: &str,
        bundle: &ObservationBundle,
    ) -> TaskCheck {
        match self.try_check_task_completion(instruction, bundle).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "task completion check failed");
                TaskCheck::fallback(&e)
            }
        }
    }

    // ── plumbing ─────────────────────────────────────────────────────────────

    fn request<T: schemars::JsonSchema>(
        &self,
        prompt: String,
        bundle: &ObservationBundle,
    ) -> ReasoningRequest {
        let images = bundle
            .frames()
            .iter()
            .filter_map(|f| ImageAttachment::from_frame(&f.frame))
            .collect();
        let request = ReasoningRequest::new(prompts::SYSTEM_PROMPT, prompt).with_images(images);
        if self.send_schema {
            request.with_schema(T::schema_name(), prompts::schema_of::<T>())
        } else {
            request
        }
    }

    async fn attempt<T, F>(&self, request: &ReasoningRequest, parse: F) -> Result<T, PlanningError>
    where
        F: Fn(&str) -> Result<T, PlanningError>,
    {
        let mut last_error = PlanningError::Malformed("no attempt made".to_string());
        for attempt in 1..=MAX_ATTEMPTS {
            let outcome = match tokio::time::timeout(self.timeout, self.service.complete(request))
                .await
            {
                Err(_) => Err(PlanningError::Timeout(self.timeout)),
                Ok(Err(e)) => Err(PlanningError::Service(e)),
                Ok(Ok(text)) => {
                    debug!(attempt, reply = %text, "reasoning reply received");
                    parse(&text)
                }
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(attempt, error = %e, "planning attempt failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

fn interpret_verification(
    reply: VerificationReply,
    next_sequence: u32,
) -> Result<Verification, PlanningError> {
    let analysis = reply.completion_analysis.filter(|a| !a.trim().is_empty());
    if !reply.is_completed {
        let advice = reply
            .continuation_advice
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ADVICE.to_string());
        return Ok(Verification {
            completed: false,
            next_subtask: None,
            advice: Some(advice),
            analysis,
            fallback: false,
        });
    }

    let next_subtask = match reply.next_subtask {
        Some(next) if !is_blank(&next) => Some(next.into_subtask(next_sequence)?),
        _ => None,
    };
    Ok(Verification {
        completed: true,
        next_subtask,
        advice: None,
        analysis,
        fallback: false,
    })
}

fn is_blank(reply: &SubtaskReply) -> bool {
    [
        &reply.subtask_description,
        &reply.subtask_instruction,
        &reply.planning_hints,
        &reply.completion_criteria,
    ]
    .iter()
    .all(|f| f.as_deref().is_none_or(|s| s.trim().is_empty()))
}

fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedReasoner;
    use subnav_perception::{Direction, ObservationAggregator};
    use subnav_types::{RawObservation, SensorFrame};

    const INITIAL_OK: &str = r#"{"subtask_description": "Walk to the door", "planning_hints": "Ahead", "completion_criteria": "Door close", "reasoning": "IMAGE 1 shows a door"}"#;

    fn bundle() -> ObservationBundle {
        let mut raw = RawObservation::new();
        for d in Direction::ALL {
            raw.insert(d.channel(), SensorFrame::solid(2, 2, [1, 1, 1]));
        }
        ObservationAggregator::new()
            .without_composite()
            .aggregate(&raw, "test", 0)
            .unwrap()
    }

    fn planner(reasoner: ScriptedReasoner) -> (SubtaskPlanner, Arc<ScriptedReasoner>) {
        let reasoner = Arc::new(reasoner);
        let planner = SubtaskPlanner::new(reasoner.clone()).with_timeout(Duration::from_millis(200));
        (planner, reasoner)
    }

    fn current() -> Subtask {
        Subtask {
            sequence: 3,
            description: "Reach the hallway".into(),
            planning_hints: "Left".into(),
            completion_criteria: "Hallway visible".into(),
            reasoning: None,
            origin: SubtaskOrigin::Planned,
        }
    }

    #[tokio::test]
    async fn initial_plan_parses_reply() {
        let (p, _) = planner(ScriptedReasoner::new().reply(format!("```json\n{INITIAL_OK}\n```")));
        let s = p.plan_initial("Go to the door", &bundle()).await;
        assert_eq!(s.sequence, 1);
        assert_eq!(s.description, "Walk to the door");
        assert_eq!(s.reasoning.as_deref(), Some("IMAGE 1 shows a door"));
        assert!(!s.is_fallback());
    }

    #[tokio::test]
    async fn initial_plan_retries_once_after_malformed_reply() {
        let (p, r) = planner(ScriptedReasoner::new().reply("not json").reply(INITIAL_OK));
        let s = p.plan_initial("Go", &bundle()).await;
        assert!(!s.is_fallback());
        assert_eq!(r.calls().await, 2);
    }

    #[tokio::test]
    async fn initial_plan_falls_back_after_two_failures() {
        let (p, r) = planner(
            ScriptedReasoner::new()
                .reply(r#"{"subtask_description": "Go"}"#)
                .failure("503"),
        );
        let s = p.plan_initial("Go", &bundle()).await;
        assert_eq!(s, fallback_subtask(1));
        assert_eq!(s.description, FALLBACK_DESCRIPTION);
        assert_eq!(r.calls().await, MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn try_variant_surfaces_planning_error() {
        let (p, _) = planner(ScriptedReasoner::new());
        let err = p.try_plan_initial("Go", &bundle()).await.unwrap_err();
        assert!(matches!(err, PlanningError::Service(_)));
    }

    #[tokio::test]
    async fn verification_not_completed_carries_advice() {
        let (p, _) = planner(ScriptedReasoner::new().reply(
            r#"{"is_completed": false, "completion_analysis": "far", "next_subtask": null, "continuation_advice": "Forward 4 more"}"#,
        ));
        let v = p.verify_and_plan_next("Goal", &current(), &bundle(), &[]).await;
        assert!(!v.completed);
        assert_eq!(v.advice.as_deref(), Some("Forward 4 more"));
        assert!(v.next_subtask.is_none());
        assert!(!v.fallback);
    }

    #[tokio::test]
    async fn verification_not_completed_without_advice_gets_default() {
        let (p, _) = planner(ScriptedReasoner::new().reply(r#"{"is_completed": false}"#));
        let v = p.verify_and_plan_next("Goal", &current(), &bundle(), &[]).await;
        assert_eq!(v.advice.as_deref(), Some(DEFAULT_ADVICE));
        assert!(!v.fallback);
    }

    #[tokio::test]
    async fn verification_completed_numbers_next_subtask() {
        let (p, _) = planner(ScriptedReasoner::new().reply(
            r#"{"is_completed": true, "completion_analysis": "there", "next_subtask": {"subtask_description": "Enter kitchen", "planning_hints": "Right", "completion_criteria": "Fridge visible"}}"#,
        ));
        let v = p.verify_and_plan_next("Goal", &current(), &bundle(), &[]).await;
        assert!(v.completed);
        let next = v.next_subtask.unwrap();
        assert_eq!(next.sequence, 4);
        assert_eq!(next.description, "Enter kitchen");
        assert!(v.advice.is_none());
    }

    #[tokio::test]
    async fn verification_completed_with_blank_next_is_finished() {
        let (p, _) = planner(ScriptedReasoner::new().reply(
            r#"{"is_completed": true, "next_subtask": {"subtask_description": "", "planning_hints": null, "completion_criteria": ""}}"#,
        ));
        let v = p.verify_and_plan_next("Goal", &current(), &bundle(), &[]).await;
        assert!(v.is_finished());
    }

    #[tokio::test]
    async fn verification_partial_next_subtask_is_retried_then_falls_back() {
        let partial = r#"{"is_completed": true, "next_subtask": {"subtask_description": "Enter"}}"#;
        let (p, r) = planner(ScriptedReasoner::new().reply(partial).reply(partial));
        let v = p.verify_and_plan_next("Goal", &current(), &bundle(), &[]).await;
        assert!(v.fallback);
        assert!(!v.completed);
        assert_eq!(v.advice.as_deref(), Some(DEFAULT_ADVICE));
        assert_eq!(r.calls().await, 2);
    }

    #[tokio::test]
    async fn verification_timeout_falls_back() {
        let reasoner = ScriptedReasoner::new()
            .reply(r#"{"is_completed": true, "next_subtask": null}"#)
            .reply(r#"{"is_completed": true, "next_subtask": null}"#)
            .with_delay(Duration::from_millis(500));
        let (p, _) = planner(reasoner);
        let v = p.verify_and_plan_next("Goal", &current(), &bundle(), &[]).await;
        assert!(v.fallback);
        assert!(!v.completed);
        assert!(v.analysis.unwrap().contains("did not answer"));
    }

    #[tokio::test]
    async fn task_check_clamps_confidence() {
        let (p, _) = planner(ScriptedReasoner::new().reply(
            r#"{"task_completed": true, "confidence": 1.7, "analysis": "sofa in IMAGE 1", "recommendation": null}"#,
        ));
        let c = p.check_task_completion("Stop at sofa", &bundle()).await;
        assert!(c.done);
        assert_eq!(c.confidence, 1.0);
        assert!(c.recommendation.is_none());
    }

    #[tokio::test]
    async fn task_check_falls_back_to_not_done() {
        let (p, _) = planner(ScriptedReasoner::new().reply("{}").reply("garbage"));
        let c = p.check_task_completion("Stop", &bundle()).await;
        assert!(!c.done);
        assert_eq!(c.confidence, 0.0);
        assert!(c.fallback);
    }

    #[tokio::test]
    async fn schema_is_attached_when_enabled() {
        let (p, _) = planner(ScriptedReasoner::new());
        let p = p.with_response_schema(true);
        let req = p.request::<TaskCheckReply>("x".into(), &bundle());
        assert_eq!(req.response_schema.unwrap().name, "TaskCheckReply");
    }

    #[tokio::test]
    async fn every_heading_is_attached_as_an_image() {
        let (p, r) = planner(ScriptedReasoner::new().reply(INITIAL_OK));
        p.plan_initial("Go to the door", &bundle()).await;
        assert_eq!(r.image_counts().await, vec![8]);
        let req = p.request::<TaskCheckReply>("x".into(), &bundle());
        assert!(req.images.iter().all(|img| img.mime == "image/png"));
    }

    #[test]
    fn confidence_nan_is_zero() {
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
        assert_eq!(clamp_confidence(-0.5), 0.0);
        assert_eq!(clamp_confidence(0.4), 0.4);
    }
}
