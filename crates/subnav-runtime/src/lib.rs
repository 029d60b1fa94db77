//! `subnav-runtime` – the decision layer of a subtask-driven navigation
//! episode.
//!
//! # Modules
//!
//! - [`episode`] – [`EpisodeController`][episode::EpisodeController]: the
//!   per-episode state machine (`AwaitingAction → Verifying → Terminated`)
//!   that routes executor actions to the simulator, keeps metrics current,
//!   and consults the planner at decision points.
//! - [`planner`] – [`SubtaskPlanner`][planner::SubtaskPlanner]: turns an
//!   instruction plus a directional observation bundle into the next
//!   subtask, a completion verdict, or a task-level completion check.  Every
//!   call is time-bounded and falls back to a tagged default instead of
//!   failing.
//! - [`prompts`] – prompt templates and the JSON reply contract.
//! - [`llm_driver`] – [`LlmDriver`][llm_driver::LlmDriver]: an
//!   OpenAI-compatible multimodal chat-completions client behind the
//!   [`ReasoningService`][llm_driver::ReasoningService] trait.
//! - [`scripted`] – [`ScriptedReasoner`][scripted::ScriptedReasoner]: canned
//!   replies for tests and offline runs.
//! - [`loop_guard`] – [`LoopGuard`][loop_guard::LoopGuard]: detects an agent
//!   that keeps acting without getting any closer to the goal.
//! - [`runner`] – [`EpisodeRunner`][runner::EpisodeRunner]: batch
//!   evaluation with export, resume and an evaluation ledger.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console
//!   logging plus optional OTLP span export.

pub mod episode;
pub mod llm_driver;
pub mod loop_guard;
pub mod planner;
pub mod prompts;
pub mod runner;
pub mod scripted;
pub mod telemetry;

pub use episode::{ControllerConfig, EpisodeBuilder, EpisodeController, EpisodeState, StepReport};
pub use llm_driver::{LlmConfig, LlmDriver, LlmError, ReasoningRequest, ReasoningService};
pub use loop_guard::LoopGuard;
pub use planner::{PlanningError, SubtaskPlanner, TaskCheck, Verification};
pub use runner::{ActionPolicy, DecisionContext, EpisodeRunner, RunError, RunReport, ScriptedPolicy};
pub use scripted::ScriptedReasoner;
pub use telemetry::{TracerProviderGuard, init_tracing};
