//! Prompt templates and reply shapes for the three planner calls.
//!
//! Every template embeds the full instruction, the direction summary of the
//! current bundle and a legend mapping `IMAGE 1…8` to the eight headings.
//! Replies are free text expected to contain one JSON object; see
//! [`extract_json`] for what is tolerated around it.

use schemars::JsonSchema;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use subnav_types::{Direction, Subtask, SubtaskOrigin, SubtaskRecord};

use crate::planner::PlanningError;

/// System prompt shared by all planner calls.
pub const SYSTEM_PROMPT: &str = "\
You are the planning and thinking module of a Vision-Language Navigation agent. \
You break a navigation instruction into short subtasks for a low-level action executor \
and judge progress from eight directional camera views. \
Always answer with a single JSON object and nothing else.";

/// How many past subtasks the verification prompt lists.
const HISTORY_WINDOW: usize = 5;

// ─────────────────────────────────────────────────────────────────────────────
// Templates
// ─────────────────────────────────────────────────────────────────────────────

fn image_legend() -> String {
    Direction::ALL
        .iter()
        .enumerate()
        .map(|(i, d)| format!("IMAGE {}: {} view", i + 1, d.label()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn observation_section(summary: &str) -> String {
    format!(
        "# Current Visual Observations (8 Directional Views)\n\
         The agent observes the environment from 8 directions, clockwise from front.\n\
         {summary}\n\n{}",
        image_legend()
    )
}

/// Prompt for the first subtask of an episode.
pub fn initial_prompt(instruction: &str, summary: &str) -> String {
    format!(
        "# Overall Navigation Task Instruction\n{instruction}\n\n\
         {observations}\n\n\
         # Task\n\
         1. Work out where the agent is and which way it faces from IMAGE 1.\n\
         2. Parse the instruction into an ordered list of waypoints.\n\
         3. Pick the NEXT waypoint that is visible or inferable and reachable in 5-15 actions.\n\n\
         # Output (strict JSON)\n\
         {{\n\
         \x20 \"subtask_description\": \"Action-oriented command: [ACTION] to [DESTINATION]\",\n\
         \x20 \"planning_hints\": \"Facing direction, where the destination is, which side to pass obstacles\",\n\
         \x20 \"completion_criteria\": \"Location, objects that should be visible, spatial relations; no IMAGE references\",\n\
         \x20 \"reasoning\": \"Spatial perception, choice of destination, path feasibility, citing IMAGE numbers\"\n\
         }}",
        observations = observation_section(summary),
    )
}

/// Prompt asking whether `current` is complete and what comes next.
pub fn verification_prompt(
    instruction: &str,
    current: &Subtask,
    summary: &str,
    history: &[SubtaskRecord],
) -> String {
    format!(
        "# Overall Navigation Goal\n{instruction}\n\n\
         # Subtask History\n{history}\n\n\
         # Current Subtask Being Verified\n\
         - Description: {description}\n\
         - Completion Criteria: {criteria}\n\
         - Planning Hints: {hints}\n\n\
         {observations}\n\n\
         # Task\n\
         1. Compare the 8 observations with the completion criteria.\n\
         2. If the subtask is COMPLETED, design the next subtask; set next_subtask to null only if the whole navigation goal is reached.\n\
         3. If it is NOT completed, give actionable advice: which actions, how many times, what to watch for.\n\n\
         # Output (strict JSON)\n\
         {{\n\
         \x20 \"is_completed\": true,\n\
         \x20 \"completion_analysis\": \"Analysis citing IMAGE numbers\",\n\
         \x20 \"next_subtask\": {{\n\
         \x20   \"subtask_description\": \"...\",\n\
         \x20   \"planning_hints\": \"...\",\n\
         \x20   \"completion_criteria\": \"...\"\n\
         \x20 }},\n\
         \x20 \"continuation_advice\": \"Advice if not completed, otherwise null\"\n\
         }}",
        history = history_section(history),
        description = current.description,
        criteria = current.completion_criteria,
        hints = current.planning_hints,
        observations = observation_section(summary),
    )
}

/// Prompt for the independent whole-task completion check.
pub fn task_completion_prompt(instruction: &str, summary: &str) -> String {
    format!(
        "# Overall Navigation Goal (Target to Reach)\n{instruction}\n\n\
         {observations}\n\n\
         # Task\n\
         Compare the target described in the goal with all 8 observations. \
         Does the location match, are the landmarks visible, is the agent positioned as described?\n\
         Confidence 0.9-1.0: everything matches. 0.7-0.9: minor adjustment needed. \
         0.5-0.7: significant differences. Below 0.5: wrong place. \
         Only mark completed when highly confident (>0.85).\n\n\
         # Output (strict JSON)\n\
         {{\n\
         \x20 \"task_completed\": false,\n\
         \x20 \"confidence\": 0.0,\n\
         \x20 \"analysis\": \"Evidence per goal element, citing IMAGE numbers\",\n\
         \x20 \"recommendation\": \"Next steps if not completed, otherwise null\"\n\
         }}",
        observations = observation_section(summary),
    )
}

fn history_section(history: &[SubtaskRecord]) -> String {
    if history.is_empty() {
        return "(none yet)".to_string();
    }
    let skip = history.len().saturating_sub(HISTORY_WINDOW);
    history
        .iter()
        .skip(skip)
        .map(|r| {
            let status = match r.completed_at_step {
                Some(step) => format!("completed at step {step}"),
                None => "in progress".to_string(),
            };
            format!("{}. {} ({status})", r.subtask.sequence, r.subtask.description)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ─────────────────────────────────────────────────────────────────────────────
// Reply shapes
// ─────────────────────────────────────────────────────────────────────────────

/// A subtask as the service writes it.  Older prompts name the description
/// `subtask_instruction`; either key is accepted.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct SubtaskReply {
    #[serde(default)]
    pub subtask_description: Option<String>,
    #[serde(default)]
    pub subtask_instruction: Option<String>,
    #[serde(default)]
    pub planning_hints: Option<String>,
    #[serde(default)]
    pub completion_criteria: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl SubtaskReply {
    /// Build a planned [`Subtask`]; every text field must be non-empty.
    pub fn into_subtask(self, sequence: u32) -> Result<Subtask, PlanningError> {
        let description = required(
            self.subtask_description.or(self.subtask_instruction),
            "subtask_description",
        )?;
        let planning_hints = required(self.planning_hints, "planning_hints")?;
        let completion_criteria = required(self.completion_criteria, "completion_criteria")?;
        Ok(Subtask {
            sequence,
            description,
            planning_hints,
            completion_criteria,
            reasoning: self.reasoning.filter(|r| !r.trim().is_empty()),
            origin: SubtaskOrigin::Planned,
        })
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct VerificationReply {
    pub is_completed: bool,
    #[serde(default)]
    pub completion_analysis: Option<String>,
    #[serde(default)]
    pub next_subtask: Option<SubtaskReply>,
    #[serde(default)]
    pub continuation_advice: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct TaskCheckReply {
    pub task_completed: bool,
    pub confidence: f64,
    pub analysis: String,
    #[serde(default)]
    pub recommendation: Option<String>,
}

/// JSON schema for a reply type, for the request's `response_format`.
pub fn schema_of<T: JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or(serde_json::Value::Null)
}

fn required(value: Option<String>, field: &str) -> Result<String, PlanningError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(PlanningError::Malformed(format!("missing or empty field `{field}`"))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Extraction
// ─────────────────────────────────────────────────────────────────────────────

/// The outermost JSON object in `text`, ignoring markdown fences and any
/// prose before or after it.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Extract and deserialize a reply.
pub fn parse_reply<T: DeserializeOwned>(text: &str) -> Result<T, PlanningError> {
    let json = extract_json(text)
        .ok_or_else(|| PlanningError::Malformed("no JSON object in reply".to_string()))?;
    serde_json::from_str(json).map_err(|e| PlanningError::Malformed(e.to_string()))
}
