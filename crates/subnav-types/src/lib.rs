use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// The fixed discrete action vocabulary understood by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Stop,
    MoveForward,
    TurnLeft,
    TurnRight,
}

impl Action {
    pub const ALL: [Action; 4] = [
        Action::Stop,
        Action::MoveForward,
        Action::TurnLeft,
        Action::TurnRight,
    ];

    /// Numeric identifier used on the simulator wire (`STOP=0` … `TURN_RIGHT=3`).
    pub fn id(self) -> u8 {
        match self {
            Action::Stop => 0,
            Action::MoveForward => 1,
            Action::TurnLeft => 2,
            Action::TurnRight => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Action::Stop => "STOP",
            Action::MoveForward => "MOVE_FORWARD",
            Action::TurnLeft => "TURN_LEFT",
            Action::TurnRight => "TURN_RIGHT",
        }
    }

    pub fn is_stop(self) -> bool {
        self == Action::Stop
    }
}

impl TryFrom<u8> for Action {
    type Error = NavError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Action::ALL
            .into_iter()
            .find(|a| a.id() == id)
            .ok_or_else(|| NavError::SimulatorExecution {
                action: id.to_string(),
                details: "unknown action id".to_string(),
            })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A point in the simulator's world frame, in metres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Straight-line distance to `other`.
    pub fn distance_to(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Agent pose: position plus yaw (radians, counter-clockwise from +x).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub position: Position,
    pub heading_rad: f64,
}

impl Pose {
    pub fn new(position: Position, heading_rad: f64) -> Self {
        Self {
            position,
            heading_rad,
        }
    }
}

/// One navigation trial. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub episode_id: String,
    pub scene_id: String,
    pub instruction: String,
    pub start: Pose,
    pub goal: Position,
    /// Geodesic shortest-path length from `start` to `goal`, in metres.
    pub shortest_path_length: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Subtasks
// ─────────────────────────────────────────────────────────────────────────────

/// Where a subtask came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtaskOrigin {
    /// Parsed from a well-formed reasoning-service reply.
    Planned,
    /// The deterministic default used when planning failed.
    Fallback,
}

/// A unit of planned work. Replaced, never mutated, when a new one is issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub sequence: u32,
    pub description: String,
    pub planning_hints: String,
    pub completion_criteria: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub origin: SubtaskOrigin,
}

impl Subtask {
    pub fn is_fallback(&self) -> bool {
        self.origin == SubtaskOrigin::Fallback
    }
}

/// History entry for a subtask that has been current at some point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskRecord {
    pub subtask: Subtask,
    /// Decision-point label that produced the subtask (e.g. `"initial"`).
    pub phase: String,
    pub issued_at_step: usize,
    /// Step count at which verification judged it complete.
    pub completed_at_step: Option<usize>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Metrics and steps
// ─────────────────────────────────────────────────────────────────────────────

/// Navigation-quality metrics after a step.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub distance_to_goal: f64,
    pub path_length: f64,
    pub success: bool,
    pub oracle_success: bool,
    /// Only populated on the final snapshot of an episode.
    pub spl: Option<f64>,
}

/// Who decided an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSource {
    /// The step-by-step executor (human operator or policy).
    Executor,
    /// The controller itself (early stop, planner-finished, force stop).
    Controller,
}

/// One executed action. Appended monotonically, never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: usize,
    pub action: Action,
    pub source: ActionSource,
    pub subtask_sequence: u32,
    pub metrics: MetricsSnapshot,
    pub timestamp: DateTime<Utc>,
}

/// Why an episode ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "details")]
pub enum TerminationReason {
    Stopped,
    PlannerFinished,
    TaskCheckStop,
    ForceStopped,
    StepBudgetExceeded,
    RotationLimit,
    SimulatorDone,
    SimulatorFailure(String),
    ObservationFailure(String),
    /// Rebuilt from a step log that already ended with `STOP`; the reason
    /// recorded at the time was lost with the process.
    RecoveredFromLog,
}

impl TerminationReason {
    /// `true` when the episode ended because something broke rather than by
    /// a decision to stop.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TerminationReason::SimulatorFailure(_) | TerminationReason::ObservationFailure(_)
        )
    }
}

/// Everything handed to the export collaborator when an episode ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub run_id: Uuid,
    pub episode_id: String,
    pub scene_id: String,
    pub instruction: String,
    pub total_steps: usize,
    pub total_subtasks: usize,
    pub fallback_subtasks: usize,
    /// Verifications and task checks answered by the fallback path.
    #[serde(default)]
    pub fallback_verdicts: usize,
    pub termination: TerminationReason,
    pub failed: bool,
    pub final_metrics: MetricsSnapshot,
    pub subtask_history: Vec<SubtaskRecord>,
    pub steps: Vec<StepRecord>,
    pub finished_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Sensor data
// ─────────────────────────────────────────────────────────────────────────────

/// Pixel layout of a [`SensorFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Tightly packed 8-bit RGB, `width * height * 3` bytes.
    Rgb8,
    /// An encoded JPEG image.
    Jpeg,
    /// An encoded PNG image.
    Png,
}

impl PixelFormat {
    /// MIME type for encoded formats; `None` for raw pixels.
    pub fn mime(self) -> Option<&'static str> {
        match self {
            PixelFormat::Rgb8 => None,
            PixelFormat::Jpeg => Some("image/jpeg"),
            PixelFormat::Png => Some("image/png"),
        }
    }
}

/// A single image from one sensor channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl SensorFrame {
    /// A raw RGB frame filled with one colour.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = (width as usize) * (height as usize);
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&rgb);
        }
        Self {
            width,
            height,
            format: PixelFormat::Rgb8,
            data,
        }
    }
}

/// One of the eight fixed observation headings, clockwise from forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Front,
    FrontRight,
    Right,
    BackRight,
    Back,
    BackLeft,
    Left,
    FrontLeft,
}

impl Direction {
    /// All headings in clockwise order starting at forward.
    pub const ALL: [Direction; 8] = [
        Direction::Front,
        Direction::FrontRight,
        Direction::Right,
        Direction::BackRight,
        Direction::Back,
        Direction::BackLeft,
        Direction::Left,
        Direction::FrontLeft,
    ];

    /// Clockwise offset from forward, in degrees.
    pub fn degrees(self) -> u16 {
        self.index() as u16 * 45
    }

    /// Position in [`Direction::ALL`].
    pub fn index(self) -> usize {
        match self {
            Direction::Front => 0,
            Direction::FrontRight => 1,
            Direction::Right => 2,
            Direction::BackRight => 3,
            Direction::Back => 4,
            Direction::BackLeft => 5,
            Direction::Left => 6,
            Direction::FrontLeft => 7,
        }
    }

    /// Sensor channel the simulator publishes this heading on.
    pub fn channel(self) -> &'static str {
        match self {
            Direction::Front => "rgb",
            Direction::FrontRight => "rgb_front_right",
            Direction::Right => "rgb_right",
            Direction::BackRight => "rgb_back_right",
            Direction::Back => "rgb_back",
            Direction::BackLeft => "rgb_back_left",
            Direction::Left => "rgb_left",
            Direction::FrontLeft => "rgb_front_left",
        }
    }

    /// Short name, e.g. `"Front-Right"`.
    pub fn name(self) -> &'static str {
        match self {
            Direction::Front => "Front",
            Direction::FrontRight => "Front-Right",
            Direction::Right => "Right",
            Direction::BackRight => "Back-Right",
            Direction::Back => "Back",
            Direction::BackLeft => "Back-Left",
            Direction::Left => "Left",
            Direction::FrontLeft => "Front-Left",
        }
    }

    /// Human-readable label, e.g. `"Front-Right (45°)"`.
    pub fn label(self) -> String {
        format!("{} ({}°)", self.name(), self.degrees())
    }
}

/// Simulator sensor output keyed by channel name (e.g. `"rgb_left"`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawObservation {
    channels: BTreeMap<String, SensorFrame>,
}

impl RawObservation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, channel: impl Into<String>, frame: SensorFrame) {
        self.channels.insert(channel.into(), frame);
    }

    pub fn get(&self, channel: &str) -> Option<&SensorFrame> {
        self.channels.get(channel)
    }

    pub fn remove(&mut self, channel: &str) -> Option<SensorFrame> {
        self.channels.remove(channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Workspace-wide error taxonomy.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NavError {
    #[error("Incomplete observation: missing channels {missing:?}")]
    IncompleteObservation { missing: Vec<String> },

    #[error("Planning failed: {0}")]
    Planning(String),

    #[error("Simulator rejected {action}: {details}")]
    SimulatorExecution { action: String, details: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Corrupt step log at line {line}: {details}")]
    CorruptStepLog { line: usize, details: String },

    #[error("Illegal transition: cannot {operation} while {state}")]
    IllegalTransition { state: String, operation: String },
}
