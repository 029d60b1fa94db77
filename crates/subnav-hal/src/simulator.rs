//! Generic `Simulator` trait consumed by the episode controller.

use subnav_types::{Action, NavError, Pose, Position, RawObservation};

/// Outcome of a single [`Simulator::step`].
#[derive(Debug, Clone)]
pub struct StepResult {
    /// Sensor output rendered at the new pose.
    pub observation: RawObservation,
    /// Agent pose after the action.
    pub pose: Pose,
    /// `true` once the simulator considers the episode over.
    pub done: bool,
    /// Geodesic distance to the goal when the backend can compute one.
    /// `None` means callers fall back to straight-line distance.
    pub geodesic_distance: Option<f64>,
}

/// A navigation simulator.
///
/// Implementations are driven strictly sequentially by one controller; no
/// call is issued before the previous one returned.
pub trait Simulator: Send {
    /// Load `episode_id`, place the agent at its start pose and return the
    /// first observation.
    ///
    /// # Errors
    ///
    /// Returns [`NavError::SimulatorExecution`] if the episode is unknown.
    fn reset(&mut self, episode_id: &str) -> Result<RawObservation, NavError>;

    /// Execute `action` and return the resulting state.
    ///
    /// # Errors
    ///
    /// Returns [`NavError::SimulatorExecution`] for actions issued after the
    /// episode ended or when the backend faults.
    fn step(&mut self, action: Action) -> Result<StepResult, NavError>;

    /// Current agent pose.
    fn pose(&self) -> Pose;

    /// Goal position of the loaded episode.
    fn goal_position(&self) -> Position;

    /// Geodesic shortest-path length of the loaded episode.
    fn shortest_path_length(&self) -> f64;
}
