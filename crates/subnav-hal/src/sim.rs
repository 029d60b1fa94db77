//! In-process kinematic simulator for CI and CLI runs without a rendering
//! backend.
//!
//! [`KinematicSim`] holds a set of [`Episode`]s and moves a point agent on
//! the plane: `MOVE_FORWARD` advances a fixed stride along the heading, the
//! turns rotate by a fixed angle and `STOP` ends the episode.  Every
//! observation carries the eight directional channels as small flat-shaded
//! RGB frames whose shade depends on heading and position, so consecutive
//! observations differ.
//!
//! # Example
//!
//! ```rust
//! use subnav_hal::{KinematicSim, Simulator};
//! use subnav_types::{Action, Episode, Pose, Position};
//!
//! let episode = Episode {
//!     episode_id: "1".into(),
//!     scene_id: "demo".into(),
//!     instruction: "Walk forward".into(),
//!     start: Pose::default(),
//!     goal: Position::new(1.0, 0.0, 0.0),
//!     shortest_path_length: 1.0,
//! };
//! let mut sim = KinematicSim::new(vec![episode]);
//! sim.reset("1").expect("known episode");
//! let result = sim.step(Action::MoveForward).expect("forward must succeed");
//! assert!((result.pose.position.x - 0.25).abs() < 1e-9);
//! ```

use std::collections::{HashMap, HashSet};

use subnav_types::{
    Action, Direction, Episode, NavError, Pose, Position, RawObservation, SensorFrame,
};
use tracing::debug;

use crate::simulator::{Simulator, StepResult};

/// Stride of a `MOVE_FORWARD` action, in metres.
pub const DEFAULT_FORWARD_STEP_M: f64 = 0.25;
/// Rotation of a `TURN_LEFT` / `TURN_RIGHT` action, in degrees.
pub const DEFAULT_TURN_ANGLE_DEG: f64 = 30.0;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Kinematic parameters of the simulated agent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimConfig {
    pub forward_step_m: f64,
    pub turn_angle_deg: f64,
    /// Edge length of the square frames rendered per channel.
    pub frame_size: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            forward_step_m: DEFAULT_FORWARD_STEP_M,
            turn_angle_deg: DEFAULT_TURN_ANGLE_DEG,
            frame_size: 64,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// KinematicSim
// ────────────────────────────────────────────────────────────────────────────

/// Deterministic planar simulator implementing [`Simulator`].
pub struct KinematicSim {
    config: SimConfig,
    episodes: HashMap<String, Episode>,
    current: Option<Episode>,
    pose: Pose,
    over: bool,
    steps: usize,
    dropped_channels: HashSet<String>,
    fault_at_step: Option<usize>,
}

impl KinematicSim {
    /// Create a simulator over `episodes` with the default [`SimConfig`].
    pub fn new(episodes: Vec<Episode>) -> Self {
        Self {
            config: SimConfig::default(),
            episodes: episodes
                .into_iter()
                .map(|e| (e.episode_id.clone(), e))
                .collect(),
            current: None,
            pose: Pose::default(),
            over: true,
            steps: 0,
            dropped_channels: HashSet::new(),
            fault_at_step: None,
        }
    }

    /// Replace the kinematic parameters.
    pub fn with_config(mut self, config: SimConfig) -> Self {
        self.config = config;
        self
    }

    /// Never publish `channel`.  Emulates a missing camera.
    pub fn without_channel(mut self, channel: impl Into<String>) -> Self {
        self.dropped_channels.insert(channel.into());
        self
    }

    /// Fail the `step`-th call to [`Simulator::step`] (1-based) after a reset.
    pub fn with_fault_at_step(mut self, step: usize) -> Self {
        self.fault_at_step = Some(step);
        self
    }

    pub fn config(&self) -> SimConfig {
        self.config
    }

    /// `true` before the first reset and after `STOP`.
    pub fn is_over(&self) -> bool {
        self.over
    }

    fn render(&self) -> RawObservation {
        let mut obs = RawObservation::new();
        let size = self.config.frame_size;
        // Quantise to the stride so the shade changes once per forward step.
        let cell_x = (self.pose.position.x / self.config.forward_step_m).round() as i64;
        let cell_y = (self.pose.position.y / self.config.forward_step_m).round() as i64;
        let yaw_bucket = (self.pose.heading_rad.to_degrees().rem_euclid(360.0) / 15.0) as i64;
        for direction in Direction::ALL {
            if self.dropped_channels.contains(direction.channel()) {
                continue;
            }
            let seed = direction.index() as i64 * 31 + cell_x * 7 + cell_y * 13 + yaw_bucket * 5;
            let shade = seed.rem_euclid(200) as u8 + 40;
            obs.insert(
                direction.channel(),
                SensorFrame::solid(size, size, [shade, shade / 2, 255 - shade]),
            );
        }
        obs
    }

    fn distance_to_goal(&self) -> f64 {
        self.current
            .as_ref()
            .map(|e| self.pose.position.distance_to(&e.goal))
            .unwrap_or(0.0)
    }
}

impl Simulator for KinematicSim {
    fn reset(&mut self, episode_id: &str) -> Result<RawObservation, NavError> {
        let episode = self
            .episodes
            .get(episode_id)
            .cloned()
            .ok_or_else(|| NavError::SimulatorExecution {
                action: "reset".to_string(),
                details: format!("episode '{episode_id}' is not loaded"),
            })?;
        self.pose = episode.start;
        self.current = Some(episode);
        self.over = false;
        self.steps = 0;
        debug!(episode_id, "kinematic sim reset");
        Ok(self.render())
    }

    fn step(&mut self, action: Action) -> Result<StepResult, NavError> {
        if self.over {
            return Err(NavError::SimulatorExecution {
                action: action.label().to_string(),
                details: "episode is over; call reset first".to_string(),
            });
        }
        self.steps += 1;
        if self.fault_at_step == Some(self.steps) {
            return Err(NavError::SimulatorExecution {
                action: action.label().to_string(),
                details: format!("injected fault at step {}", self.steps),
            });
        }

        match action {
            Action::Stop => self.over = true,
            Action::MoveForward => {
                let stride = self.config.forward_step_m;
                self.pose.position.x += stride * self.pose.heading_rad.cos();
                self.pose.position.y += stride * self.pose.heading_rad.sin();
            }
            Action::TurnLeft => {
                self.pose.heading_rad += self.config.turn_angle_deg.to_radians();
            }
            Action::TurnRight => {
                self.pose.heading_rad -= self.config.turn_angle_deg.to_radians();
            }
        }

        Ok(StepResult {
            observation: self.render(),
            pose: self.pose,
            done: self.over,
            geodesic_distance: Some(self.distance_to_goal()),
        })
    }

    fn pose(&self) -> Pose {
        self.pose
    }

    fn goal_position(&self) -> Position {
        self.current.as_ref().map(|e| e.goal).unwrap_or_default()
    }

    fn shortest_path_length(&self) -> f64 {
        self.current
            .as_ref()
            .map(|e| e.shortest_path_length)
            .unwrap_or(0.0)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn episode() -> Episode {
        Episode {
            episode_id: "ep-1".to_string(),
            scene_id: "scene".to_string(),
            instruction: "Go forward".to_string(),
            start: Pose::default(),
            goal: Position::new(5.0, 0.0, 0.0),
            shortest_path_length: 5.0,
        }
    }

    #[test]
    fn reset_unknown_episode_fails() {
        let mut sim = KinematicSim::new(vec![episode()]);
        let err = sim.reset("nope").unwrap_err();
        assert!(matches!(err, NavError::SimulatorExecution { .. }));
    }

    #[test]
    fn reset_publishes_all_eight_channels() {
        let mut sim = KinematicSim::new(vec![episode()]);
        let obs = sim.reset("ep-1").unwrap();
        assert_eq!(obs.len(), 8);
        for d in Direction::ALL {
            assert!(obs.get(d.channel()).is_some(), "missing {}", d.channel());
        }
    }

    #[test]
    fn forward_moves_one_stride_along_heading() {
        let mut sim = KinematicSim::new(vec![episode()]);
        sim.reset("ep-1").unwrap();
        let result = sim.step(Action::MoveForward).unwrap();
        assert!((result.pose.position.x - 0.25).abs() < 1e-9);
        assert!(result.pose.position.y.abs() < 1e-9);
        assert!(!result.done);
        assert!((result.geodesic_distance.unwrap() - 4.75).abs() < 1e-9);
    }

    #[test]
    fn turns_rotate_without_translation() {
        let mut sim = KinematicSim::new(vec![episode()]);
        sim.reset("ep-1").unwrap();
        let left = sim.step(Action::TurnLeft).unwrap();
        assert!((left.pose.heading_rad - 30f64.to_radians()).abs() < 1e-9);
        let right = sim.step(Action::TurnRight).unwrap();
        assert!(right.pose.heading_rad.abs() < 1e-9);
        assert_eq!(right.pose.position, Position::default());
    }

    #[test]
    fn stop_ends_episode_and_rejects_further_actions() {
        let mut sim = KinematicSim::new(vec![episode()]);
        sim.reset("ep-1").unwrap();
        let result = sim.step(Action::Stop).unwrap();
        assert!(result.done);
        assert!(sim.is_over());
        let err = sim.step(Action::MoveForward).unwrap_err();
        assert!(matches!(err, NavError::SimulatorExecution { .. }));
    }

    #[test]
    fn dropped_channel_is_not_rendered() {
        let mut sim = KinematicSim::new(vec![episode()]).without_channel("rgb_back");
        let obs = sim.reset("ep-1").unwrap();
        assert_eq!(obs.len(), 7);
        assert!(obs.get("rgb_back").is_none());
    }

    #[test]
    fn injected_fault_fires_once_at_step() {
        let mut sim = KinematicSim::new(vec![episode()]).with_fault_at_step(2);
        sim.reset("ep-1").unwrap();
        sim.step(Action::MoveForward).unwrap();
        assert!(sim.step(Action::MoveForward).is_err());
    }

    #[test]
    fn goal_and_shortest_path_come_from_episode() {
        let mut sim = KinematicSim::new(vec![episode()]);
        sim.reset("ep-1").unwrap();
        assert_eq!(sim.goal_position(), Position::new(5.0, 0.0, 0.0));
        assert!((sim.shortest_path_length() - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn custom_config_changes_stride() {
        let mut sim = KinematicSim::new(vec![episode()]).with_config(SimConfig {
            forward_step_m: 0.5,
            turn_angle_deg: 90.0,
            frame_size: 2,
        });
        sim.reset("ep-1").unwrap();
        let result = sim.step(Action::MoveForward).unwrap();
        assert!((result.pose.position.x - 0.5).abs() < 1e-9);
        let frame = result.observation.get("rgb").unwrap();
        assert_eq!(frame.width, 2);
    }
}
