//! Per-episode metrics.
//!
//! [`MetricsEngine::update`] is called once after every executed action and
//! returns the [`MetricsSnapshot`] stored in that step's record.  SPL is only
//! filled in by [`MetricsEngine::finalize`] at episode end.
//!
//! # Example
//!
//! ```rust
//! use subnav_metrics::MetricsEngine;
//! use subnav_types::{Pose, Position};
//!
//! let goal = Position::new(2.0, 0.0, 0.0);
//! let mut engine = MetricsEngine::new(Pose::default());
//! let pose = Pose::new(Position::new(0.25, 0.0, 0.0), 0.0);
//! engine.update(&pose, &goal, 2.0, false);
//! let snap = engine.update(&pose, &goal, 2.0, true);
//! assert!(snap.success);
//! assert_eq!(engine.finalize().spl, Some(1.0));
//! ```

use subnav_types::{MetricsSnapshot, Pose, Position};
use tracing::debug;

/// An agent that stops within this distance of the goal succeeds.
pub const SUCCESS_RADIUS_M: f64 = 3.0;

/// Accumulates metrics over one episode.
#[derive(Debug, Clone)]
pub struct MetricsEngine {
    last_position: Position,
    path_length: f64,
    oracle_success: bool,
    stopped: bool,
    shortest_path_length: f64,
    latest: MetricsSnapshot,
}

impl MetricsEngine {
    /// Start tracking from the episode's start pose.
    pub fn new(start: Pose) -> Self {
        Self {
            last_position: start.position,
            path_length: 0.0,
            oracle_success: false,
            stopped: false,
            shortest_path_length: 0.0,
            latest: MetricsSnapshot::default(),
        }
    }

    /// Record a step using the straight-line distance from `pose` to `goal`.
    pub fn update(
        &mut self,
        pose: &Pose,
        goal: &Position,
        shortest_path_length: f64,
        is_stop: bool,
    ) -> MetricsSnapshot {
        let distance = pose.position.distance_to(goal);
        self.update_with_distance(pose, distance, shortest_path_length, is_stop)
    }

    /// Record a step with a distance supplied by the simulator, e.g. a
    /// geodesic distance.
    pub fn update_with_distance(
        &mut self,
        pose: &Pose,
        distance_to_goal: f64,
        shortest_path_length: f64,
        is_stop: bool,
    ) -> MetricsSnapshot {
        let distance_to_goal = distance_to_goal.max(0.0);
        self.path_length += self.last_position.distance_to(&pose.position);
        self.last_position = pose.position;
        self.shortest_path_length = shortest_path_length.max(0.0);

        let within = distance_to_goal <= SUCCESS_RADIUS_M;
        self.oracle_success |= within;
        if is_stop {
            self.stopped = true;
        }

        self.latest = MetricsSnapshot {
            distance_to_goal,
            path_length: self.path_length,
            success: if is_stop { within } else { self.latest.success },
            oracle_success: self.oracle_success,
            spl: None,
        };
        debug!(
            distance_to_goal,
            path_length = self.path_length,
            oracle = self.oracle_success,
            "metrics updated"
        );
        self.latest
    }

    /// The most recent snapshot; all zero before the first update.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.latest
    }

    pub fn path_length(&self) -> f64 {
        self.path_length
    }

    /// `true` once a STOP has been recorded.
    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Final snapshot with SPL.  An episode that never stopped scores zero.
    pub fn finalize(&self) -> MetricsSnapshot {
        let success = self.stopped && self.latest.success;
        MetricsSnapshot {
            success,
            spl: Some(spl(success, self.shortest_path_length, self.path_length)),
            ..self.latest
        }
    }
}

/// Success weighted by path length.  Equals `success` when the shortest path
/// is zero.
pub fn spl(success: bool, shortest_path_length: f64, path_length: f64) -> f64 {
    let s = if success { 1.0 } else { 0.0 };
    if shortest_path_length <= 0.0 {
        return s;
    }
    s * shortest_path_length / path_length.max(shortest_path_length)
}
