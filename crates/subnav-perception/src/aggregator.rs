//! Observation aggregation at decision points.
//!
//! The [`ObservationAggregator`] is stateless apart from where it writes
//! diagnostic artifacts.  Every call checks that all eight directional
//! channels are present and returns them in clockwise order from forward.
//!
//! # Example
//!
//! ```rust
//! use subnav_perception::{Direction, ObservationAggregator};
//! use subnav_types::{RawObservation, SensorFrame};
//!
//! let mut raw = RawObservation::new();
//! for d in Direction::ALL {
//!     raw.insert(d.channel(), SensorFrame::solid(2, 2, [9, 9, 9]));
//! }
//! let bundle = ObservationAggregator::new().aggregate(&raw, "initial", 0).unwrap();
//! assert_eq!(bundle.frames().len(), 8);
//! assert!(bundle.summary().contains("Front-Right (45°)"));
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use subnav_types::{Direction, NavError, RawObservation, SensorFrame};
use tracing::{debug, warn};

use crate::compass;

/// One heading of a bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectionalFrame {
    pub direction: Direction,
    /// Human-readable label, e.g. `"Left (270°)"`.
    pub label: String,
    pub frame: SensorFrame,
}

/// Eight directional frames captured at one decision point.  Read-only once
/// built.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationBundle {
    frames: Vec<DirectionalFrame>,
    composite: Option<SensorFrame>,
    summary: String,
}

impl ObservationBundle {
    /// Frames in [`Direction::ALL`] order.
    pub fn frames(&self) -> &[DirectionalFrame] {
        &self.frames
    }

    pub fn frame(&self, direction: Direction) -> &DirectionalFrame {
        &self.frames[direction.index()]
    }

    pub fn composite(&self) -> Option<&SensorFrame> {
        self.composite.as_ref()
    }

    /// Direction → label listing for prompts.  Carries no pixel content.
    pub fn summary(&self) -> &str {
        &self.summary
    }
}

/// Builds [`ObservationBundle`]s from raw simulator output.
#[derive(Debug, Clone)]
pub struct ObservationAggregator {
    artifact_dir: Option<PathBuf>,
    render_composite: bool,
}

impl Default for ObservationAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservationAggregator {
    /// An aggregator that renders composites in memory but writes nothing.
    pub fn new() -> Self {
        Self {
            artifact_dir: None,
            render_composite: true,
        }
    }

    /// Write each composite to `dir/<phase>_step<N>.png`.
    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = Some(dir.into());
        self
    }

    /// Skip composite rendering entirely.
    pub fn without_composite(mut self) -> Self {
        self.render_composite = false;
        self
    }

    pub fn artifact_dir(&self) -> Option<&Path> {
        self.artifact_dir.as_deref()
    }

    /// Collect the eight headings of `raw`.
    ///
    /// # Errors
    ///
    /// [`NavError::IncompleteObservation`] listing every missing channel.
    pub fn aggregate(
        &self,
        raw: &RawObservation,
        phase: &str,
        step: usize,
    ) -> Result<ObservationBundle, NavError> {
        let missing: Vec<String> = Direction::ALL
            .iter()
            .filter(|d| raw.get(d.channel()).is_none())
            .map(|d| d.channel().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(NavError::IncompleteObservation { missing });
        }

        let frames: Vec<DirectionalFrame> = Direction::ALL
            .iter()
            .filter_map(|d| {
                raw.get(d.channel()).map(|frame| DirectionalFrame {
                    direction: *d,
                    label: d.label(),
                    frame: frame.clone(),
                })
            })
            .collect();

        let summary = summarize(&frames);
        let composite = if self.render_composite {
            compass::render(&frames)
        } else {
            None
        };

        if let (Some(dir), Some(image)) = (&self.artifact_dir, &composite) {
            self.write_artifact(dir, image, phase, step);
        }

        debug!(phase, step, composite = composite.is_some(), "observation aggregated");
        Ok(ObservationBundle {
            frames,
            composite,
            summary,
        })
    }

    fn write_artifact(&self, dir: &Path, image: &SensorFrame, phase: &str, step: usize) {
        let path = dir.join(format!("{phase}_step{step}.png"));
        let result = fs::create_dir_all(dir).and_then(|()| compass::write_png(&path, image));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to write compass composite");
        }
    }
}

fn summarize(frames: &[DirectionalFrame]) -> String {
    let mut lines = vec![format!("Observation summary ({} directions):", frames.len())];
    for (i, f) in frames.iter().enumerate() {
        lines.push(format!("  [IMAGE {}] {}", i + 1, f.label));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_observation() -> RawObservation {
        let mut raw = RawObservation::new();
        for d in Direction::ALL {
            raw.insert(d.channel(), SensorFrame::solid(3, 3, [d.index() as u8; 3]));
        }
        raw
    }

    #[test]
    fn bundle_is_clockwise_from_front() {
        let bundle = ObservationAggregator::new()
            .aggregate(&full_observation(), "initial", 0)
            .unwrap();
        let order: Vec<Direction> = bundle.frames().iter().map(|f| f.direction).collect();
        assert_eq!(order, Direction::ALL.to_vec());
        assert_eq!(bundle.frame(Direction::Left).label, "Left (270°)");
        assert_eq!(bundle.frame(Direction::Back).frame.data[0], 4);
    }

    #[test]
    fn missing_channels_are_reported() {
        let mut raw = full_observation();
        raw.remove("rgb_back");
        raw.remove("rgb_left");
        let err = ObservationAggregator::new()
            .aggregate(&raw, "verify", 3)
            .unwrap_err();
        assert_eq!(
            err,
            NavError::IncompleteObservation {
                missing: vec!["rgb_back".to_string(), "rgb_left".to_string()]
            }
        );
    }

    #[test]
    fn extra_channels_are_ignored() {
        let mut raw = full_observation();
        raw.insert("depth", SensorFrame::solid(1, 1, [0; 3]));
        let bundle = ObservationAggregator::new().aggregate(&raw, "initial", 0).unwrap();
        assert_eq!(bundle.frames().len(), 8);
    }

    #[test]
    fn summary_lists_labels_only() {
        let bundle = ObservationAggregator::new()
            .aggregate(&full_observation(), "initial", 0)
            .unwrap();
        let summary = bundle.summary();
        assert!(summary.starts_with("Observation summary (8 directions):"));
        assert!(summary.contains("[IMAGE 1] Front (0°)"));
        assert!(summary.contains("[IMAGE 8] Front-Left (315°)"));
        assert_eq!(summary.lines().count(), 9);
    }

    #[test]
    fn composite_can_be_disabled() {
        let bundle = ObservationAggregator::new()
            .without_composite()
            .aggregate(&full_observation(), "initial", 0)
            .unwrap();
        assert!(bundle.composite().is_none());
    }

    #[test]
    fn composite_is_written_to_artifact_dir() {
        let dir = tempfile::tempdir().unwrap();
        let compass_dir = dir.path().join("compass");
        let aggregator = ObservationAggregator::new().with_artifact_dir(&compass_dir);
        let bundle = aggregator
            .aggregate(&full_observation(), "verify", 12)
            .unwrap();
        assert!(bundle.composite().is_some());
        assert!(compass_dir.join("verify_step12.png").exists());
    }

    #[test]
    fn unwritable_artifact_dir_does_not_fail_aggregation() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let aggregator = ObservationAggregator::new().with_artifact_dir(blocker.join("sub"));
        assert!(aggregator.aggregate(&full_observation(), "initial", 0).is_ok());
    }
}
