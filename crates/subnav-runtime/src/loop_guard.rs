//! [`LoopGuard`] – no-progress detector.
//!
//! Watches the distance to the goal after every step and signals when it has
//! stayed the same for too long, which in practice means the executor is
//! spinning in place.  Distances are compared at millimetre resolution so
//! floating-point noise from the simulator does not reset the streak.
//!
//! # Example
//!
//! ```rust
//! use subnav_runtime::loop_guard::LoopGuard;
//!
//! // Trip after more than 2 consecutive steps without progress.
//! let mut guard = LoopGuard::for_unchanged_steps(2);
//!
//! assert!(!guard.record(4.0)); // baseline
//! assert!(!guard.record(4.0)); // 1 unchanged
//! assert!(!guard.record(4.0)); // 2 unchanged
//! assert!(guard.record(4.0));  // 3 unchanged → stuck
//!
//! guard.reset();
//! assert!(!guard.record(4.0));
//! ```

use std::collections::VecDeque;

// ─────────────────────────────────────────────────────────────────────────────
// LoopGuard
// ─────────────────────────────────────────────────────────────────────────────

/// Detects a run of identical distance-to-goal readings.
#[derive(Debug, Clone)]
pub struct LoopGuard {
    /// Number of consecutive identical readings that counts as stuck.
    threshold: usize,
    /// Rolling window of the most recent readings, quantised.
    history: VecDeque<i64>,
}

impl LoopGuard {
    /// Stuck once `threshold` consecutive readings are identical.
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            threshold,
            history: VecDeque::with_capacity(threshold),
        }
    }

    /// Stuck after more than `steps` consecutive steps that left the
    /// distance unchanged.  The reading taken before those steps is the
    /// baseline, hence the window of `steps + 2`.
    pub fn for_unchanged_steps(steps: usize) -> Self {
        Self::new(steps + 2)
    }

    /// Record a distance-to-goal reading.  Returns `true` when stuck.
    pub fn record(&mut self, distance_to_goal: f64) -> bool {
        self.history.push_back(quantise(distance_to_goal));
        while self.history.len() > self.threshold {
            self.history.pop_front();
        }
        self.is_stuck()
    }

    /// `true` when the window is full and every reading in it is identical.
    pub fn is_stuck(&self) -> bool {
        if self.history.len() < self.threshold {
            return false;
        }
        let first = self.history[0];
        self.history.iter().all(|d| *d == first)
    }

    /// Consecutive unchanged steps at the end of the history.
    pub fn unchanged_streak(&self) -> usize {
        let Some(last) = self.history.back() else {
            return 0;
        };
        self.history.iter().rev().take_while(|d| *d == last).count() - 1
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}

fn quantise(distance: f64) -> i64 {
    (distance * 1000.0).round() as i64
}
