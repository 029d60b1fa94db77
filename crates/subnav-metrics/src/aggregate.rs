//! Cross-episode averages.

use serde::{Deserialize, Serialize};
use subnav_types::MetricsSnapshot;

/// Mean final metrics over the completed episodes of a run.
///
/// Failed episodes (simulator or observation failures) are counted in
/// `skipped` and excluded from every average.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunAggregate {
    pub episodes: usize,
    pub skipped: usize,
    pub distance_to_goal: f64,
    pub success: f64,
    pub spl: f64,
    pub path_length: f64,
    pub oracle_success: f64,
}

impl RunAggregate {
    /// Average `(final_metrics, completed)` pairs.
    pub fn from_results<'a, I>(results: I) -> Self
    where
        I: IntoIterator<Item = (&'a MetricsSnapshot, bool)>,
    {
        let mut acc = Accumulator::default();
        for (metrics, completed) in results {
            acc.push(metrics, completed);
        }
        acc.finish()
    }
}

#[derive(Default)]
struct Accumulator {
    count: usize,
    skipped: usize,
    distance: f64,
    success: f64,
    spl: f64,
    path: f64,
    oracle: f64,
}

impl Accumulator {
    fn push(&mut self, m: &MetricsSnapshot, completed: bool) {
        if !completed {
            self.skipped += 1;
            return;
        }
        self.count += 1;
        self.distance += m.distance_to_goal;
        self.success += f64::from(u8::from(m.success));
        self.spl += m.spl.unwrap_or(0.0);
        self.path += m.path_length;
        self.oracle += f64::from(u8::from(m.oracle_success));
    }

    fn finish(self) -> RunAggregate {
        if self.count == 0 {
            return RunAggregate {
                skipped: self.skipped,
                ..RunAggregate::default()
            };
        }
        let n = self.count as f64;
        RunAggregate {
            episodes: self.count,
            skipped: self.skipped,
            distance_to_goal: self.distance / n,
            success: self.success / n,
            spl: self.spl / n,
            path_length: self.path / n,
            oracle_success: self.oracle / n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(distance: f64, success: bool, spl: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            distance_to_goal: distance,
            path_length: 4.0,
            success,
            oracle_success: true,
            spl: Some(spl),
        }
    }

    #[test]
    fn averages_completed_episodes_only() {
        let a = snap(2.0, true, 0.8);
        let b = snap(6.0, false, 0.0);
        let broken = snap(100.0, false, 0.0);
        let agg = RunAggregate::from_results([(&a, true), (&b, true), (&broken, false)]);
        assert_eq!(agg.episodes, 2);
        assert_eq!(agg.skipped, 1);
        assert!((agg.distance_to_goal - 4.0).abs() < 1e-12);
        assert!((agg.success - 0.5).abs() < 1e-12);
        assert!((agg.spl - 0.4).abs() < 1e-12);
        assert!((agg.oracle_success - 1.0).abs() < 1e-12);
    }

    #[test]
    fn empty_run_is_all_zero() {
        let agg = RunAggregate::from_results(std::iter::empty::<(&MetricsSnapshot, bool)>());
        assert_eq!(agg, RunAggregate::default());
    }

    #[test]
    fn serializes_field_names() {
        let json = serde_json::to_string(&RunAggregate::default()).unwrap();
        assert!(json.contains("\"oracle_success\""));
        assert!(json.contains("\"spl\""));
    }
}
