//! `subnav eval` – batch evaluation of one dataset split.
//!
//! Output lands in `<output_dir>/split_<K>_of_<N>/` together with the
//! split's evaluation ledger, so several splits can run side by side and an
//! interrupted split resumes on the next invocation.

use std::fs;
use std::path::PathBuf;

use clap::Args;
use colored::Colorize;
use subnav_hal::KinematicSim;
use subnav_memory::{EvaluationLedger, JsonExporter};
use subnav_runtime::{EpisodeRunner, RunError, RunReport, ScriptedPolicy};
use subnav_types::NavError;
use tracing::info;

use crate::config::Config;
use crate::dataset;

#[derive(Debug, Args)]
pub struct EvalArgs {
    /// JSON array of episodes.
    #[arg(long)]
    pub dataset: PathBuf,
    /// Number of contiguous splits the sorted dataset is cut into.
    #[arg(long, default_value_t = 1)]
    pub split_num: usize,
    /// Which split to evaluate (0-based).
    #[arg(long, default_value_t = 0)]
    pub split_id: usize,
    /// JSON object mapping episode id to a list of action ids.
    #[arg(long)]
    pub actions: PathBuf,
    /// Evaluate at most this many episodes of the split.
    #[arg(long)]
    pub max_episodes: Option<usize>,
}

impl EvalArgs {
    pub fn output_dir(&self, cfg: &Config) -> PathBuf {
        cfg.output_dir
            .join(format!("split_{}_of_{}", self.split_id, self.split_num))
    }
}

pub async fn run(cfg: &Config, args: &EvalArgs) -> Result<RunReport, RunError> {
    let mut episodes = dataset::split(dataset::load(&args.dataset)?, args.split_num, args.split_id)?;
    if let Some(max) = args.max_episodes {
        episodes.truncate(max);
    }

    let script = fs::read_to_string(&args.actions).map_err(|e| {
        NavError::Configuration(format!("failed to read {}: {e}", args.actions.display()))
    })?;
    let mut policy = ScriptedPolicy::from_json(&script)?;

    let out = args.output_dir(cfg);
    let ledger = EvaluationLedger::open(&out.join("ledger.sqlite"))?;
    let mut sim = KinematicSim::new(episodes.clone()).with_config(cfg.sim_config());
    let mut runner = EpisodeRunner::new(crate::build_planner(cfg)?, cfg.controller_config())
        .with_exporter(JsonExporter::new(&out))
        .with_ledger(ledger);

    info!(
        split = args.split_id,
        of = args.split_num,
        episodes = episodes.len(),
        scripted = policy.len(),
        "starting evaluation"
    );
    println!(
        "  Evaluating {} episode(s) of split {}/{} → {}",
        episodes.len().to_string().bold(),
        args.split_id,
        args.split_num,
        out.display().to_string().bold()
    );

    let report = runner.run_all(&mut sim, &episodes, &mut policy).await?;
    print_report(&report);
    Ok(report)
}

fn print_report(report: &RunReport) {
    println!();
    println!("{}", "Evaluation summary".bold().underline());
    for s in &report.summaries {
        let outcome = if s.failed {
            "failed".red()
        } else if s.final_metrics.success {
            "success".green()
        } else {
            "miss".yellow()
        };
        println!(
            "  {:<12} {:<8} steps {:>4}  subtasks {:>2}  dist {:>6.2}m  spl {:.3}",
            s.episode_id,
            outcome,
            s.total_steps,
            s.total_subtasks,
            s.final_metrics.distance_to_goal,
            s.final_metrics.spl.unwrap_or(0.0)
        );
    }
    if !report.already_evaluated.is_empty() {
        println!(
            "  {} already evaluated, skipped",
            report.already_evaluated.len().to_string().dimmed()
        );
    }
    for (id, e) in &report.rejected {
        println!("  {} {}: {}", "rejected".red(), id, e);
    }
    let a = &report.aggregate;
    println!();
    println!(
        "  episodes {}  (skipped {})  success {:.3}  spl {:.3}  oracle {:.3}  dist {:.2}m  path {:.2}m",
        a.episodes, a.skipped, a.success, a.spl, a.oracle_success, a.distance_to_goal, a.path_length
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_dir_is_per_split() {
        let cfg = Config::default();
        let args = EvalArgs {
            dataset: PathBuf::from("d.json"),
            split_num: 4,
            split_id: 2,
            actions: PathBuf::from("a.json"),
            max_episodes: None,
        };
        assert_eq!(
            args.output_dir(&cfg),
            PathBuf::from("results").join("split_2_of_4")
        );
    }
}
