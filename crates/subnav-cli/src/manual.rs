//! `subnav manual` – operator-driven episodes.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use subnav_hal::KinematicSim;
use subnav_memory::JsonExporter;
use subnav_perception::ObservationAggregator;
use subnav_runtime::EpisodeController;
use subnav_types::{EpisodeSummary, NavError};

use crate::config::Config;
use crate::dataset;
use crate::repl::{self, ReplExit};

/// Run the selected episode, or every episode in order until the operator
/// types `exit`.
pub async fn session(
    cfg: &Config,
    dataset_path: &Path,
    episode_id: Option<&str>,
    interrupted: Arc<AtomicBool>,
) -> Result<(), NavError> {
    let episodes = dataset::load(dataset_path)?;
    let selected = match episode_id {
        Some(id) => vec![
            dataset::find(&episodes, id)
                .cloned()
                .ok_or_else(|| NavError::Configuration(format!("episode {id} is not in the dataset")))?,
        ],
        None => episodes.clone(),
    };

    let planner = crate::build_planner(cfg)?;
    let mut sim = KinematicSim::new(episodes).with_config(cfg.sim_config());
    let mut exporter = JsonExporter::new(&cfg.output_dir);
    let mut input = repl::spawn_stdin_reader();

    for episode in selected {
        println!();
        println!("{}", "═".repeat(72).bold().cyan());
        println!("  {} {}", "Episode".bold(), episode.episode_id.bold());
        println!("  {} {}", "Scene:".dimmed(), episode.scene_id);
        println!("  {} {}", "Instruction:".dimmed(), episode.instruction.italic());
        println!(
            "  {} {}",
            "Output:".dimmed(),
            exporter.episode_dir(&episode.episode_id).display()
        );
        println!("{}", "═".repeat(72).bold().cyan());

        interrupted.store(false, Ordering::SeqCst);
        let aggregator =
            ObservationAggregator::new().with_artifact_dir(exporter.compass_dir(&episode.episode_id));
        let mut controller = EpisodeController::builder(episode, &mut sim, planner.clone())
            .aggregator(aggregator)
            .sink(&mut exporter)
            .config(cfg.controller_config())
            .start()
            .await;

        let exit = repl::run(&mut controller, &mut input, interrupted.clone()).await;
        let summary = controller.into_summary()?;
        print_summary(&summary);
        if exit == ReplExit::Quit {
            break;
        }
    }
    Ok(())
}

fn print_summary(summary: &EpisodeSummary) {
    let m = &summary.final_metrics;
    println!();
    println!("{}", "Episode summary".bold().underline());
    println!("  termination   {:?}", summary.termination);
    println!(
        "  steps         {}  subtasks {} ({} fallback)",
        summary.total_steps, summary.total_subtasks, summary.fallback_subtasks
    );
    if summary.fallback_verdicts > 0 {
        println!("  fallback      {} verdict(s)", summary.fallback_verdicts);
    }
    println!("  distance      {:.2}m", m.distance_to_goal);
    println!("  path length   {:.2}m", m.path_length);
    let success = if m.success { "yes".green() } else { "no".red() };
    println!("  success       {success}");
    println!("  spl           {:.3}", m.spl.unwrap_or(0.0));
    println!("  oracle        {}", m.oracle_success);
    if summary.failed {
        println!("  {}", "episode failed".red().bold());
    }
}
