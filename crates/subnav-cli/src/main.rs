//! `subnav` – command-line entry point.
//!
//! 1. Loads `~/.subnav/config.toml` (or `--config`), applies `SUBNAV_*`
//!    overrides and validates it before any episode starts.
//! 2. `subnav manual` drops the operator into a per-episode control loop.
//! 3. `subnav eval` evaluates one dataset split with scripted actions,
//!    skipping episodes the split's ledger already holds.
//! 4. Ctrl-C force-stops the active manual episode; during evaluation it
//!    exits, leaving the step logs for the next run to resume from.

mod config;
mod dataset;
mod eval;
mod manual;
mod repl;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};
use colored::Colorize;
use subnav_runtime::{LlmDriver, SubtaskPlanner, telemetry};
use subnav_types::NavError;
use tracing::{error, warn};

#[derive(Parser)]
#[command(name = "subnav", version, about = "Subtask-driven navigation episodes")]
struct Cli {
    /// Config file (default: ~/.subnav/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Control episodes by hand with planner assistance.
    Manual {
        #[arg(long)]
        dataset: PathBuf,
        /// Run only this episode.
        #[arg(long)]
        episode: Option<String>,
    },
    /// Evaluate a dataset split with scripted actions.
    Eval(eval::EvalArgs),
}

/// Planner backed by the configured reasoning service.
pub(crate) fn build_planner(cfg: &config::Config) -> Result<SubtaskPlanner, NavError> {
    let driver = LlmDriver::new(cfg.llm_config())
        .map_err(|e| NavError::Configuration(format!("cannot build HTTP client: {e}")))?
        .with_action_space(cfg.simulator.forward_step_m, cfg.simulator.turn_angle_deg);
    Ok(SubtaskPlanner::new(Arc::new(driver))
        .with_timeout(cfg.llm_config().timeout)
        .with_response_schema(cfg.llm.structured_output))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = telemetry::init_tracing("subnav");

    print_banner();

    let path = cli.config.clone().unwrap_or_else(config::config_path);
    let cfg = match config::load(&path).and_then(|c| c.validate().map(|()| c)) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, path = %path.display(), "invalid configuration");
            eprintln!("{}: {}", "Config error".red().bold(), e);
            eprintln!("  (checked {})", path.display());
            return ExitCode::from(2);
        }
    };

    // Created after tracing so the span exporter never needs a runtime.
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    let manual_mode = matches!(cli.command, Command::Manual { .. });
    let flag = interrupted.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        if manual_mode {
            println!("{}", "⚠  Ctrl-C – force-stopping the active episode".yellow().bold());
            flag.store(true, Ordering::SeqCst);
        } else {
            println!(
                "{}",
                "⚠  Ctrl-C – stopping; step logs are kept and the next run resumes them."
                    .yellow()
                    .bold()
            );
            std::process::exit(130);
        }
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    let outcome = match &cli.command {
        Command::Manual { dataset, episode } => runtime
            .block_on(manual::session(&cfg, dataset, episode.as_deref(), interrupted))
            .map_err(|e| e.to_string()),
        Command::Eval(args) => runtime
            .block_on(eval::run(&cfg, args))
            .map(|_| ())
            .map_err(|e| e.to_string()),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn print_banner() {
    println!();
    println!("  {} {}", "subnav".bold().cyan(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Subtask-driven navigation episodes");
    println!();
}
