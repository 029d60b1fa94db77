//! Manual-control loop for a single episode.
//!
//! Keys:
//!   0 – STOP          1 – MOVE_FORWARD
//!   2 – TURN_LEFT     3 – TURN_RIGHT
//!   c – verify the current subtask
//!   t – run the task-completion check
//!   q – force-stop this episode
//!   exit – force-stop and quit the session
//!
//! Ctrl-C force-stops the active episode, including while the prompt waits
//! for input or a planner request is in flight.  Stdin is read on its own
//! thread (see [`spawn_stdin_reader`]) so the wait can be cancelled.

use std::future::Future;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use colored::Colorize;
use subnav_runtime::{EpisodeController, StepReport, TaskCheck, Verification};
use subnav_types::{Action, Subtask};
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplExit {
    /// The episode terminated; move on.
    EpisodeOver,
    /// The operator asked to leave the session.
    Quit,
}

enum Command {
    Act(Action),
    Verify,
    TaskCheck,
    ForceStop,
    Exit,
    Help,
}

fn parse(input: &str) -> Option<Command> {
    match input {
        "c" => Some(Command::Verify),
        "t" => Some(Command::TaskCheck),
        "q" => Some(Command::ForceStop),
        "exit" => Some(Command::Exit),
        "h" | "help" | "?" => Some(Command::Help),
        other => other
            .parse::<u8>()
            .ok()
            .and_then(|id| Action::try_from(id).ok())
            .map(Command::Act),
    }
}

/// Forward stdin lines from a background thread.  The channel closes at end
/// of input or after the first read error.
pub fn spawn_stdin_reader() -> UnboundedReceiver<io::Result<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let failed = line.is_err();
            if tx.send(line).is_err() || failed {
                break;
            }
        }
    });
    rx
}

/// Drive `controller` from `input` lines until the episode terminates.
pub async fn run(
    controller: &mut EpisodeController<'_>,
    input: &mut UnboundedReceiver<io::Result<String>>,
    interrupted: Arc<AtomicBool>,
) -> ReplExit {
    let mut stdout = io::stdout();
    let mut shown_subtask = None;

    while !controller.is_terminated() {
        if interrupted.swap(false, Ordering::SeqCst) {
            controller.force_stop();
            break;
        }

        if let Some(subtask) = controller.current_subtask()
            && shown_subtask != Some(subtask.sequence)
        {
            print_subtask(subtask);
            shown_subtask = Some(subtask.sequence);
        }
        print_status(controller);

        print!("{} ", "action [0-3 c t q exit]>".bold().cyan());
        stdout.flush().ok();

        let line = match interruptible(input.recv(), &interrupted).await {
            None => continue,
            Some(None) => {
                controller.force_stop();
                return ReplExit::Quit;
            }
            Some(Some(Err(e))) => {
                eprintln!("{}: {}", "Read error".red(), e);
                controller.force_stop();
                return ReplExit::Quit;
            }
            Some(Some(Ok(line))) => line,
        };

        if interrupted.load(Ordering::SeqCst) {
            continue;
        }

        let Some(command) = parse(line.trim()) else {
            if !line.trim().is_empty() {
                println!("{} '{}'", "Unknown input:".red(), line.trim().yellow());
            }
            continue;
        };

        match command {
            Command::Act(action) => match controller.execute(action).await {
                Ok(report) => print_step(&report),
                Err(e) => println!("{}: {}", "Rejected".red(), e),
            },
            Command::Verify => {
                match interruptible(controller.verify(), &interrupted).await {
                    Some(Ok(v)) => print_verification(&v),
                    Some(Err(e)) => println!("{}: {}", "Verification failed".red(), e),
                    None => continue,
                }
            }
            Command::TaskCheck => {
                match interruptible(controller.check_completion(), &interrupted).await {
                    Some(Ok(check)) => print_task_check(&check),
                    Some(Err(e)) => println!("{}: {}", "Task check failed".red(), e),
                    None => continue,
                }
            }
            Command::ForceStop => {
                controller.force_stop();
            }
            Command::Exit => {
                controller.force_stop();
                return ReplExit::Quit;
            }
            Command::Help => print_help(),
        }
    }

    if let Some(reason) = controller.termination() {
        println!("{} {:?}", "Episode ended:".bold(), reason);
    }
    ReplExit::EpisodeOver
}

/// Await `fut` unless Ctrl-C arrives first.  The flag stays set so the loop
/// force-stops on its next turn.
async fn interruptible<F: Future>(fut: F, interrupted: &AtomicBool) -> Option<F::Output> {
    let watch = async {
        while !interrupted.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    tokio::select! {
        out = fut => Some(out),
        _ = watch => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_help() {
    println!();
    println!("{}", "Manual control".bold().underline());
    for action in Action::ALL {
        println!("  {}  – {}", action.id().to_string().bold().cyan(), action.label());
    }
    println!("  {}  – verify the current subtask", "c".bold().cyan());
    println!("  {}  – check whether the whole task is done", "t".bold().cyan());
    println!("  {}  – force-stop this episode", "q".bold().cyan());
    println!("  {}  – force-stop and quit", "exit".bold().cyan());
    println!();
}

fn print_subtask(subtask: &Subtask) {
    println!();
    println!("{}", "═".repeat(72).dimmed());
    let origin = if subtask.is_fallback() { " (fallback)".yellow().to_string() } else { String::new() };
    println!("{} #{}{}", "Subtask".bold(), subtask.sequence, origin);
    println!("  {}", subtask.description.bold());
    println!("  {} {}", "hints:".dimmed(), subtask.planning_hints);
    println!("  {} {}", "done when:".dimmed(), subtask.completion_criteria);
    println!("{}", "═".repeat(72).dimmed());
}

fn print_status(controller: &EpisodeController<'_>) {
    let m = controller.metrics();
    println!(
        "  step {}  distance {:.2}m  path {:.2}m",
        controller.steps().len(),
        m.distance_to_goal,
        m.path_length
    );
    if let Some(advice) = controller.advice() {
        println!("  {} {}", "advice:".dimmed(), advice.italic());
    }
}

fn print_step(report: &StepReport) {
    if let Some(record) = &report.record {
        println!("  → {}", record.action.label().green());
    }
    if let Some(v) = &report.verification {
        print_verification(v);
    }
}

fn print_verification(v: &Verification) {
    let verdict = if v.completed { "completed".green() } else { "not completed".yellow() };
    let tag = if v.fallback { " (fallback)".yellow().to_string() } else { String::new() };
    println!("  {} {}{}", "verification:".bold(), verdict, tag);
    if let Some(analysis) = &v.analysis {
        println!("  {}", analysis.dimmed());
    }
    if v.is_finished() {
        println!("  {}", "planner judged the task finished".bold().green());
    }
}

fn print_task_check(check: &TaskCheck) {
    let verdict = if check.done { "done".green() } else { "not done".yellow() };
    println!(
        "  {} {} (confidence {:.2})",
        "task check:".bold(),
        verdict,
        check.confidence
    );
    println!("  {}", check.analysis.dimmed());
    if let Some(r) = &check.recommendation {
        println!("  {} {}", "recommendation:".dimmed(), r);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subnav_hal::KinematicSim;
    use subnav_runtime::{ScriptedReasoner, SubtaskPlanner};
    use subnav_types::{Episode, Pose, Position, TerminationReason};

    const PLAN: &str = r#"{"subtask_description": "Walk to the door", "planning_hints": "Ahead", "completion_criteria": "Door close"}"#;

    fn episode() -> Episode {
        Episode {
            episode_id: "m1".into(),
            scene_id: "scene-a".into(),
            instruction: "Walk to the door".into(),
            start: Pose::default(),
            goal: Position::new(1.0, 0.0, 0.0),
            shortest_path_length: 1.0,
        }
    }

    fn planner() -> SubtaskPlanner {
        SubtaskPlanner::new(Arc::new(ScriptedReasoner::new().reply(PLAN)))
            .with_timeout(Duration::from_millis(200))
    }

    #[test]
    fn digits_map_to_actions() {
        assert!(matches!(parse("0"), Some(Command::Act(Action::Stop))));
        assert!(matches!(parse("1"), Some(Command::Act(Action::MoveForward))));
        assert!(matches!(parse("3"), Some(Command::Act(Action::TurnRight))));
        assert!(parse("4").is_none());
    }

    #[test]
    fn letters_map_to_commands() {
        assert!(matches!(parse("c"), Some(Command::Verify)));
        assert!(matches!(parse("t"), Some(Command::TaskCheck)));
        assert!(matches!(parse("q"), Some(Command::ForceStop)));
        assert!(matches!(parse("exit"), Some(Command::Exit)));
        assert!(parse("x").is_none());
    }

    #[tokio::test]
    async fn interruptible_returns_none_when_flag_set() {
        let flag = AtomicBool::new(true);
        let out = interruptible(tokio::time::sleep(Duration::from_secs(5)), &flag).await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn interruptible_passes_through_output() {
        let flag = AtomicBool::new(false);
        assert_eq!(interruptible(async { 7 }, &flag).await, Some(7));
    }

    #[tokio::test]
    async fn typed_actions_drive_the_episode() {
        let mut sim = KinematicSim::new(vec![episode()]);
        let mut controller = EpisodeController::builder(episode(), &mut sim, planner())
            .start()
            .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        for line in ["1", "bogus", "0"] {
            tx.send(Ok(line.to_string())).unwrap();
        }

        let exit = run(&mut controller, &mut rx, Arc::new(AtomicBool::new(false))).await;
        assert_eq!(exit, ReplExit::EpisodeOver);
        assert_eq!(controller.steps().len(), 2);
        assert_eq!(controller.termination(), Some(&TerminationReason::Stopped));
    }

    #[tokio::test]
    async fn end_of_input_quits_the_session() {
        let mut sim = KinematicSim::new(vec![episode()]);
        let mut controller = EpisodeController::builder(episode(), &mut sim, planner())
            .start()
            .await;
        let (tx, mut rx) = mpsc::unbounded_channel::<io::Result<String>>();
        drop(tx);

        let exit = run(&mut controller, &mut rx, Arc::new(AtomicBool::new(false))).await;
        assert_eq!(exit, ReplExit::Quit);
        assert!(controller.is_terminated());
    }

    #[tokio::test]
    async fn ctrl_c_stops_an_episode_waiting_for_input() {
        let mut sim = KinematicSim::new(vec![episode()]);
        let mut controller = EpisodeController::builder(episode(), &mut sim, planner())
            .start()
            .await;
        let (_tx, mut rx) = mpsc::unbounded_channel::<io::Result<String>>();
        let interrupted = Arc::new(AtomicBool::new(false));

        let flag = interrupted.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            flag.store(true, Ordering::SeqCst);
        });
        let exit = tokio::time::timeout(Duration::from_secs(2), run(&mut controller, &mut rx, interrupted))
            .await
            .expect("prompt wait was not interrupted");
        assert_eq!(exit, ReplExit::EpisodeOver);
        assert_eq!(controller.termination(), Some(&TerminationReason::ForceStopped));
    }
}
