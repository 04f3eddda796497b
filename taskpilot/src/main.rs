//! Spec-driven task automation.
//!
//! Reads markdown checklists under `.kiro/specs/<name>/tasks.md`, dispatches
//! their tasks in dependency order to an assistant command, and checks them
//! off as they complete.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use taskpilot::core::dependency::validate_plan;
use taskpilot::core::queue::execution_queue;
use taskpilot::core::state::SessionOutcome;
use taskpilot::engine::{AutomationEngine, EngineContext, EngineEvent};
use taskpilot::exit_codes;
use taskpilot::io::Layout;
use taskpilot::io::config::{EngineConfig, load_config, write_config};
use taskpilot::io::session_store::clear_retries;
use taskpilot::io::task_store::TaskStore;
use taskpilot::plan::{Spec, TaskKey};

#[derive(Parser)]
#[command(name = "taskpilot", version, about = "Spec-driven task automation engine")]
struct Cli {
    /// Workspace root containing `.taskpilot/` and the specs directory.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `.taskpilot/config.toml` with defaults if missing.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Parse every spec and check dependencies for cycles and unknown ids.
    Validate,
    /// Print the execution queue in dispatch order.
    Order,
    /// Run tasks until the queue is exhausted or a task fails. Ctrl-C stops.
    Run,
    /// Put a task back to pending.
    Reset {
        /// Task as `<spec>:<id>`, e.g. `auth:2.1`.
        task: TaskKey,
    },
}

#[tokio::main]
async fn main() {
    taskpilot::logging::init();
    let code = match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let Cli { root, command } = cli;
    match command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Validate => cmd_validate(&root),
        Command::Order => cmd_order(&root),
        Command::Run => cmd_run(&root).await,
        Command::Reset { task } => cmd_reset(&root, &task),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let path = Layout::new(root).config_path();
    if path.exists() && !force {
        println!("{} already exists", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(&path, &EngineConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(root: &Path) -> Result<i32> {
    let (_, specs) = load_plan(root)?;
    let problems = validate_plan(&specs);
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("- {problem}");
        }
        return Ok(exit_codes::INVALID);
    }
    let units: usize = specs.iter().map(|spec| spec.items().filter(|item| item.is_unit()).count()).sum();
    println!("ok: {} specs, {units} tasks", specs.len());
    Ok(exit_codes::OK)
}

fn cmd_order(root: &Path) -> Result<i32> {
    let (config, specs) = load_plan(root)?;
    let queue = execution_queue(&specs, &config.queue_policy())
        .map_err(|(spec, err)| anyhow!("{spec}: {err}"))?;
    for entry in queue {
        let optional = if entry.optional { " (optional)" } else { "" };
        println!("{}\t{}{optional}", entry.key, entry.title);
    }
    Ok(exit_codes::OK)
}

async fn cmd_run(root: &Path) -> Result<i32> {
    let engine = AutomationEngine::new(EngineContext::for_workspace(root)?)?;
    let mut events = engine.subscribe();
    engine.start()?;

    let mut stopping = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event)?;
                    if matches!(event, EngineEvent::SessionCompleted { .. } | EngineEvent::SessionStopped { .. }) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event output fell behind"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                info!("interrupt received; stopping");
                if let Err(err) = engine.stop() {
                    warn!(error = %err, "stop refused");
                }
            }
        }
    }

    Ok(match engine.wait().await {
        Some(SessionOutcome::Completed) => exit_codes::OK,
        Some(SessionOutcome::Halted) => exit_codes::HALTED,
        Some(SessionOutcome::Stopped) => exit_codes::STOPPED,
        None => exit_codes::INVALID,
    })
}

fn cmd_reset(root: &Path, task: &TaskKey) -> Result<i32> {
    let layout = Layout::new(root);
    let config = load_config(&layout.config_path())?;
    let mut store = TaskStore::new(layout.specs_dir(&config.specs_dir));
    store.discover()?;
    store.reset(task)?;
    if clear_retries(&layout.session_path(), task)? {
        info!(%task, "retry history cleared");
    }
    println!("reset {task}");
    Ok(exit_codes::OK)
}

fn load_plan(root: &Path) -> Result<(EngineConfig, Vec<Spec>)> {
    let layout = Layout::new(root);
    let config = load_config(&layout.config_path())?;
    let mut store = TaskStore::new(layout.specs_dir(&config.specs_dir));
    let specs = store.discover().context("discover specs")?.to_vec();
    Ok((config, specs))
}

/// One JSON object per line on stdout.
fn print_event(event: &EngineEvent) -> Result<()> {
    println!("{}", serde_json::to_string(event).context("serialize event")?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_root() {
        let cli = Cli::parse_from(["taskpilot", "--root", "/work", "run"]);
        assert!(matches!(cli.command, Command::Run));
        assert_eq!(cli.root, PathBuf::from("/work"));
    }

    #[test]
    fn parse_reset_task_key() {
        let cli = Cli::parse_from(["taskpilot", "reset", "auth:2.1"]);
        let Command::Reset { task } = cli.command else {
            panic!("expected reset");
        };
        assert_eq!(task, TaskKey::new("auth", "2.1"));
    }

    #[test]
    fn reset_rejects_malformed_key() {
        assert!(Cli::try_parse_from(["taskpilot", "reset", "auth"]).is_err());
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["taskpilot", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn validate_reports_cycles_as_invalid() {
        let temp = tempfile::tempdir().expect("tempdir");
        taskpilot::test_support::write_spec(
            temp.path(),
            "demo",
            "- [ ] 1. One\n  - _Depends on: 2_\n- [ ] 2. Two\n  - _Depends on: 1_\n",
        );
        assert_eq!(cmd_validate(temp.path()).expect("validate"), exit_codes::INVALID);
    }
}
