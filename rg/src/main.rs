//! ralph - CLI entry point. Thin dispatch into the engine and its drivers.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use serde_json::json;
use tracing::info;

use ralph_gold::cli::{Cli, Command, SnapshotCommand};
use ralph_gold::config::{Config, load_config};
use ralph_gold::output::{Level, OutputConfig, print_json_output, print_output, set_output_config};
use ralph_gold::r#loop::{IterationOptions, IterationResult, run_iteration, run_loop};
use ralph_gold::state::StateStore;
use ralph_gold::unblock::BlockedTaskManager;
use ralph_gold::{ParallelExecutor, WorkerStatus, snapshots, supervisor, watch};

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn output_config_for(cli: &Cli, config: &Config) -> OutputConfig {
    let verbosity = if cli.quiet {
        "quiet".to_string()
    } else if cli.verbose {
        "verbose".to_string()
    } else {
        config.output.verbosity.clone()
    };
    let format = if cli.json {
        "json".to_string()
    } else {
        config.output.format.clone()
    };
    OutputConfig { verbosity, format }
}

fn iteration_line(result: &IterationResult) -> String {
    let status = if result.return_code == 0 && result.gates_ok != Some(false) {
        "ok".green().to_string()
    } else {
        "fail".red().to_string()
    };
    format!(
        "iter {:>4} [{status}] task={} rc={} exit={:?} gates={:?} no_prog={}",
        result.iteration,
        result.story_id.as_deref().unwrap_or("-"),
        result.return_code,
        result.exit_signal,
        result.gates_ok,
        result.no_progress_streak,
    )
}

fn iteration_json(result: &IterationResult) -> serde_json::Value {
    json!({
        "iteration": result.iteration,
        "agent": result.agent,
        "story_id": result.story_id,
        "return_code": result.return_code,
        "exit_signal": result.exit_signal,
        "gates_ok": result.gates_ok,
        "judge_ok": result.judge_ok,
        "review_ok": result.review_ok,
        "repo_clean": result.repo_clean,
        "progress_made": result.progress_made,
        "no_progress_streak": result.no_progress_streak,
        "timed_out": result.timed_out,
        "log_path": result.log_path.as_ref().map(|p| p.display().to_string()),
    })
}

async fn dispatch(cli: Cli, root: PathBuf, config: Config) -> Result<i32> {
    match cli.command {
        Command::Step { agent, task, dry_run } => {
            let task_override = match task {
                Some(id) => {
                    let tracker = prdtrack::make_tracker(&config.tracker_options(&root))
                        .map_err(|e| eyre::eyre!("{e}"))?;
                    Some(
                        tracker
                            .get_task_by_id(&id)
                            .unwrap_or_else(|| prdtrack::SelectedTask::new(id.clone(), id, prdtrack::PrdKind::Json)),
                    )
                }
                None => None,
            };
            let iteration = StateStore::for_root(&root).next_iteration_number();
            let result = run_iteration(
                &root,
                &agent,
                &config,
                iteration,
                IterationOptions { task_override, dry_run },
            )
            .await?;
            print_output(&iteration_line(&result), Level::Quiet);
            print_json_output(&iteration_json(&result));
            Ok(0)
        }

        Command::Run { agent, max_iterations } => {
            let results = run_loop(&root, &agent, &config, max_iterations).await?;
            for result in &results {
                print_output(&iteration_line(result), Level::Quiet);
            }
            print_json_output(&json!({
                "cmd": "run",
                "iterations": results.iter().map(iteration_json).collect::<Vec<_>>(),
            }));

            let done = prdtrack::make_tracker(&config.tracker_options(&root))
                .map(|t| t.all_done())
                .unwrap_or(false);
            let signalled = results.last().and_then(|r| r.exit_signal) == Some(true);
            Ok(if done && signalled { 0 } else { 1 })
        }

        Command::Supervise { agent } => {
            let result = supervisor::run_supervisor(&root, &agent, &config).await;
            print_output(
                &format!("supervise: {} ({} iterations)", result.reason, result.iterations_run),
                Level::Quiet,
            );
            print_json_output(&result.to_json());
            Ok(result.exit_code)
        }

        Command::Parallel { agent, max_tasks } => {
            let tracker = prdtrack::make_tracker(&config.tracker_options(&root))
                .map_err(|e| eyre::eyre!("{e}"))?;
            let executor = ParallelExecutor::new(&root, &config, max_tasks);
            let results = executor.run_parallel(&agent, tracker.as_ref()).await;

            if results.is_empty() {
                // No parallel groups: run the sequential loop instead.
                info!("no parallel groups; using the sequential loop");
                let results = run_loop(&root, &agent, &config, None).await?;
                for result in &results {
                    print_output(&iteration_line(result), Level::Quiet);
                }
                let done = tracker.all_done();
                let signalled = results.last().and_then(|r| r.exit_signal) == Some(true);
                return Ok(if done && signalled { 0 } else { 1 });
            }

            let workers = executor.workers();
            for worker in &workers {
                let status = match worker.status {
                    WorkerStatus::Success => "success".green().to_string(),
                    WorkerStatus::Failed => "failed".red().to_string(),
                    _ => format!("{:?}", worker.status).to_lowercase(),
                };
                print_output(
                    &format!(
                        "worker {} [{status}] task={} branch={}",
                        worker.worker_id, worker.task.id, worker.branch_name
                    ),
                    Level::Quiet,
                );
            }
            if config.parallel.merge_policy == "manual" || config.parallel.merge_policy == "auto_merge" {
                print_output(
                    "Merge worker branches manually (parallel.merge_policy = manual).",
                    Level::Normal,
                );
            }
            print_json_output(&json!({
                "cmd": "parallel",
                "results": results.iter().map(iteration_json).collect::<Vec<_>>(),
            }));

            let all_ok = workers.iter().all(|w| w.status == WorkerStatus::Success);
            Ok(if all_ok { 0 } else { 1 })
        }

        Command::Watch { auto_commit } => {
            watch::run_watch_mode(&root, &config, auto_commit, None).await?;
            Ok(0)
        }

        Command::Snapshot { command } => match command {
            SnapshotCommand::Create { name, description } => {
                let snapshot = snapshots::create_snapshot(&root, &name, &description).await?;
                print_output(
                    &format!("Created snapshot '{}' at {}", snapshot.name, snapshot.git_stash_ref),
                    Level::Quiet,
                );
                Ok(0)
            }
            SnapshotCommand::List => {
                let listed = snapshots::list_snapshots(&root);
                if listed.is_empty() {
                    print_output("No snapshots.", Level::Quiet);
                }
                for snapshot in &listed {
                    print_output(
                        &format!(
                            "{}  {}  {}  {}",
                            snapshot.name.cyan(),
                            snapshot.timestamp,
                            snapshot.git_stash_ref,
                            snapshot.description
                        ),
                        Level::Quiet,
                    );
                }
                print_json_output(&json!({ "cmd": "snapshot_list", "snapshots": listed }));
                Ok(0)
            }
            SnapshotCommand::Rollback { name, force } => {
                snapshots::rollback_snapshot(&root, &name, force).await?;
                print_output(&format!("Rolled back to snapshot '{name}'"), Level::Quiet);
                Ok(0)
            }
            SnapshotCommand::Cleanup { keep } => {
                let removed = snapshots::cleanup_old_snapshots(&root, keep).await?;
                print_output(&format!("Removed {removed} snapshot(s)"), Level::Quiet);
                Ok(0)
            }
        },

        Command::Unblock { task_id, all, reason, timeout } => {
            let manager = BlockedTaskManager::new(&root, &config);
            if all {
                let results = manager.unblock_all(None, &reason)?;
                for result in &results {
                    print_output(&result.message, Level::Quiet);
                }
                Ok(0)
            } else if let Some(id) = task_id {
                let result = manager.unblock_task(&id, &reason, timeout)?;
                print_output(&result.message, Level::Quiet);
                Ok(if result.success { 0 } else { 1 })
            } else {
                let blocked = manager.list_blocked_tasks();
                if blocked.is_empty() {
                    print_output("No blocked tasks.", Level::Quiet);
                }
                for info in &blocked {
                    print_output(
                        &format!(
                            "{}  [{}] attempts={} suggested_timeout={}s  {}",
                            info.task_id.cyan(),
                            info.reason.as_str(),
                            info.attempts,
                            info.suggested_timeout,
                            info.title
                        ),
                        Level::Quiet,
                    );
                }
                print_json_output(&json!({ "cmd": "unblock_list", "blocked": blocked }));
                Ok(0)
            }
        }

        Command::Status => {
            let (done, total) = prdtrack::make_tracker(&config.tracker_options(&root))
                .map(|t| t.counts())
                .unwrap_or((0, 0));
            let state = StateStore::for_root(&root).load();
            print_output(&format!("tasks: {done}/{total} done"), Level::Quiet);
            match state.history.back() {
                Some(last) => print_output(
                    &format!(
                        "last: iter={} task={} rc={} gates={:?} exit={:?}",
                        last.iteration,
                        last.story_id.as_deref().unwrap_or("-"),
                        last.return_code,
                        last.gates_ok,
                        last.exit_signal_effective,
                    ),
                    Level::Quiet,
                ),
                None => print_output("last: (no iterations yet)", Level::Quiet),
            }
            print_json_output(&json!({
                "cmd": "status",
                "done": done,
                "total": total,
                "blocked": state.blocked_tasks.len(),
                "no_progress_streak": state.no_progress_streak,
            }));
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    setup_logging();
    let cli = Cli::parse();

    let root = match cli.root.clone() {
        Some(root) => root,
        None => match std::env::current_dir().context("Failed to resolve working directory") {
            Ok(cwd) => cwd,
            Err(e) => {
                eprintln!("{e:#}");
                return ExitCode::from(2);
            }
        },
    };

    let config = match load_config(&root) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::from(2);
        }
    };
    set_output_config(output_config_for(&cli, &config));

    match dispatch(cli, root, config).await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("{}", format!("{e:#}").red());
            ExitCode::from(2)
        }
    }
}
