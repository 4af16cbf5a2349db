//! CLI command definitions. The surface stays thin: every subcommand is a
//! direct call into the engine or one of its drivers.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Ralph Gold - drive an AI coding agent through a bounded task loop
#[derive(Parser)]
#[command(
    name = "ralph",
    about = "Iteration engine that drives an AI coding agent through a task backlog",
    version
)]
pub struct Cli {
    /// Project root (defaults to the current directory)
    #[arg(short = 'C', long, global = true)]
    pub root: Option<PathBuf>,

    /// Quiet output (overrides output.verbosity)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (overrides output.verbosity)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit a JSON summary instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a single iteration
    Step {
        /// Agent runner to use (codex, claude, copilot, ...)
        #[arg(default_value = "codex")]
        agent: String,

        /// Work on a specific task id instead of selecting one
        #[arg(short, long)]
        task: Option<String>,

        /// Build the prompt but do not invoke the agent
        #[arg(long)]
        dry_run: bool,
    },

    /// Run the bounded loop until done or a circuit breaker fires
    Run {
        #[arg(default_value = "codex")]
        agent: String,

        /// Maximum iterations for this run (defaults to loop.max_iterations)
        #[arg(short, long)]
        max_iterations: Option<u32>,
    },

    /// Long-running supervisor with heartbeat and notifications
    Supervise {
        #[arg(default_value = "codex")]
        agent: String,
    },

    /// Execute tracker groups in parallel over git worktrees
    Parallel {
        #[arg(default_value = "codex")]
        agent: String,

        /// Cap the number of tasks executed
        #[arg(long)]
        max_tasks: Option<usize>,
    },

    /// Watch files and run gates on change
    Watch {
        /// Stage and commit when gates pass
        #[arg(long)]
        auto_commit: bool,
    },

    /// Manage git-stash based savepoints
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },

    /// List or unblock blocked tasks
    Unblock {
        /// Task id to unblock (omit with --all or to just list)
        task_id: Option<String>,

        /// Unblock every blocked task
        #[arg(long)]
        all: bool,

        /// Reason recorded in the audit trail
        #[arg(short, long, default_value = "manual unblock")]
        reason: String,

        /// Timeout hint for the retry, in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show backlog counts and the last iteration
    Status,
}

#[derive(Subcommand)]
pub enum SnapshotCommand {
    /// Create a named savepoint
    Create {
        name: String,

        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// List savepoints
    List,

    /// Restore the working tree and state from a savepoint
    Rollback {
        name: String,

        /// Allow rollback over a dirty working tree
        #[arg(long)]
        force: bool,
    },

    /// Drop all but the most recent N savepoints
    Cleanup {
        #[arg(short, long, default_value = "10")]
        keep: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_step_defaults() {
        let cli = Cli::parse_from(["ralph", "step"]);
        match cli.command {
            Command::Step { agent, task, dry_run } => {
                assert_eq!(agent, "codex");
                assert!(task.is_none());
                assert!(!dry_run);
            }
            _ => panic!("expected step"),
        }
    }

    #[test]
    fn test_parse_run_with_agent_and_limit() {
        let cli = Cli::parse_from(["ralph", "run", "claude", "-m", "5"]);
        match cli.command {
            Command::Run { agent, max_iterations } => {
                assert_eq!(agent, "claude");
                assert_eq!(max_iterations, Some(5));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_snapshot_subcommands() {
        let cli = Cli::parse_from(["ralph", "snapshot", "create", "before-refactor", "-d", "desc"]);
        match cli.command {
            Command::Snapshot {
                command: SnapshotCommand::Create { name, description },
            } => {
                assert_eq!(name, "before-refactor");
                assert_eq!(description, "desc");
            }
            _ => panic!("expected snapshot create"),
        }

        let cli = Cli::parse_from(["ralph", "snapshot", "rollback", "S", "--force"]);
        assert!(matches!(
            cli.command,
            Command::Snapshot {
                command: SnapshotCommand::Rollback { force: true, .. }
            }
        ));
    }

    #[test]
    fn test_parse_unblock_variants() {
        let cli = Cli::parse_from(["ralph", "unblock", "task-7", "--timeout", "1800"]);
        match cli.command {
            Command::Unblock { task_id, all, timeout, .. } => {
                assert_eq!(task_id.as_deref(), Some("task-7"));
                assert!(!all);
                assert_eq!(timeout, Some(1800));
            }
            _ => panic!("expected unblock"),
        }

        let cli = Cli::parse_from(["ralph", "unblock", "--all"]);
        assert!(matches!(cli.command, Command::Unblock { all: true, .. }));
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["ralph", "--json", "-C", "/tmp/proj", "status"]);
        assert!(cli.json);
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/proj")));
    }
}
