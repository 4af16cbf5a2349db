//! Ralph Gold - iteration engine for driving an external AI coding agent
//! through a bounded task loop.
//!
//! The agent is a black-box CLI subprocess. Each iteration selects one task
//! from a pluggable tracker, builds a short prompt pointing at durable
//! on-disk memory under `.ralph/`, invokes the agent under timeout control,
//! verifies the outcome with shell gates (and optionally an LLM judge),
//! records state atomically, and decides whether to continue, retry, block,
//! or stop.
//!
//! # Core Concepts
//!
//! - **The filesystem is the memory**: prompts stay short and point at
//!   `.ralph/` files the agent reads itself
//! - **Concrete verification**: exit codes and git state decide success,
//!   never the agent's own claims
//! - **Contained failures**: a crashed agent or failed gate is a recorded
//!   result, not an exception
//!
//! # Modules
//!
//! - [`r#loop`] - the iteration engine and the bounded sequential driver
//! - [`supervisor`] - long-running outer loop with heartbeat and policies
//! - [`parallel`] - worker pool over isolated git worktrees
//! - [`config`] - layered TOML configuration
//! - [`state`] - durable state, receipts, atomic writes

pub mod adaptive;
pub mod agents;
pub mod cli;
pub mod config;
pub mod error;
pub mod gates;
pub mod git;
pub mod notify;
pub mod output;
pub mod parallel;
pub mod process;
pub mod prompt;
pub mod snapshots;
pub mod state;
pub mod supervisor;
pub mod unblock;
pub mod watch;
pub mod worktree;

// Note: 'loop' is a reserved keyword, so we use r#loop
#[path = "loop/mod.rs"]
pub mod r#loop;

// Re-export commonly used types
pub use adaptive::{ComplexityLevel, TaskComplexity, calculate_adaptive_timeout, estimate_task_complexity};
pub use agents::{AgentKind, Invocation, build_invocation};
pub use config::{Config, LoopSettings, RunnerConfig, load_config};
pub use error::EngineError;
pub use gates::{GateResult, run_gates};
pub use notify::Notifier;
pub use parallel::{ParallelExecutor, WorkerState, WorkerStatus};
pub use r#loop::{IterationOptions, IterationResult, run_iteration, run_loop};
pub use snapshots::{create_snapshot, list_snapshots, rollback_snapshot};
pub use state::{PersistentState, StateStore};
pub use supervisor::{SuperviseResult, run_supervisor};
pub use unblock::{BlockReason, BlockedTaskManager};
pub use worktree::{WorktreeError, WorktreeManager};
