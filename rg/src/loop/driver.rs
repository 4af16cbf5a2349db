//! Bounded sequential loop over iterations.
//!
//! Iteration numbers continue monotonically from the recorded history, so
//! logs and receipts never collide across separate invocations.

use std::path::Path;
use std::time::Duration;

use eyre::Result;
use prdtrack::make_tracker;
use tracing::{info, warn};

use crate::config::Config;
use crate::git;
use crate::state::StateStore;

use super::engine::{IterationOptions, IterationResult, run_iteration};

/// Apply the configured branch strategy before looping. Best-effort: a
/// failed checkout leaves HEAD alone.
async fn prepare_branch(project_root: &Path, config: &Config) {
    if config.git.branch_strategy != "per_prd" {
        return;
    }
    let declared = make_tracker(&config.tracker_options(project_root))
        .ok()
        .and_then(|t| t.branch_name());
    let branch = declared.unwrap_or_else(|| {
        let stem = Path::new(&config.files.prd)
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "prd".to_string());
        format!("{}{}", config.git.branch_prefix, stem)
    });
    git::checkout_branch(project_root, &branch, &config.git.base_branch).await;
}

/// Run up to `max_iterations` (default from config) sequential iterations,
/// stopping early on the no-progress circuit breaker or on completion
/// (tracker reports all done AND the agent signalled exit).
pub async fn run_loop(
    project_root: &Path,
    agent: &str,
    config: &Config,
    max_iterations: Option<u32>,
) -> Result<Vec<IterationResult>> {
    git::ensure_git_repo(project_root).await?;
    let settings = config.loop_.effective();

    let store = StateStore::for_root(project_root);
    let mut state = store.load();
    state.no_progress_streak = 0;
    store.save(&state)?;

    prepare_branch(project_root, config).await;

    let limit = max_iterations.unwrap_or(settings.max_iterations);
    let start_iter = store.next_iteration_number();
    let mut results: Vec<IterationResult> = Vec::new();

    for offset in 0..limit as u64 {
        let iteration = start_iter + offset;
        let result =
            run_iteration(project_root, agent, config, iteration, IterationOptions::default())
                .await?;
        let streak = result.no_progress_streak;
        let exit_signal = result.exit_signal;
        results.push(result);

        if streak >= settings.no_progress_limit {
            warn!(streak, "no-progress circuit breaker tripped");
            break;
        }

        let done = make_tracker(&config.tracker_options(project_root))
            .map(|t| t.all_done())
            .unwrap_or(false);
        // Dual gate: only exit when the backlog is done AND the agent
        // explicitly signalled completion.
        if done && exit_signal == Some(true) {
            info!(iteration, "backlog complete");
            break;
        }

        if settings.sleep_seconds_between_iters > 0 {
            tokio::time::sleep(Duration::from_secs(settings.sleep_seconds_between_iters)).await;
        }
    }

    Ok(results)
}
