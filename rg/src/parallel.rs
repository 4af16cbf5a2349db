//! Parallel executor: a bounded worker pool over tracker-provided groups,
//! each worker isolated in its own git worktree.
//!
//! Workers share nothing but git; their state writes land in the worktree's
//! own `.ralph/`. Results are collected as workers complete, and one
//! worker's failure never kills its siblings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use futures::StreamExt;
use prdtrack::{SelectedTask, Tracker};
use tracing::{info, warn};

use crate::config::Config;
use crate::r#loop::{IterationOptions, IterationResult, run_iteration};
use crate::state::epoch_now;
use crate::worktree::WorktreeManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Queued,
    Running,
    Success,
    Failed,
}

/// Lifecycle record for one parallel worker.
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub worker_id: usize,
    pub task: SelectedTask,
    pub worktree_path: PathBuf,
    pub branch_name: String,
    pub status: WorkerStatus,
    pub started_at: Option<f64>,
    pub completed_at: Option<f64>,
    pub error: Option<String>,
}

/// Executes tasks concurrently in isolated worktrees.
pub struct ParallelExecutor {
    project_root: PathBuf,
    config: Config,
    max_tasks: Option<usize>,
    worktree_mgr: WorktreeManager,
    workers: Mutex<HashMap<usize, WorkerState>>,
}

impl ParallelExecutor {
    pub fn new(project_root: &Path, config: &Config, max_tasks: Option<usize>) -> Self {
        let mut config = config.clone();
        if config.parallel.merge_policy == "auto_merge" {
            warn!(
                "parallel.merge_policy=auto_merge is not yet implemented; continuing with manual merge"
            );
            config.parallel.merge_policy = "manual".to_string();
        }
        let worktree_root = project_root.join(&config.parallel.worktree_root);
        Self {
            project_root: project_root.to_path_buf(),
            config,
            max_tasks,
            worktree_mgr: WorktreeManager::new(project_root.to_path_buf(), worktree_root),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of worker states, ordered by worker id.
    pub fn workers(&self) -> Vec<WorkerState> {
        let map = self.workers.lock().expect("worker map lock poisoned");
        let mut states: Vec<WorkerState> = map.values().cloned().collect();
        states.sort_by_key(|w| w.worker_id);
        states
    }

    fn record_worker(&self, state: WorkerState) {
        self.workers
            .lock()
            .expect("worker map lock poisoned")
            .insert(state.worker_id, state);
    }

    fn update_worker(&self, worker_id: usize, f: impl FnOnce(&mut WorkerState)) {
        let mut map = self.workers.lock().expect("worker map lock poisoned");
        if let Some(state) = map.get_mut(&worker_id) {
            f(state);
        }
    }

    /// Flatten groups into a deterministic task order. `queue` concatenates
    /// groups by sorted name; `group` is the same ordering in v1
    /// (groups-sequential scheduling is deferred).
    fn flatten_groups(
        groups: std::collections::BTreeMap<String, Vec<SelectedTask>>,
    ) -> Vec<SelectedTask> {
        groups.into_values().flatten().collect()
    }

    fn failure_result(&self, worker_id: usize, task: &SelectedTask, agent: &str) -> IterationResult {
        IterationResult {
            iteration: worker_id as u64 + 1,
            agent: agent.to_string(),
            story_id: Some(task.id.clone()),
            task_title: Some(task.title.clone()),
            exit_signal: Some(false),
            exit_signal_raw: None,
            return_code: 1,
            log_path: None,
            progress_made: false,
            no_progress_streak: 0,
            gates_ok: Some(false),
            repo_clean: false,
            judge_ok: None,
            review_ok: None,
            timed_out: false,
        }
    }

    async fn run_worker(&self, worker_id: usize, task: SelectedTask, agent: &str) -> IterationResult {
        let (worktree_path, branch_name) =
            match self.worktree_mgr.create_worktree(&task, worker_id).await {
                Ok(created) => created,
                Err(e) => {
                    warn!(worker_id, task = %task.id, error = %e, "worktree creation failed");
                    self.record_worker(WorkerState {
                        worker_id,
                        task: task.clone(),
                        worktree_path: PathBuf::new(),
                        branch_name: String::new(),
                        status: WorkerStatus::Failed,
                        started_at: Some(epoch_now()),
                        completed_at: Some(epoch_now()),
                        error: Some(e.to_string()),
                    });
                    return self.failure_result(worker_id, &task, agent);
                }
            };

        self.record_worker(WorkerState {
            worker_id,
            task: task.clone(),
            worktree_path: worktree_path.clone(),
            branch_name,
            status: WorkerStatus::Running,
            started_at: Some(epoch_now()),
            completed_at: None,
            error: None,
        });

        let outcome = run_iteration(
            &worktree_path,
            agent,
            &self.config,
            worker_id as u64 + 1,
            IterationOptions {
                task_override: Some(task.clone()),
                dry_run: false,
            },
        )
        .await;

        match outcome {
            Ok(result) => {
                let succeeded =
                    result.return_code == 0 && result.gates_ok != Some(false) && !result.timed_out;
                self.update_worker(worker_id, |w| {
                    w.status = if succeeded { WorkerStatus::Success } else { WorkerStatus::Failed };
                    w.completed_at = Some(epoch_now());
                });
                result
            }
            Err(e) => {
                warn!(worker_id, task = %task.id, error = %e, "worker failed");
                self.update_worker(worker_id, |w| {
                    w.status = WorkerStatus::Failed;
                    w.completed_at = Some(epoch_now());
                    w.error = Some(e.to_string());
                });
                self.failure_result(worker_id, &task, agent)
            }
        }
    }

    /// Execute tasks from the tracker's parallel groups. An empty group map
    /// means the tracker cannot schedule in parallel: an empty result is
    /// returned so the caller falls back to the sequential loop.
    pub async fn run_parallel(&self, agent: &str, tracker: &dyn Tracker) -> Vec<IterationResult> {
        let groups = tracker.get_parallel_groups();
        if groups.is_empty() {
            warn!(
                kind = %tracker.kind(),
                "tracker does not support parallel execution; falling back to sequential mode"
            );
            return Vec::new();
        }

        let mut tasks = Self::flatten_groups(groups);
        if let Some(cap) = self.max_tasks {
            tasks.truncate(cap);
        }
        if tasks.is_empty() {
            return Vec::new();
        }
        info!(
            tasks = tasks.len(),
            max_workers = self.config.parallel.max_workers,
            strategy = %self.config.parallel.strategy,
            "starting parallel execution"
        );

        // Bounded pool: at most max_workers in flight, results collected as
        // workers complete.
        let max_workers = self.config.parallel.max_workers as usize;
        futures::stream::iter(
            tasks
                .into_iter()
                .enumerate()
                .map(|(worker_id, task)| self.run_worker(worker_id, task, agent)),
        )
        .buffer_unordered(max_workers)
        .collect()
        .await
    }
}
