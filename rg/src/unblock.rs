//! Blocked-task management: list what is stuck, why, and put it back in
//! play.
//!
//! Unblocking mutates state (drop the block record, reset the attempt
//! count, append an audit event) and reopens the task in the tracker.

use std::path::{Path, PathBuf};

use eyre::Result;
use prdtrack::Tracker;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::adaptive::{calculate_adaptive_timeout, estimate_task_complexity};
use crate::config::Config;
use crate::state::{StateStore, UnblockEvent, utc_now_iso};

/// Why a task ended up blocked, classified from the recorded reason text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Timeout,
    NoFiles,
    GateFailure,
    AttemptLimit,
    Dependency,
    Manual,
}

impl BlockReason {
    pub fn classify(detail: &str) -> Self {
        let lower = detail.to_lowercase();
        if lower.contains("timeout") {
            Self::Timeout
        } else if lower.contains("no_files") || lower.contains("no files") {
            Self::NoFiles
        } else if lower.contains("gate") {
            Self::GateFailure
        } else if lower.contains("attempt") {
            Self::AttemptLimit
        } else if lower.contains("depend") {
            Self::Dependency
        } else {
            Self::Manual
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::NoFiles => "no_files",
            Self::GateFailure => "gate_failure",
            Self::AttemptLimit => "attempt_limit",
            Self::Dependency => "dependency",
            Self::Manual => "manual",
        }
    }
}

/// A blocked task joined with tracker metadata and attempt counts.
#[derive(Debug, Clone, Serialize)]
pub struct BlockedTaskInfo {
    pub task_id: String,
    pub title: String,
    pub blocked_at: String,
    pub attempts: u32,
    pub reason: BlockReason,
    pub reason_detail: String,
    pub suggested_timeout: u64,
    pub complexity_level: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnblockResult {
    pub success: bool,
    pub task_id: String,
    pub previous_attempts: u32,
    pub new_timeout: Option<u64>,
    pub message: String,
}

/// Manage blocked tasks for one project root.
pub struct BlockedTaskManager<'a> {
    project_root: PathBuf,
    config: &'a Config,
}

impl<'a> BlockedTaskManager<'a> {
    pub fn new(project_root: &Path, config: &'a Config) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            config,
        }
    }

    fn tracker(&self) -> Option<Box<dyn Tracker>> {
        prdtrack::make_tracker(&self.config.tracker_options(&self.project_root)).ok()
    }

    /// List blocked tasks from `state.blocked_tasks`, enriched with tracker
    /// titles, attempt counts, and a suggested retry timeout.
    pub fn list_blocked_tasks(&self) -> Vec<BlockedTaskInfo> {
        let store = StateStore::for_root(&self.project_root);
        let state = store.load();
        let tracker = self.tracker();
        let settings = self.config.loop_.effective();

        let mut blocked: Vec<BlockedTaskInfo> = Vec::new();
        for (task_id, record) in &state.blocked_tasks {
            let task = tracker
                .as_deref()
                .and_then(|t| t.get_task_by_id(task_id))
                .unwrap_or_else(|| {
                    prdtrack::SelectedTask::new(task_id.clone(), task_id.clone(), prdtrack::PrdKind::Json)
                });
            let attempts = state.attempts_for(task_id);
            let complexity = estimate_task_complexity(&task);
            let suggested_timeout = calculate_adaptive_timeout(
                &task,
                attempts,
                &self.config.adaptive_timeout,
                Some(settings.runner_timeout_seconds),
            );
            blocked.push(BlockedTaskInfo {
                task_id: task_id.clone(),
                title: task.title.clone(),
                blocked_at: record.blocked_at.clone(),
                attempts,
                reason: BlockReason::classify(&record.reason),
                reason_detail: record.reason.clone(),
                suggested_timeout,
                complexity_level: complexity.level.as_str().to_string(),
            });
        }
        blocked
    }

    /// Unblock one task: remove the block record, reset attempts, append an
    /// audit event, and force the task open in the tracker.
    pub fn unblock_task(
        &self,
        task_id: &str,
        reason: &str,
        new_timeout: Option<u64>,
    ) -> Result<UnblockResult> {
        let store = StateStore::for_root(&self.project_root);
        let mut state = store.load();

        let Some(_record) = state.blocked_tasks.remove(task_id) else {
            return Ok(UnblockResult {
                success: false,
                task_id: task_id.to_string(),
                previous_attempts: state.attempts_for(task_id),
                new_timeout: None,
                message: format!("Task '{task_id}' is not blocked"),
            });
        };

        let previous_attempts = state.attempts_for(task_id);
        state.task_attempts.remove(task_id);
        state.attempt_history.push(UnblockEvent {
            attempt_id: Uuid::now_v7().to_string(),
            task_id: task_id.to_string(),
            unblocked_at: utc_now_iso(),
            reason: reason.to_string(),
            new_timeout,
        });
        store.save(&state)?;

        let reopened = self
            .tracker()
            .map(|t| t.force_task_open(task_id))
            .unwrap_or(false);
        info!(task = task_id, reopened, "task unblocked");

        Ok(UnblockResult {
            success: true,
            task_id: task_id.to_string(),
            previous_attempts,
            new_timeout,
            message: format!(
                "Unblocked '{task_id}' after {previous_attempts} attempts{}",
                new_timeout
                    .map(|t| format!(" (retry timeout {t}s)"))
                    .unwrap_or_default()
            ),
        })
    }

    /// Unblock every task whose classified reason matches the filter (or
    /// all blocked tasks when no filter is given).
    pub fn unblock_all(
        &self,
        reason_filter: Option<BlockReason>,
        reason: &str,
    ) -> Result<Vec<UnblockResult>> {
        let targets: Vec<String> = self
            .list_blocked_tasks()
            .into_iter()
            .filter(|info| reason_filter.map(|f| info.reason == f).unwrap_or(true))
            .map(|info| info.task_id)
            .collect();

        let mut results = Vec::with_capacity(targets.len());
        for task_id in targets {
            results.push(self.unblock_task(&task_id, reason, None)?);
        }
        Ok(results)
    }
}
