//! Beads backend over the `bd` CLI.
//!
//! Intentionally lightweight: `bd ready --json` supplies the next issue
//! (beads already sorts by priority/age), `bd update`/`bd show` handle
//! state. Only enable this tracker in repos that actually use Beads.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::{Command, Output};

use log::debug;
use serde_json::Value;

use crate::{PrdKind, SelectedTask, Tracker};

pub struct BeadsTracker {
    project_root: PathBuf,
}

impl BeadsTracker {
    pub fn new(project_root: PathBuf) -> Self {
        Self { project_root }
    }

    fn run(&self, args: &[&str]) -> Option<Output> {
        Command::new("bd")
            .args(args)
            .current_dir(&self.project_root)
            .output()
            .ok()
    }

    fn ready_issues(&self) -> Vec<Value> {
        let Some(output) = self.run(&["ready", "--json"]) else {
            return Vec::new();
        };
        if !output.status.success() {
            debug!(
                "bd ready failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Vec::new();
        }
        match serde_json::from_slice::<Value>(&output.stdout) {
            Ok(Value::Array(issues)) => issues,
            _ => Vec::new(),
        }
    }

    fn issue_to_task(issue: &Value) -> Option<SelectedTask> {
        let id = issue
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())?
            .to_string();
        let title = issue
            .get("title")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&id)
            .to_string();
        Some(SelectedTask::new(id, title, PrdKind::Beads))
    }
}

impl Tracker for BeadsTracker {
    fn kind(&self) -> PrdKind {
        PrdKind::Beads
    }

    fn peek_next_task(&self, exclude_ids: &HashSet<String>) -> Option<SelectedTask> {
        self.ready_issues()
            .iter()
            .filter_map(Self::issue_to_task)
            .find(|t| !exclude_ids.contains(&t.id))
    }

    fn claim_next_task(&self) -> Option<SelectedTask> {
        let task = self.peek_next_task(&HashSet::new())?;
        // Best-effort in-progress mark; ignore failures.
        let _ = self.run(&["update", &task.id, "--status", "in_progress", "--json"]);
        Some(task)
    }

    /// Beads has no single counts API; `bd stats` covers reporting needs.
    fn counts(&self) -> (usize, usize) {
        (0, 0)
    }

    /// Unknown without a project-level query.
    fn all_done(&self) -> bool {
        false
    }

    fn is_task_done(&self, task_id: &str) -> bool {
        let Some(output) = self.run(&["show", task_id, "--json"]) else {
            return false;
        };
        if !output.status.success() {
            return false;
        }
        serde_json::from_slice::<Value>(&output.stdout)
            .ok()
            .and_then(|obj| {
                obj.get("status")
                    .and_then(Value::as_str)
                    .map(|s| matches!(s.to_lowercase().as_str(), "done" | "closed" | "complete" | "completed"))
            })
            .unwrap_or(false)
    }

    fn force_task_open(&self, task_id: &str) -> bool {
        self.run(&["update", task_id, "--status", "open", "--json"])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn block_task(&self, task_id: &str, _reason: &str) -> bool {
        self.run(&["update", task_id, "--status", "blocked", "--json"])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn get_task_by_id(&self, task_id: &str) -> Option<SelectedTask> {
        self.ready_issues()
            .iter()
            .filter_map(Self::issue_to_task)
            .find(|t| t.id == task_id)
    }
}
