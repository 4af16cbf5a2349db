//! YAML task-file backend with native parallel grouping.
//!
//! Schema (version 1):
//!
//! ```yaml
//! version: 1
//! tasks:
//!   - id: task-1
//!     title: Build the parser
//!     group: core
//!     acceptance:
//!       - parses the happy path
//!     depends_on: []
//!     completed: false
//!     blocked: false
//! ```
//!
//! A `group` field drives the parallel executor; tasks without one land in
//! `"default"`.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;

use serde_yaml::Value;

use crate::{PrdKind, SelectedTask, Tracker, TrackerError, atomic_write, deps_satisfied};

fn as_str_value(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn field_str(task: &Value, key: &str) -> Option<String> {
    task.get(key).and_then(as_str_value)
}

fn field_bool(task: &Value, key: &str) -> bool {
    task.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn field_str_list(task: &Value, key: &str) -> Vec<String> {
    match task.get(key) {
        Some(Value::Sequence(items)) => items.iter().filter_map(as_str_value).collect(),
        _ => Vec::new(),
    }
}

fn is_settled(task: &Value) -> bool {
    field_bool(task, "completed") || field_bool(task, "blocked")
}

/// Tracker over a version-1 YAML task file.
#[derive(Debug, Clone)]
pub struct YamlTracker {
    prd_path: PathBuf,
}

impl YamlTracker {
    pub fn new(prd_path: PathBuf) -> Self {
        Self { prd_path }
    }

    /// Load and validate the document shape. Validation failures are real
    /// schema errors, not transient I/O, so they are reported.
    pub fn load(&self) -> Result<Value, TrackerError> {
        let text = fs::read_to_string(&self.prd_path)
            .map_err(|_| TrackerError::MissingPrd(self.prd_path.clone()))?;
        let data: Value = serde_yaml::from_str(&text)
            .map_err(|e| TrackerError::InvalidPrd(format!("Invalid YAML syntax: {e}")))?;

        if !data.is_mapping() {
            return Err(TrackerError::InvalidPrd("YAML root must be a mapping".to_string()));
        }
        if data.get("version").and_then(Value::as_i64) != Some(1) {
            return Err(TrackerError::InvalidPrd(
                "Unsupported YAML version (expected 1)".to_string(),
            ));
        }
        let Some(tasks) = data.get("tasks").and_then(|t| t.as_sequence()) else {
            return Err(TrackerError::InvalidPrd("YAML must have a 'tasks' list".to_string()));
        };
        for (i, task) in tasks.iter().enumerate() {
            if !task.is_mapping() {
                return Err(TrackerError::InvalidPrd(format!(
                    "Task at index {i} must be a mapping"
                )));
            }
            if field_str(task, "id").is_none() {
                return Err(TrackerError::InvalidPrd(format!(
                    "Task at index {i} missing required 'id' field"
                )));
            }
            if field_str(task, "title").is_none() {
                return Err(TrackerError::InvalidPrd(format!(
                    "Task at index {i} missing required 'title' field"
                )));
            }
        }
        Ok(data)
    }

    fn save(&self, data: &Value) -> bool {
        let Ok(text) = serde_yaml::to_string(data) else {
            return false;
        };
        atomic_write(&self.prd_path, &text).is_ok()
    }

    fn tasks(data: &Value) -> &[Value] {
        data.get("tasks")
            .and_then(|t| t.as_sequence())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn to_selected(task: &Value) -> Option<SelectedTask> {
        Some(SelectedTask {
            id: field_str(task, "id")?,
            title: field_str(task, "title")?,
            kind: PrdKind::Yaml,
            acceptance: field_str_list(task, "acceptance"),
            depends_on: field_str_list(task, "depends_on"),
            group: field_str(task, "group").unwrap_or_else(|| "default".to_string()),
        })
    }

    fn settled_ids(data: &Value) -> HashSet<String> {
        Self::tasks(data)
            .iter()
            .filter(|t| is_settled(t))
            .filter_map(|t| field_str(t, "id"))
            .collect()
    }

    fn mutate_task(&self, task_id: &str, f: impl Fn(&mut serde_yaml::Mapping) -> bool) -> bool {
        let Ok(mut data) = self.load() else {
            return false;
        };
        let Some(tasks) = data.get_mut("tasks").and_then(|t| t.as_sequence_mut()) else {
            return false;
        };
        let mut changed = false;
        for task in tasks.iter_mut() {
            let id = task.get("id").and_then(as_str_value);
            if id.as_deref() != Some(task_id) {
                continue;
            }
            if let Some(map) = task.as_mapping_mut() {
                changed = f(map);
            }
            break;
        }
        changed && self.save(&data)
    }
}

impl Tracker for YamlTracker {
    fn kind(&self) -> PrdKind {
        PrdKind::Yaml
    }

    fn peek_next_task(&self, exclude_ids: &HashSet<String>) -> Option<SelectedTask> {
        let data = self.load().ok()?;
        let settled = Self::settled_ids(&data);
        Self::tasks(&data)
            .iter()
            .find(|t| {
                let Some(id) = field_str(t, "id") else {
                    return false;
                };
                !exclude_ids.contains(&id)
                    && !is_settled(t)
                    && deps_satisfied(&field_str_list(t, "depends_on"), &settled)
            })
            .and_then(Self::to_selected)
    }

    fn counts(&self) -> (usize, usize) {
        match self.load() {
            Ok(data) => {
                let all = Self::tasks(&data);
                (all.iter().filter(|t| is_settled(t)).count(), all.len())
            }
            Err(_) => (0, 0),
        }
    }

    fn all_done(&self) -> bool {
        match self.load() {
            Ok(data) => Self::tasks(&data).iter().all(is_settled),
            Err(_) => false,
        }
    }

    fn all_blocked(&self) -> bool {
        match self.load() {
            Ok(data) => {
                let remaining: Vec<_> = Self::tasks(&data)
                    .iter()
                    .filter(|t| !field_bool(t, "completed"))
                    .collect();
                !remaining.is_empty() && remaining.iter().all(|t| field_bool(t, "blocked"))
            }
            Err(_) => false,
        }
    }

    fn is_task_done(&self, task_id: &str) -> bool {
        match self.load() {
            Ok(data) => Self::tasks(&data)
                .iter()
                .any(|t| field_str(t, "id").as_deref() == Some(task_id) && field_bool(t, "completed")),
            Err(_) => false,
        }
    }

    fn force_task_open(&self, task_id: &str) -> bool {
        self.mutate_task(task_id, |map| {
            let was_done = map
                .get(&Value::from("completed"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !was_done {
                return false;
            }
            map.insert(Value::from("completed"), Value::from(false));
            true
        })
    }

    fn block_task(&self, task_id: &str, reason: &str) -> bool {
        self.mutate_task(task_id, |map| {
            if map
                .get(&Value::from("blocked"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                return false;
            }
            map.insert(Value::from("blocked"), Value::from(true));
            if !reason.is_empty() {
                map.insert(Value::from("blocked_reason"), Value::from(reason));
            }
            true
        })
    }

    fn branch_name(&self) -> Option<String> {
        let data = self.load().ok()?;
        data.get("metadata")
            .and_then(|m| m.get("branch"))
            .and_then(as_str_value)
            .filter(|s| !s.trim().is_empty())
    }

    fn get_parallel_groups(&self) -> BTreeMap<String, Vec<SelectedTask>> {
        let Ok(data) = self.load() else {
            return BTreeMap::new();
        };
        let settled = Self::settled_ids(&data);
        let mut groups: BTreeMap<String, Vec<SelectedTask>> = BTreeMap::new();
        for task in Self::tasks(&data) {
            if is_settled(task) {
                continue;
            }
            if !deps_satisfied(&field_str_list(task, "depends_on"), &settled) {
                continue;
            }
            if let Some(selected) = Self::to_selected(task) {
                groups.entry(selected.group.clone()).or_default().push(selected);
            }
        }
        groups
    }

    fn get_task_by_id(&self, task_id: &str) -> Option<SelectedTask> {
        let data = self.load().ok()?;
        Self::tasks(&data)
            .iter()
            .find(|t| field_str(t, "id").as_deref() == Some(task_id))
            .and_then(Self::to_selected)
    }
}
