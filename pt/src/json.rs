//! JSON PRD backend.
//!
//! The PRD is an object with a `stories` array. Story identity may live in
//! `id`, `story_id`, or `key`; completion is either a boolean `passes` or a
//! `status` string. Selection sorts open stories by integer `priority`
//! (default 10000, stable) and returns the first whose dependencies are all
//! settled.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use serde_json::{Value, json};

use crate::{PrdKind, SelectedTask, Tracker, TrackerError, atomic_write, deps_satisfied};

const DEFAULT_PRIORITY: i64 = 10_000;

pub(crate) fn story_id(story: &Value) -> Option<String> {
    for key in ["id", "story_id", "key"] {
        match story.get(key) {
            Some(Value::String(s)) => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => continue,
        }
    }
    None
}

pub(crate) fn story_done(story: &Value) -> bool {
    if let Some(passes) = story.get("passes") {
        return passes.as_bool().unwrap_or(false);
    }
    story
        .get("status")
        .and_then(Value::as_str)
        .map(|s| s.to_lowercase() == "done")
        .unwrap_or(false)
}

pub(crate) fn story_blocked(story: &Value) -> bool {
    if story.get("blocked").and_then(Value::as_bool) == Some(true) {
        return true;
    }
    story
        .get("status")
        .and_then(Value::as_str)
        .map(|s| matches!(s.to_lowercase().as_str(), "blocked" | "stuck"))
        .unwrap_or(false)
}

pub(crate) fn story_depends(story: &Value) -> Vec<String> {
    match story.get("depends_on") {
        Some(Value::Array(deps)) => deps
            .iter()
            .filter_map(|d| match d {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn story_priority(story: &Value) -> i64 {
    story
        .get("priority")
        .and_then(Value::as_i64)
        .unwrap_or(DEFAULT_PRIORITY)
}

pub(crate) fn story_acceptance(story: &Value) -> Vec<String> {
    match story.get("acceptance") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn stories(prd: &Value) -> &[Value] {
    prd.get("stories")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Tracker over a JSON PRD file.
#[derive(Debug, Clone)]
pub struct JsonTracker {
    prd_path: PathBuf,
}

impl JsonTracker {
    pub fn new(prd_path: PathBuf) -> Self {
        Self { prd_path }
    }

    fn load(&self) -> Result<Value, TrackerError> {
        let text = fs::read_to_string(&self.prd_path)
            .map_err(|_| TrackerError::MissingPrd(self.prd_path.clone()))?;
        serde_json::from_str(&text).map_err(|e| TrackerError::InvalidPrd(e.to_string()))
    }

    fn save(&self, prd: &Value) -> bool {
        let Ok(mut text) = serde_json::to_string_pretty(prd) else {
            return false;
        };
        text.push('\n');
        atomic_write(&self.prd_path, &text).is_ok()
    }

    fn to_selected(story: &Value) -> Option<SelectedTask> {
        let id = story_id(story)?;
        let title = story
            .get("title")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("Story {id}"));
        Some(SelectedTask {
            id,
            title,
            kind: PrdKind::Json,
            acceptance: story_acceptance(story),
            depends_on: story_depends(story),
            group: "default".to_string(),
        })
    }

    fn settled_ids(prd: &Value) -> HashSet<String> {
        stories(prd)
            .iter()
            .filter(|s| story_done(s) || story_blocked(s))
            .filter_map(story_id)
            .collect()
    }
}

impl Tracker for JsonTracker {
    fn kind(&self) -> PrdKind {
        PrdKind::Json
    }

    fn peek_next_task(&self, exclude_ids: &HashSet<String>) -> Option<SelectedTask> {
        let prd = self.load().ok()?;
        let settled = Self::settled_ids(&prd);

        let mut remaining: Vec<&Value> = stories(&prd)
            .iter()
            .filter(|s| {
                let Some(id) = story_id(s) else {
                    return false;
                };
                !exclude_ids.contains(&id)
                    && !story_done(s)
                    && !story_blocked(s)
                    && deps_satisfied(&story_depends(s), &settled)
            })
            .collect();

        // Stable sort keeps document order within equal priorities.
        remaining.sort_by_key(|s| story_priority(s));
        remaining.first().and_then(|s| Self::to_selected(s))
    }

    fn counts(&self) -> (usize, usize) {
        match self.load() {
            Ok(prd) => {
                let all = stories(&prd);
                let done = all
                    .iter()
                    .filter(|s| story_done(s) || story_blocked(s))
                    .count();
                (done, all.len())
            }
            Err(_) => (0, 0),
        }
    }

    fn all_done(&self) -> bool {
        match self.load() {
            Ok(prd) => stories(&prd).iter().all(|s| story_done(s) || story_blocked(s)),
            Err(_) => false,
        }
    }

    fn all_blocked(&self) -> bool {
        match self.load() {
            Ok(prd) => {
                let remaining: Vec<_> = stories(&prd).iter().filter(|s| !story_done(s)).collect();
                !remaining.is_empty() && remaining.iter().all(|s| story_blocked(s))
            }
            Err(_) => false,
        }
    }

    fn is_task_done(&self, task_id: &str) -> bool {
        match self.load() {
            Ok(prd) => stories(&prd)
                .iter()
                .any(|s| story_id(s).as_deref() == Some(task_id) && story_done(s)),
            Err(_) => false,
        }
    }

    fn force_task_open(&self, task_id: &str) -> bool {
        let Ok(mut prd) = self.load() else {
            return false;
        };
        let Some(list) = prd.get_mut("stories").and_then(Value::as_array_mut) else {
            return false;
        };
        let mut changed = false;
        for story in list.iter_mut() {
            if story_id(story).as_deref() != Some(task_id) {
                continue;
            }
            let Some(obj) = story.as_object_mut() else {
                continue;
            };
            if obj.get("passes").and_then(Value::as_bool) == Some(true) {
                obj.insert("passes".to_string(), json!(false));
                changed = true;
            }
            if obj.get("status").and_then(Value::as_str).map(str::to_lowercase)
                == Some("done".to_string())
            {
                obj.insert("status".to_string(), json!("open"));
                changed = true;
            }
            if obj.remove("completedAt").is_some() {
                changed = true;
            }
            break;
        }
        changed && self.save(&prd)
    }

    fn block_task(&self, task_id: &str, reason: &str) -> bool {
        let Ok(mut prd) = self.load() else {
            return false;
        };
        let Some(list) = prd.get_mut("stories").and_then(Value::as_array_mut) else {
            return false;
        };
        let mut changed = false;
        for story in list.iter_mut() {
            if story_id(story).as_deref() != Some(task_id) {
                continue;
            }
            let Some(obj) = story.as_object_mut() else {
                continue;
            };
            obj.insert("blocked".to_string(), json!(true));
            if obj.contains_key("status") {
                obj.insert("status".to_string(), json!("blocked"));
            }
            if !reason.is_empty() && !obj.contains_key("blocked_reason") {
                obj.insert("blocked_reason".to_string(), json!(reason));
            }
            changed = true;
            break;
        }
        changed && self.save(&prd)
    }

    fn branch_name(&self) -> Option<String> {
        let prd = self.load().ok()?;
        for key in ["branchName", "branch", "gitBranch", "branch_name", "branchNameOverride"] {
            if let Some(v) = prd.get(key).and_then(Value::as_str) {
                let v = v.trim();
                if !v.is_empty() {
                    return Some(v.to_string());
                }
            }
        }
        None
    }

    fn get_task_by_id(&self, task_id: &str) -> Option<SelectedTask> {
        let prd = self.load().ok()?;
        stories(&prd)
            .iter()
            .find(|s| story_id(s).as_deref() == Some(task_id))
            .and_then(Self::to_selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_prd(value: &Value) -> (tempfile::TempDir, JsonTracker) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prd.json");
        fs::write(&path, serde_json::to_string_pretty(value).unwrap()).unwrap();
        (dir, JsonTracker::new(path))
    }

    fn sample() -> Value {
        json!({
            "branchName": "ralph/json-prd",
            "stories": [
                {"id": "a", "title": "Alpha", "status": "done"},
                {"id": "b", "title": "Beta", "priority": 5, "acceptance": ["does beta"]},
                {"id": "c", "title": "Gamma", "priority": 1, "depends_on": ["b"]},
                {"id": "d", "title": "Delta", "blocked": true},
                {"key": "e", "title": "Epsilon", "passes": true}
            ]
        })
    }

    #[test]
    fn test_priority_selection() {
        let (_dir, tracker) = write_prd(&sample());
        // "c" has the lowest priority number but depends on open "b".
        let task = tracker.peek_next_task(&HashSet::new()).unwrap();
        assert_eq!(task.id, "b");
        assert_eq!(task.acceptance, vec!["does beta"]);
    }

    #[test]
    fn test_dependency_unlocks_after_block() {
        let (_dir, tracker) = write_prd(&sample());
        assert!(tracker.block_task("b", "manual"));
        // "b" is now settled, so "c" becomes selectable.
        let task = tracker.peek_next_task(&HashSet::new()).unwrap();
        assert_eq!(task.id, "c");
    }

    #[test]
    fn test_counts_and_flags() {
        let (_dir, tracker) = write_prd(&sample());
        // done: a (status), d (blocked), e (passes) => 3 of 5
        assert_eq!(tracker.counts(), (3, 5));
        assert!(!tracker.all_done());
        assert!(tracker.is_task_done("a"));
        assert!(tracker.is_task_done("e"));
        assert!(!tracker.is_task_done("d"));
    }

    #[test]
    fn test_force_task_open_clears_all_done_shapes() {
        let (_dir, tracker) = write_prd(&json!({
            "stories": [
                {"id": "x", "title": "X", "status": "done", "completedAt": "2026-01-01"},
                {"id": "y", "title": "Y", "passes": true}
            ]
        }));

        assert!(tracker.force_task_open("x"));
        assert!(!tracker.is_task_done("x"));
        assert!(tracker.force_task_open("y"));
        assert!(!tracker.is_task_done("y"));
        // Nothing left to revert.
        assert!(!tracker.force_task_open("x"));
    }

    #[test]
    fn test_all_blocked() {
        let (_dir, tracker) = write_prd(&json!({
            "stories": [
                {"id": "a", "title": "A", "status": "done"},
                {"id": "b", "title": "B", "status": "blocked"},
                {"id": "c", "title": "C", "status": "stuck"}
            ]
        }));
        assert!(tracker.all_blocked());
    }

    #[test]
    fn test_branch_name_key_order() {
        let (_dir, tracker) = write_prd(&sample());
        assert_eq!(tracker.branch_name().as_deref(), Some("ralph/json-prd"));
    }

    #[test]
    fn test_numeric_ids() {
        let (_dir, tracker) = write_prd(&json!({
            "stories": [{"id": 7, "title": "Numeric"}]
        }));
        let task = tracker.peek_next_task(&HashSet::new()).unwrap();
        assert_eq!(task.id, "7");
        assert!(tracker.get_task_by_id("7").is_some());
    }

    #[test]
    fn test_malformed_prd_degrades() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prd.json");
        fs::write(&path, "not json").unwrap();
        let tracker = JsonTracker::new(path);
        assert!(tracker.peek_next_task(&HashSet::new()).is_none());
        assert_eq!(tracker.counts(), (0, 0));
        assert!(!tracker.all_done());
    }
}
