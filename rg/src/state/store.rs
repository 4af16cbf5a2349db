//! `state.json`: iteration history, rate-limit ledger, attempts, blocks,
//! and snapshot metadata.
//!
//! The store is the single owner of the file on the sequential loop path;
//! parallel workers get their own copy under each worktree. Loading is
//! tolerant (a corrupt file yields a fresh state rather than a crash), and
//! every save is atomic.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::atomic::atomic_write_json;

/// History is a bounded ring: only the last 200 iterations are retained.
pub const HISTORY_CAP: usize = 200;

const RATE_WINDOW_SECONDS: f64 = 3600.0;

pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn epoch_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSummary {
    pub cmd: String,
    pub return_code: i32,
    pub duration_seconds: f64,
}

/// One per-iteration history record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryEntry {
    pub ts: String,
    pub iteration: u64,
    pub agent: String,
    pub story_id: Option<String>,
    pub duration_seconds: f64,
    pub return_code: i32,
    pub exit_signal_raw: Option<bool>,
    pub exit_signal_effective: Option<bool>,
    pub repo_clean: bool,
    pub gates_ok: Option<bool>,
    pub judge_ok: Option<bool>,
    pub review_ok: Option<bool>,
    pub timed_out: bool,
    pub gate_results: Vec<GateSummary>,
    pub log: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskAttempts {
    pub count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockedTask {
    pub blocked_at: String,
    pub reason: String,
}

/// Append-only audit record for unblock operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UnblockEvent {
    pub attempt_id: String,
    pub task_id: String,
    pub unblocked_at: String,
    pub reason: String,
    pub new_timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotMeta {
    pub name: String,
    pub timestamp: String,
    pub git_stash_ref: String,
    pub state_backup_path: String,
    pub description: String,
    pub git_commit: String,
}

/// The JSON document behind `.ralph/state.json`. Top-level field names are
/// part of the on-disk format and keep their historical casing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentState {
    #[serde(rename = "createdAt")]
    pub created_at: String,
    /// Epoch seconds of agent invocations, for rate-limit windowing.
    pub invocations: Vec<f64>,
    #[serde(rename = "noProgressStreak")]
    pub no_progress_streak: u32,
    pub history: VecDeque<HistoryEntry>,
    pub task_attempts: BTreeMap<String, TaskAttempts>,
    pub blocked_tasks: BTreeMap<String, BlockedTask>,
    pub snapshots: Vec<SnapshotMeta>,
    pub attempt_history: Vec<UnblockEvent>,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            created_at: utc_now_iso(),
            invocations: Vec::new(),
            no_progress_streak: 0,
            history: VecDeque::new(),
            task_attempts: BTreeMap::new(),
            blocked_tasks: BTreeMap::new(),
            snapshots: Vec::new(),
            attempt_history: Vec::new(),
        }
    }
}

impl PersistentState {
    /// Append a history entry, truncating the ring to [`HISTORY_CAP`].
    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push_back(entry);
        while self.history.len() > HISTORY_CAP {
            self.history.pop_front();
        }
    }

    pub fn record_invocation(&mut self, epoch_seconds: f64) {
        self.invocations.push(epoch_seconds);
    }

    pub fn bump_attempts(&mut self, task_id: &str) -> u32 {
        let entry = self.task_attempts.entry(task_id.to_string()).or_default();
        entry.count += 1;
        entry.count
    }

    pub fn attempts_for(&self, task_id: &str) -> u32 {
        self.task_attempts.get(task_id).map(|a| a.count).unwrap_or(0)
    }
}

/// Sliding one-hour window check. Prunes stale invocation timestamps in
/// place and returns `(ok, wait_seconds)`; disabled when `per_hour` is 0.
pub fn rate_limit_check(state: &mut PersistentState, per_hour: u32, now_epoch: f64) -> (bool, u64) {
    if per_hour == 0 {
        return (true, 0);
    }
    state
        .invocations
        .retain(|ts| now_epoch - *ts < RATE_WINDOW_SECONDS);
    if state.invocations.len() < per_hour as usize {
        return (true, 0);
    }
    let oldest = state
        .invocations
        .iter()
        .cloned()
        .fold(f64::INFINITY, f64::min);
    let wait = (RATE_WINDOW_SECONDS - (now_epoch - oldest)).max(0.0);
    (false, wait as u64)
}

/// Owner of `state.json` for one project root (or worktree).
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn for_root(project_root: &Path) -> Self {
        Self {
            path: project_root.join(".ralph").join("state.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load state, tolerating a missing or corrupt file.
    pub fn load(&self) -> PersistentState {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "corrupt state.json; starting fresh");
                    PersistentState::default()
                }
            },
            Err(_) => PersistentState::default(),
        }
    }

    pub fn save(&self, state: &PersistentState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        atomic_write_json(&self.path, state)
    }

    /// Next iteration index: last history entry's iteration + 1. Keeps
    /// iteration artifacts monotonic across separate invocations.
    pub fn next_iteration_number(&self) -> u64 {
        let state = self.load();
        state
            .history
            .back()
            .map(|entry| entry.iteration + 1)
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_is_fresh() {
        let dir = tempdir().unwrap();
        let store = StateStore::for_root(dir.path());
        let state = store.load();
        assert!(state.history.is_empty());
        assert_eq!(state.no_progress_streak, 0);
        assert!(!state.created_at.is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = StateStore::for_root(dir.path());

        let mut state = PersistentState::default();
        state.no_progress_streak = 2;
        state.record_invocation(123.0);
        state.push_history(HistoryEntry {
            iteration: 7,
            agent: "codex".to_string(),
            story_id: Some("3".to_string()),
            gates_ok: Some(true),
            ..Default::default()
        });
        store.save(&state).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.no_progress_streak, 2);
        assert_eq!(loaded.invocations, vec![123.0]);
        assert_eq!(loaded.history.len(), 1);
        assert_eq!(loaded.history[0].iteration, 7);
        assert_eq!(loaded.history[0].gates_ok, Some(true));
    }

    #[test]
    fn test_on_disk_field_names() {
        let dir = tempdir().unwrap();
        let store = StateStore::for_root(dir.path());
        store.save(&PersistentState::default()).unwrap();
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"createdAt\""));
        assert!(raw.contains("\"noProgressStreak\""));
        assert!(raw.contains("\"task_attempts\""));
    }

    #[test]
    fn test_corrupt_state_starts_fresh() {
        let dir = tempdir().unwrap();
        let store = StateStore::for_root(dir.path());
        std::fs::create_dir_all(dir.path().join(".ralph")).unwrap();
        std::fs::write(store.path(), "{broken").unwrap();
        let state = store.load();
        assert!(state.history.is_empty());
    }

    #[test]
    fn test_history_ring_truncates_to_cap() {
        let mut state = PersistentState::default();
        for i in 0..(HISTORY_CAP as u64 + 50) {
            state.push_history(HistoryEntry {
                iteration: i + 1,
                ..Default::default()
            });
        }
        assert_eq!(state.history.len(), HISTORY_CAP);
        // Oldest entries dropped, newest kept.
        assert_eq!(state.history.front().unwrap().iteration, 51);
        assert_eq!(state.history.back().unwrap().iteration, HISTORY_CAP as u64 + 50);
    }

    #[test]
    fn test_next_iteration_number_monotonic() {
        let dir = tempdir().unwrap();
        let store = StateStore::for_root(dir.path());
        assert_eq!(store.next_iteration_number(), 1);

        let mut state = PersistentState::default();
        state.push_history(HistoryEntry {
            iteration: 41,
            ..Default::default()
        });
        store.save(&state).unwrap();
        assert_eq!(store.next_iteration_number(), 42);
    }

    #[test]
    fn test_rate_limit_disabled() {
        let mut state = PersistentState::default();
        let (ok, wait) = rate_limit_check(&mut state, 0, 1000.0);
        assert!(ok);
        assert_eq!(wait, 0);
    }

    #[test]
    fn test_rate_limit_window() {
        let mut state = PersistentState::default();
        let now = 10_000.0;
        // Two recent invocations, one stale.
        state.invocations = vec![now - 5000.0, now - 100.0, now - 50.0];

        let (ok, _) = rate_limit_check(&mut state, 3, now);
        // The stale entry was pruned, leaving 2 < 3.
        assert!(ok);
        assert_eq!(state.invocations.len(), 2);

        let (ok, wait) = rate_limit_check(&mut state, 2, now);
        assert!(!ok);
        // The oldest surviving entry is 100s old: ~3500s to wait.
        assert_eq!(wait, 3500);
    }

    #[test]
    fn test_bump_attempts() {
        let mut state = PersistentState::default();
        assert_eq!(state.attempts_for("t1"), 0);
        assert_eq!(state.bump_attempts("t1"), 1);
        assert_eq!(state.bump_attempts("t1"), 2);
        assert_eq!(state.attempts_for("t1"), 2);
    }
}
