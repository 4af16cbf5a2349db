//! PrdTrack - task tracker contract and PRD backends for the Ralph Gold loop
//!
//! A PRD (Markdown, JSON, or YAML file, or a remote issue system) is the
//! source of truth for the task backlog. This crate exposes one trait,
//! [`Tracker`], over every backend, plus a factory that picks the backend
//! from a kind string or the PRD file extension.
//!
//! # Modules
//!
//! - [`markdown`] - `## Tasks` checkbox lists in a Markdown PRD
//! - [`json`] - `stories` arrays in a JSON PRD
//! - [`yaml`] - version-1 YAML task files with native parallel groups
//! - [`github`] - open GitHub issues via the `gh` CLI
//! - [`beads`] - Beads issues via the `bd` CLI
//! - [`convert`] - lossless JSON <-> YAML PRD conversion

pub mod beads;
pub mod cli;
pub mod convert;
pub mod github;
pub mod json;
pub mod markdown;
pub mod yaml;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use beads::BeadsTracker;
pub use github::{GithubOptions, GithubTracker};
pub use json::JsonTracker;
pub use markdown::MarkdownTracker;
pub use yaml::YamlTracker;

/// Which backend a task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrdKind {
    Markdown,
    Json,
    Yaml,
    Beads,
    Github,
}

impl fmt::Display for PrdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Markdown => write!(f, "md"),
            Self::Json => write!(f, "json"),
            Self::Yaml => write!(f, "yaml"),
            Self::Beads => write!(f, "beads"),
            Self::Github => write!(f, "github"),
        }
    }
}

/// Task status across all backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Done,
    Blocked,
}

impl TaskStatus {
    /// Done and blocked tasks both satisfy dependencies and count toward
    /// completion totals.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Done | Self::Blocked)
    }
}

/// A unified pointer to the next unit of work across tracker formats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedTask {
    pub id: String,
    pub title: String,
    pub kind: PrdKind,
    #[serde(default)]
    pub acceptance: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_group")]
    pub group: String,
}

fn default_group() -> String {
    "default".to_string()
}

impl SelectedTask {
    pub fn new(id: impl Into<String>, title: impl Into<String>, kind: PrdKind) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            kind,
            acceptance: Vec::new(),
            depends_on: Vec::new(),
            group: default_group(),
        }
    }
}

/// Errors surfaced when constructing a tracker or converting a PRD.
///
/// Read failures inside tracker operations never surface as errors; the
/// contract returns empty defaults instead so one bad read cannot stall the
/// loop.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Missing PRD file: {0}")]
    MissingPrd(PathBuf),

    #[error("Invalid PRD: {0}")]
    InvalidPrd(String),

    #[error("Unknown tracker kind: {0}")]
    UnknownKind(String),
}

/// Abstraction over different task tracking backends.
///
/// All operations are synchronous and infallible from the caller's
/// perspective: I/O errors degrade to "no task" / `(0, 0)` / `false`.
pub trait Tracker: Send + Sync {
    fn kind(&self) -> PrdKind;

    /// Next selectable task: status open, not excluded, every dependency
    /// done-or-blocked. Returns `None` on I/O errors.
    fn peek_next_task(&self, exclude_ids: &HashSet<String>) -> Option<SelectedTask>;

    /// Same as peek; remote backends may additionally mark the task
    /// in-progress (best-effort).
    fn claim_next_task(&self) -> Option<SelectedTask> {
        self.peek_next_task(&HashSet::new())
    }

    /// `(done, total)`; blocked tasks count as done. `(0, 0)` on error.
    fn counts(&self) -> (usize, usize);

    /// True when every task is done or blocked. `false` on error.
    fn all_done(&self) -> bool;

    /// True when tasks remain and every remaining task is blocked.
    fn all_blocked(&self) -> bool {
        false
    }

    fn is_task_done(&self, task_id: &str) -> bool;

    /// Revert a done task to open (the post-iteration safety valve when
    /// gates fail). Returns whether anything changed.
    fn force_task_open(&self, task_id: &str) -> bool;

    /// Mark a task blocked, recording the reason where the backend allows.
    fn block_task(&self, task_id: &str, reason: &str) -> bool;

    /// PRD-declared branch name, if any.
    fn branch_name(&self) -> Option<String> {
        None
    }

    /// Tasks grouped for parallel scheduling. Backends without native
    /// grouping return an empty map, which callers treat as "fall back to
    /// sequential".
    fn get_parallel_groups(&self) -> BTreeMap<String, Vec<SelectedTask>> {
        BTreeMap::new()
    }

    fn get_task_by_id(&self, task_id: &str) -> Option<SelectedTask>;
}

/// Options for [`make_tracker`]; the orchestrator maps its own config onto
/// this so the two crates stay decoupled.
#[derive(Debug, Clone)]
pub struct TrackerOptions {
    /// auto|markdown|json|yaml|beads|github_issues
    pub kind: String,
    pub prd_path: PathBuf,
    pub project_root: PathBuf,
    pub github: GithubOptions,
}

/// Instantiate the configured tracker.
pub fn make_tracker(opts: &TrackerOptions) -> Result<Box<dyn Tracker>, TrackerError> {
    let mut kind = opts.kind.trim().to_lowercase();
    if kind.is_empty() {
        kind = "auto".to_string();
    }

    if kind == "auto" {
        kind = match opts
            .prd_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .as_deref()
        {
            Some("yaml") | Some("yml") => "yaml".to_string(),
            Some("md") | Some("markdown") => "markdown".to_string(),
            _ => "json".to_string(),
        };
    }

    match kind.as_str() {
        "markdown" | "md" => Ok(Box::new(MarkdownTracker::new(opts.prd_path.clone()))),
        "json" | "file" => Ok(Box::new(JsonTracker::new(opts.prd_path.clone()))),
        "yaml" | "yml" => Ok(Box::new(YamlTracker::new(opts.prd_path.clone()))),
        "beads" | "bd" => Ok(Box::new(BeadsTracker::new(opts.project_root.clone()))),
        "github_issues" | "github" => {
            if opts.github.repo.trim().is_empty() {
                return Err(TrackerError::InvalidPrd(
                    "GitHub Issues tracker requires [tracker.github] repo in ralph.toml".to_string(),
                ));
            }
            Ok(Box::new(GithubTracker::new(
                opts.project_root.clone(),
                opts.github.clone(),
            )))
        }
        other => Err(TrackerError::UnknownKind(other.to_string())),
    }
}

pub(crate) fn deps_satisfied(deps: &[String], settled_ids: &HashSet<String>) -> bool {
    deps.iter().all(|d| settled_ids.contains(d))
}

/// Write a PRD file via sibling temp + rename so readers never observe a
/// partially written backlog.
pub(crate) fn atomic_write(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_tracker_auto_detects_by_extension() {
        let opts = |name: &str| TrackerOptions {
            kind: "auto".to_string(),
            prd_path: PathBuf::from(name),
            project_root: PathBuf::from("."),
            github: GithubOptions::default(),
        };

        assert_eq!(make_tracker(&opts(".ralph/PRD.md")).unwrap().kind(), PrdKind::Markdown);
        assert_eq!(make_tracker(&opts(".ralph/prd.json")).unwrap().kind(), PrdKind::Json);
        assert_eq!(make_tracker(&opts(".ralph/tasks.yaml")).unwrap().kind(), PrdKind::Yaml);
        assert_eq!(make_tracker(&opts(".ralph/tasks.yml")).unwrap().kind(), PrdKind::Yaml);
    }

    #[test]
    fn test_make_tracker_explicit_kinds() {
        let opts = |kind: &str| TrackerOptions {
            kind: kind.to_string(),
            prd_path: PathBuf::from(".ralph/PRD.md"),
            project_root: PathBuf::from("."),
            github: GithubOptions::default(),
        };

        assert_eq!(make_tracker(&opts("markdown")).unwrap().kind(), PrdKind::Markdown);
        assert_eq!(make_tracker(&opts("beads")).unwrap().kind(), PrdKind::Beads);
        assert!(matches!(
            make_tracker(&opts("bogus")),
            Err(TrackerError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_make_tracker_github_requires_repo() {
        let opts = TrackerOptions {
            kind: "github_issues".to_string(),
            prd_path: PathBuf::from(".ralph/PRD.md"),
            project_root: PathBuf::from("."),
            github: GithubOptions::default(),
        };
        assert!(matches!(make_tracker(&opts), Err(TrackerError::InvalidPrd(_))));
    }

    #[test]
    fn test_deps_satisfied() {
        let settled: HashSet<String> = ["1".to_string(), "2".to_string()].into_iter().collect();
        assert!(deps_satisfied(&["1".to_string()], &settled));
        assert!(deps_satisfied(&[], &settled));
        assert!(!deps_satisfied(&["3".to_string()], &settled));
    }

    #[test]
    fn test_task_status_settled() {
        assert!(TaskStatus::Done.is_settled());
        assert!(TaskStatus::Blocked.is_settled());
        assert!(!TaskStatus::Open.is_settled());
        assert!(!TaskStatus::InProgress.is_settled());
    }
}
