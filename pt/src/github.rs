//! GitHub Issues backend, transported over the `gh` CLI.
//!
//! Open issues filtered by a required label (and an exclude-label list) form
//! the backlog, sorted by `(milestone.number, created_at)`. A `group:<name>`
//! label assigns a parallel group; acceptance criteria are parsed from an
//! `## Acceptance Criteria` section in the issue body. Issue listings are
//! cached on disk for `cache_ttl_seconds`; all writes to GitHub are
//! best-effort and never raise out of the tracker.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;

use log::{debug, warn};
use regex::Regex;
use serde_json::Value;

use crate::{PrdKind, SelectedTask, Tracker, atomic_write};

static GROUP_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^group:(.+)$").unwrap());
static ACCEPTANCE_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*##\s+acceptance\s+criteria\b").unwrap());
static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*#{1,6}\s+\S").unwrap());
static CHECK_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*]\s+(?:\[[ xX]\]\s+)?(.+?)\s*$").unwrap());

const FALLBACK_MILESTONE: i64 = 999_999;

/// GitHub tracker settings, mapped from `[tracker.github]`.
#[derive(Debug, Clone)]
pub struct GithubOptions {
    pub repo: String,
    /// gh_cli|token - both run `gh`; token mode injects `GH_TOKEN` from the
    /// environment variable named by `token_env`.
    pub auth_method: String,
    pub token_env: String,
    pub label_filter: String,
    pub exclude_labels: Vec<String>,
    pub close_on_done: bool,
    pub comment_on_done: bool,
    pub add_labels_on_start: Vec<String>,
    pub add_labels_on_done: Vec<String>,
    pub cache_ttl_seconds: u64,
}

impl Default for GithubOptions {
    fn default() -> Self {
        Self {
            repo: String::new(),
            auth_method: "gh_cli".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
            label_filter: "ready".to_string(),
            exclude_labels: vec!["blocked".to_string()],
            close_on_done: true,
            comment_on_done: true,
            add_labels_on_start: vec!["in-progress".to_string()],
            add_labels_on_done: vec!["completed".to_string()],
            cache_ttl_seconds: 300,
        }
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct IssueCache {
    fetched_at: u64,
    issues: Vec<Value>,
}

fn epoch_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn label_names(issue: &Value) -> Vec<String> {
    match issue.get("labels") {
        Some(Value::Array(labels)) => labels
            .iter()
            .filter_map(|l| match l {
                Value::Object(o) => o.get("name").and_then(Value::as_str).map(str::to_string),
                Value::String(s) => Some(s.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn group_from_labels(labels: &[String]) -> String {
    for label in labels {
        if let Some(caps) = GROUP_LABEL_RE.captures(label) {
            let g = caps[1].trim().to_string();
            if !g.is_empty() {
                return g;
            }
        }
    }
    "default".to_string()
}

/// Extract checkbox/bullet items from the `## Acceptance Criteria` section
/// of an issue body.
fn parse_acceptance(body: &str) -> Vec<String> {
    let mut acceptance = Vec::new();
    let mut in_section = false;
    for line in body.lines() {
        if ACCEPTANCE_HEADING_RE.is_match(line) {
            in_section = true;
            continue;
        }
        if !in_section {
            continue;
        }
        if HEADING_RE.is_match(line) {
            break;
        }
        if let Some(caps) = CHECK_ITEM_RE.captures(line) {
            let item = caps[1].trim().to_string();
            if !item.is_empty() {
                acceptance.push(item);
            }
        }
    }
    acceptance
}

/// Tracker over open GitHub issues.
pub struct GithubTracker {
    project_root: PathBuf,
    opts: GithubOptions,
    cache_path: PathBuf,
}

impl GithubTracker {
    pub fn new(project_root: PathBuf, opts: GithubOptions) -> Self {
        let cache_path = project_root.join(".ralph").join("github_cache.json");
        Self {
            project_root,
            opts,
            cache_path,
        }
    }

    fn gh_api(&self, args: &[&str]) -> Option<Value> {
        let mut cmd = Command::new("gh");
        cmd.arg("api").args(args).current_dir(&self.project_root);
        if self.opts.auth_method == "token" {
            if let Ok(token) = std::env::var(&self.opts.token_env) {
                cmd.env("GH_TOKEN", token);
            }
        }
        let output = cmd.output().ok()?;
        if !output.status.success() {
            debug!(
                "gh api {:?} failed: {}",
                args,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }
        serde_json::from_slice(&output.stdout).ok()
    }

    fn cache_is_fresh(&self) -> bool {
        self.read_cache()
            .map(|c| epoch_now().saturating_sub(c.fetched_at) < self.opts.cache_ttl_seconds)
            .unwrap_or(false)
    }

    fn read_cache(&self) -> Option<IssueCache> {
        let text = fs::read_to_string(&self.cache_path).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn write_cache(&self, issues: Vec<Value>) {
        let cache = IssueCache {
            fetched_at: epoch_now(),
            issues,
        };
        if let Some(parent) = self.cache_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(text) = serde_json::to_string(&cache) {
            if let Err(e) = atomic_write(&self.cache_path, &text) {
                warn!("Failed to write GitHub issue cache: {e}");
            }
        }
    }

    fn invalidate_cache(&self) {
        let _ = fs::remove_file(&self.cache_path);
    }

    /// Fetch open issues when the cache is stale; on fetch failure a stale
    /// cache keeps the loop running offline.
    fn open_issues(&self) -> Vec<Value> {
        if !self.cache_is_fresh() {
            let mut endpoint = format!("repos/{}/issues?state=open&per_page=100", self.opts.repo);
            if !self.opts.label_filter.trim().is_empty() {
                endpoint.push_str(&format!("&labels={}", self.opts.label_filter));
            }
            match self.gh_api(&[&endpoint]) {
                Some(Value::Array(issues)) => {
                    let filtered: Vec<Value> = issues
                        .into_iter()
                        .filter(|issue| {
                            // PRs appear in the issues API; skip them.
                            if issue.get("pull_request").is_some() {
                                return false;
                            }
                            let labels = label_names(issue);
                            !self.opts.exclude_labels.iter().any(|ex| labels.contains(ex))
                        })
                        .collect();
                    self.write_cache(filtered);
                }
                _ => {
                    if self.read_cache().is_none() {
                        warn!("GitHub issue fetch failed and no cache exists");
                    }
                }
            }
        }
        self.read_cache().map(|c| c.issues).unwrap_or_default()
    }

    fn sorted_issues(&self) -> Vec<Value> {
        let mut issues = self.open_issues();
        issues.sort_by_key(|issue| {
            let milestone = issue
                .get("milestone")
                .and_then(|m| m.get("number"))
                .and_then(Value::as_i64)
                .unwrap_or(FALLBACK_MILESTONE);
            let created = issue
                .get("created_at")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            (milestone, created)
        });
        issues
    }

    fn issue_to_task(issue: &Value) -> Option<SelectedTask> {
        let number = issue.get("number")?;
        let id = match number {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            _ => return None,
        };
        let title = issue
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        let body = issue.get("body").and_then(Value::as_str).unwrap_or("");
        let labels = label_names(issue);
        Some(SelectedTask {
            id,
            title,
            kind: PrdKind::Github,
            acceptance: parse_acceptance(body),
            depends_on: Vec::new(),
            group: group_from_labels(&labels),
        })
    }

    fn add_labels(&self, issue_number: &str, labels: &[String]) -> bool {
        if labels.is_empty() {
            return false;
        }
        let endpoint = format!("repos/{}/issues/{}/labels", self.opts.repo, issue_number);
        let mut args: Vec<String> = vec!["-X".to_string(), "POST".to_string(), endpoint];
        for label in labels {
            args.push("-f".to_string());
            args.push(format!("labels[]={label}"));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let ok = self.gh_api(&arg_refs).is_some();
        if ok {
            self.invalidate_cache();
        }
        ok
    }
}

impl Tracker for GithubTracker {
    fn kind(&self) -> PrdKind {
        PrdKind::Github
    }

    fn peek_next_task(&self, exclude_ids: &HashSet<String>) -> Option<SelectedTask> {
        self.sorted_issues()
            .iter()
            .filter_map(Self::issue_to_task)
            .find(|t| !exclude_ids.contains(&t.id))
    }

    fn claim_next_task(&self) -> Option<SelectedTask> {
        let task = self.peek_next_task(&HashSet::new())?;
        // Best-effort: tag the issue so humans see the loop picked it up.
        if !self.opts.add_labels_on_start.is_empty() {
            let labels = self.opts.add_labels_on_start.clone();
            let _ = self.add_labels(&task.id, &labels);
        }
        Some(task)
    }

    /// Only open issues are cached, so done is always 0 and total is the
    /// open-issue count.
    fn counts(&self) -> (usize, usize) {
        (0, self.open_issues().len())
    }

    fn all_done(&self) -> bool {
        self.open_issues().is_empty()
    }

    fn all_blocked(&self) -> bool {
        let issues = self.open_issues();
        if issues.is_empty() {
            return false;
        }
        issues
            .iter()
            .all(|issue| label_names(issue).contains(&"blocked".to_string()))
    }

    /// Closed issues drop out of the open-issue cache, so "not present"
    /// means done.
    fn is_task_done(&self, task_id: &str) -> bool {
        !self.open_issues().iter().any(|issue| {
            issue
                .get("number")
                .map(|n| n.to_string() == task_id)
                .unwrap_or(false)
        })
    }

    /// Reopening a closed issue is a human decision; the engine's safety
    /// valve does not force it.
    fn force_task_open(&self, _task_id: &str) -> bool {
        false
    }

    fn block_task(&self, task_id: &str, _reason: &str) -> bool {
        self.add_labels(task_id, &["blocked".to_string()])
    }

    fn get_parallel_groups(&self) -> BTreeMap<String, Vec<SelectedTask>> {
        let mut groups: BTreeMap<String, Vec<SelectedTask>> = BTreeMap::new();
        for issue in self.sorted_issues() {
            if let Some(task) = Self::issue_to_task(&issue) {
                groups.entry(task.group.clone()).or_default().push(task);
            }
        }
        groups
    }

    fn get_task_by_id(&self, task_id: &str) -> Option<SelectedTask> {
        self.open_issues()
            .iter()
            .find(|issue| {
                issue
                    .get("number")
                    .map(|n| n.to_string() == task_id)
                    .unwrap_or(false)
            })
            .and_then(Self::issue_to_task)
    }
}
