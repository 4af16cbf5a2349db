//! Ralph Gold configuration types and loading.
//!
//! Configuration is layered: `.ralph/ralph.toml`, then `./ralph.toml`, then
//! an optional `$RALPH_CONFIG` override. Later layers deep-merge over
//! earlier ones key by key before deserialization, so a user file only has
//! to name the fields it changes. Loading is total over missing files; it
//! fails only on unparsable TOML or invalid values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub const LOOP_MODES: [&str; 3] = ["speed", "quality", "exploration"];

/// Per-mode overrides of `loop.*` fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopModeConfig {
    pub max_iterations: Option<u32>,
    pub no_progress_limit: Option<u32>,
    pub rate_limit_per_hour: Option<u32>,
    pub sleep_seconds_between_iters: Option<u64>,
    pub runner_timeout_seconds: Option<u64>,
    pub max_attempts_per_task: Option<u32>,
    pub skip_blocked_tasks: Option<bool>,
}

/// Loop parameters with the active mode's overrides applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSettings {
    pub max_iterations: u32,
    pub no_progress_limit: u32,
    pub rate_limit_per_hour: u32,
    pub sleep_seconds_between_iters: u64,
    pub runner_timeout_seconds: u64,
    pub max_attempts_per_task: u32,
    pub skip_blocked_tasks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub max_iterations: u32,
    pub no_progress_limit: u32,
    /// 0 = disabled
    pub rate_limit_per_hour: u32,
    pub sleep_seconds_between_iters: u64,
    /// 15m default; some agents are slow
    pub runner_timeout_seconds: u64,
    pub max_attempts_per_task: u32,
    pub skip_blocked_tasks: bool,
    /// speed|quality|exploration
    pub mode: String,
    pub modes: BTreeMap<String, LoopModeConfig>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            no_progress_limit: 3,
            rate_limit_per_hour: 0,
            sleep_seconds_between_iters: 0,
            runner_timeout_seconds: 900,
            max_attempts_per_task: 3,
            skip_blocked_tasks: true,
            mode: "speed".to_string(),
            modes: BTreeMap::new(),
        }
    }
}

impl LoopConfig {
    /// Resolve the active mode's overlay onto the base fields.
    pub fn effective(&self) -> LoopSettings {
        let overlay = self.modes.get(&self.mode).cloned().unwrap_or_default();
        LoopSettings {
            max_iterations: overlay.max_iterations.unwrap_or(self.max_iterations),
            no_progress_limit: overlay.no_progress_limit.unwrap_or(self.no_progress_limit),
            rate_limit_per_hour: overlay.rate_limit_per_hour.unwrap_or(self.rate_limit_per_hour),
            sleep_seconds_between_iters: overlay
                .sleep_seconds_between_iters
                .unwrap_or(self.sleep_seconds_between_iters),
            runner_timeout_seconds: overlay
                .runner_timeout_seconds
                .unwrap_or(self.runner_timeout_seconds),
            max_attempts_per_task: overlay
                .max_attempts_per_task
                .unwrap_or(self.max_attempts_per_task),
            skip_blocked_tasks: overlay.skip_blocked_tasks.unwrap_or(self.skip_blocked_tasks),
        }
    }
}

/// Durable agent-memory file locations. All defaults keep Ralph state under
/// `.ralph/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub prd: String,
    pub progress: String,
    pub prompt: String,
    pub plan: String,
    pub judge: String,
    pub review: String,
    pub agents: String,
    pub specs_dir: String,
    pub feedback: String,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            prd: ".ralph/PRD.md".to_string(),
            progress: ".ralph/progress.md".to_string(),
            prompt: ".ralph/PROMPT_build.md".to_string(),
            plan: ".ralph/PROMPT_plan.md".to_string(),
            judge: ".ralph/PROMPT_judge.md".to_string(),
            review: ".ralph/PROMPT_review.md".to_string(),
            agents: ".ralph/AGENTS.md".to_string(),
            specs_dir: ".ralph/specs".to_string(),
            feedback: ".ralph/FEEDBACK.md".to_string(),
        }
    }
}

/// Ordered argv template for one agent. A literal `{prompt}` token is
/// replaced with the prompt text at that position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmJudgeConfig {
    pub enabled: bool,
    pub agent: String,
    pub prompt: String,
    pub max_diff_chars: usize,
}

impl Default for LlmJudgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            agent: "claude".to_string(),
            prompt: ".ralph/PROMPT_judge.md".to_string(),
            max_diff_chars: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub enabled: bool,
    /// runner|repoprompt (repoprompt degrades to runner)
    pub backend: String,
    pub agent: String,
    pub prompt: String,
    pub max_diff_chars: usize,
    pub required_token: String,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: "runner".to_string(),
            agent: "claude".to_string(),
            prompt: ".ralph/PROMPT_review.md".to_string(),
            max_diff_chars: 30_000,
            required_token: "SHIP".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrekConfig {
    pub enabled: bool,
    pub argv: Vec<String>,
}

impl Default for PrekConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            argv: vec!["prek".to_string(), "run".to_string(), "--all-files".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatesConfig {
    pub commands: Vec<String>,
    pub llm_judge: LlmJudgeConfig,
    pub review: ReviewConfig,
    pub prek: PrekConfig,
    pub precommit_hook: bool,
    pub fail_fast: bool,
    /// full|summary|errors_only
    pub output_mode: String,
    pub max_output_lines: usize,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            llm_judge: LlmJudgeConfig::default(),
            review: ReviewConfig::default(),
            prek: PrekConfig::default(),
            precommit_hook: false,
            fail_fast: true,
            output_mode: "summary".to_string(),
            max_output_lines: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// none|per_prd|task
    pub branch_strategy: String,
    /// empty => current HEAD
    pub base_branch: String,
    pub branch_prefix: String,
    pub auto_commit: bool,
    pub commit_message_template: String,
    pub amend_if_needed: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            branch_strategy: "none".to_string(),
            base_branch: String::new(),
            branch_prefix: "ralph/".to_string(),
            auto_commit: false,
            commit_message_template: "ralph: {story_id} {title}".to_string(),
            amend_if_needed: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubTrackerConfig {
    pub repo: String,
    /// gh_cli|token
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

impl Default for GithubTrackerConfig {
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

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// auto|markdown|json|yaml|beads|github_issues
    pub kind: String,
    pub github: GithubTrackerConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            kind: "auto".to_string(),
            github: GithubTrackerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub enabled: bool,
    pub max_workers: u32,
    pub worktree_root: String,
    /// queue|group
    pub strategy: String,
    /// manual|auto_merge (auto_merge degrades to manual)
    pub merge_policy: String,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_workers: 3,
            worktree_root: ".ralph/worktrees".to_string(),
            strategy: "queue".to_string(),
            merge_policy: "manual".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub enabled: bool,
    pub patterns: Vec<String>,
    pub debounce_ms: u64,
    pub auto_commit: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            patterns: vec!["**/*.py".to_string(), "**/*.md".to_string()],
            debounce_ms: 500,
            auto_commit: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveTimeoutConfig {
    pub enabled: bool,
    /// Base timeout when the loop mode supplies none.
    pub default_mode_timeout: u64,
    pub min_timeout: u64,
    pub max_timeout: u64,
    pub enable_complexity_scaling: bool,
    pub enable_failure_scaling: bool,
    pub timeout_multiplier_per_failure: f64,
}

impl Default for AdaptiveTimeoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_mode_timeout: 900,
            min_timeout: 60,
            max_timeout: 3600,
            enable_complexity_scaling: true,
            enable_failure_scaling: true,
            timeout_multiplier_per_failure: 1.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputControlConfig {
    /// quiet|normal|verbose
    pub verbosity: String,
    /// text|json
    pub format: String,
}

impl Default for OutputControlConfig {
    fn default() -> Self {
        Self {
            verbosity: "normal".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    /// auto|macos|linux|windows|command|none
    pub backend: String,
    /// Subset of complete|stopped|error; empty = all.
    pub events: Vec<String>,
    pub command_argv: Vec<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: "auto".to_string(),
            events: Vec::new(),
            command_argv: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub heartbeat_seconds: u64,
    /// 0 = unlimited
    pub max_runtime_seconds: u64,
    pub sleep_seconds_between_runs: u64,
    /// stop|continue
    pub on_no_progress_limit: String,
    /// wait|stop
    pub on_rate_limit: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_seconds: 30,
            max_runtime_seconds: 0,
            sleep_seconds_between_runs: 0,
            on_no_progress_limit: "stop".to_string(),
            on_rate_limit: "wait".to_string(),
        }
    }
}

/// Full configuration, immutable after load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "loop")]
    pub loop_: LoopConfig,
    pub files: FilesConfig,
    pub runners: BTreeMap<String, RunnerConfig>,
    pub gates: GatesConfig,
    pub git: GitConfig,
    pub tracker: TrackerConfig,
    pub parallel: ParallelConfig,
    pub watch: WatchConfig,
    pub adaptive_timeout: AdaptiveTimeoutConfig,
    pub output: OutputControlConfig,
    pub notify: NotifyConfig,
    pub supervisor: SupervisorConfig,
}

impl Config {
    /// Map tracker settings onto the prdtrack factory options.
    pub fn tracker_options(&self, project_root: &Path) -> prdtrack::TrackerOptions {
        let prd_path = project_root.join(&self.files.prd);
        let g = &self.tracker.github;
        prdtrack::TrackerOptions {
            kind: self.tracker.kind.clone(),
            prd_path,
            project_root: project_root.to_path_buf(),
            github: prdtrack::GithubOptions {
                repo: g.repo.clone(),
                auth_method: g.auth_method.clone(),
                token_env: g.token_env.clone(),
                label_filter: g.label_filter.clone(),
                exclude_labels: g.exclude_labels.clone(),
                close_on_done: g.close_on_done,
                comment_on_done: g.comment_on_done,
                add_labels_on_start: g.add_labels_on_start.clone(),
                add_labels_on_done: g.add_labels_on_done.clone(),
                cache_ttl_seconds: g.cache_ttl_seconds,
            },
        }
    }
}

/// Merge `b` into `a` (recursively for tables); `b` wins for scalars and
/// arrays.
pub fn deep_merge(a: toml::Value, b: toml::Value) -> toml::Value {
    match (a, b) {
        (toml::Value::Table(mut at), toml::Value::Table(bt)) => {
            for (key, bv) in bt {
                let merged = match at.remove(&key) {
                    Some(av) => deep_merge(av, bv),
                    None => bv,
                };
                at.insert(key, merged);
            }
            toml::Value::Table(at)
        }
        (_, b) => b,
    }
}

fn layer_paths(project_root: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let p1 = project_root.join(".ralph").join("ralph.toml");
    if p1.exists() {
        paths.push(p1);
    }
    let p2 = project_root.join("ralph.toml");
    if p2.exists() {
        paths.push(p2);
    }
    if let Ok(env) = std::env::var("RALPH_CONFIG") {
        if !env.trim().is_empty() {
            let mut p3 = PathBuf::from(&env);
            if !p3.is_absolute() {
                p3 = project_root.join(p3);
            }
            if p3.exists() {
                paths.push(p3);
            }
        }
    }
    paths
}

fn validate_enum(section: &str, value: &str, allowed: &[&str]) -> Result<(), EngineError> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(EngineError::Config(format!(
            "Invalid {section}: {value:?}. Must be one of: {}.",
            allowed.join(", ")
        )))
    }
}

fn validate(config: &Config) -> Result<(), EngineError> {
    validate_enum("loop.mode", &config.loop_.mode, &LOOP_MODES)?;
    for name in config.loop_.modes.keys() {
        validate_enum("loop mode", name, &LOOP_MODES)?;
    }
    validate_enum("parallel.strategy", &config.parallel.strategy, &["queue", "group"])?;
    validate_enum(
        "parallel.merge_policy",
        &config.parallel.merge_policy,
        &["manual", "auto_merge"],
    )?;
    if config.parallel.max_workers < 1 {
        return Err(EngineError::Config(format!(
            "Invalid parallel.max_workers: {}. Must be >= 1.",
            config.parallel.max_workers
        )));
    }
    validate_enum(
        "output.verbosity",
        &config.output.verbosity,
        &["quiet", "normal", "verbose"],
    )?;
    validate_enum("output.format", &config.output.format, &["text", "json"])?;
    validate_enum(
        "gates.output_mode",
        &config.gates.output_mode,
        &["full", "summary", "errors_only"],
    )?;
    validate_enum(
        "git.branch_strategy",
        &config.git.branch_strategy,
        &["none", "per_prd", "task"],
    )?;
    validate_enum(
        "gates.review.backend",
        &config.gates.review.backend,
        &["runner", "repoprompt"],
    )?;
    validate_enum(
        "supervisor.on_no_progress_limit",
        &config.supervisor.on_no_progress_limit,
        &["stop", "continue"],
    )?;
    validate_enum(
        "supervisor.on_rate_limit",
        &config.supervisor.on_rate_limit,
        &["wait", "stop"],
    )?;
    Ok(())
}

/// Return the first existing path among `[preferred] + candidates`, else
/// `preferred`. Keeps stale filenames from crashing downstream components.
fn resolve_existing(project_root: &Path, preferred: &str, candidates: &[&str]) -> String {
    if !preferred.is_empty() && project_root.join(preferred).exists() {
        return preferred.to_string();
    }
    for candidate in candidates {
        if project_root.join(candidate).exists() {
            return candidate.to_string();
        }
    }
    preferred.to_string()
}

fn resolve_files(project_root: &Path, files: FilesConfig) -> FilesConfig {
    FilesConfig {
        prd: resolve_existing(
            project_root,
            &files.prd,
            &[".ralph/PRD.md", ".ralph/prd.json", ".ralph/tasks.yaml", "PRD.md", "prd.json"],
        ),
        progress: resolve_existing(project_root, &files.progress, &[".ralph/progress.md", "progress.md"]),
        prompt: resolve_existing(
            project_root,
            &files.prompt,
            &[".ralph/PROMPT_build.md", ".ralph/PROMPT.md", "PROMPT_build.md", "PROMPT.md"],
        ),
        plan: resolve_existing(project_root, &files.plan, &[".ralph/PROMPT_plan.md", "PROMPT_plan.md"]),
        judge: resolve_existing(project_root, &files.judge, &[".ralph/PROMPT_judge.md", "PROMPT_judge.md"]),
        review: resolve_existing(
            project_root,
            &files.review,
            &[".ralph/PROMPT_review.md", "PROMPT_review.md"],
        ),
        agents: resolve_existing(project_root, &files.agents, &[".ralph/AGENTS.md", "AGENTS.md"]),
        specs_dir: resolve_existing(project_root, &files.specs_dir, &[".ralph/specs", "specs"]),
        feedback: resolve_existing(project_root, &files.feedback, &[".ralph/FEEDBACK.md", "FEEDBACK.md"]),
    }
}

fn default_runners() -> BTreeMap<String, RunnerConfig> {
    let mut runners = BTreeMap::new();
    // Codex expects the prompt positionally or on stdin; '-' avoids argv
    // quoting and length issues for long prompts.
    runners.insert(
        "codex".to_string(),
        RunnerConfig {
            argv: vec!["codex".into(), "exec".into(), "--full-auto".into(), "-".into()],
        },
    );
    runners.insert(
        "claude".to_string(),
        RunnerConfig {
            argv: vec!["claude".into(), "--output-format".into(), "stream-json".into(), "-p".into()],
        },
    );
    runners.insert(
        "copilot".to_string(),
        RunnerConfig {
            argv: vec![
                "gh".into(),
                "copilot".into(),
                "suggest".into(),
                "--type".into(),
                "shell".into(),
                "--prompt".into(),
            ],
        },
    );
    runners
}

/// Load and normalize configuration for a project root.
pub fn load_config(project_root: &Path) -> Result<Config> {
    let mut merged = toml::Value::Table(toml::map::Map::new());
    for path in layer_paths(project_root) {
        let text = std::fs::read_to_string(&path)
            .context(format!("Failed to read config file {}", path.display()))?;
        let layer: toml::Value = text
            .parse()
            .context(format!("Failed to parse config file {}", path.display()))?;
        merged = deep_merge(merged, layer);
        tracing::debug!(path = %path.display(), "merged config layer");
    }

    let mut config: Config = merged
        .try_into()
        .map_err(|e| EngineError::Config(e.to_string()))?;

    config.loop_.mode = config.loop_.mode.trim().to_lowercase();
    validate(&config)?;

    // User runners override defaults; unmentioned defaults stay available.
    let mut runners = default_runners();
    runners.append(&mut config.runners);
    config.runners = runners;

    config.files = resolve_files(project_root, config.files);

    Ok(config)
}
