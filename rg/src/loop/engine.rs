//! The iteration engine: one pass of select -> prompt -> invoke -> gates ->
//! judge -> record.
//!
//! An iteration never half-happens: once the agent subprocess starts, the
//! engine always records a log, receipts, and a history entry, whatever the
//! outcome. Contained failures (agent crash, gate failure, tracker write
//! failure) land in the result flags; only not-a-repo, rate-limit, and
//! unknown-agent conditions propagate as errors.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use chrono::Utc;
use eyre::Result;
use prdtrack::{SelectedTask, Tracker, make_tracker};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::adaptive::calculate_adaptive_timeout;
use crate::agents::{AgentKind, build_invocation, get_runner};
use crate::config::Config;
use crate::error::EngineError;
use crate::gates::{GateResult, format_gate_results, run_gates};
use crate::git;
use crate::process::{CommandResult, run_streaming};
use crate::prompt::build_prompt;
use crate::state::{
    BlockedTask, EvidenceReceipt, GateSummary, HistoryEntry, NoFilesWrittenReceipt, PersistentState,
    RunnerReceipt, StateStore, epoch_now, rate_limit_check, receipts_dir, utc_now_iso,
    write_receipt,
};
use crate::state::receipts::RECEIPT_SCHEMA;

static EXIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^EXIT_SIGNAL:\s*(true|false)\s*$").unwrap());
static JUDGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^JUDGE_OK:\s*(true|false)\s*$").unwrap());

/// Result of one iteration, shared by value with the drivers.
#[derive(Debug, Clone)]
pub struct IterationResult {
    pub iteration: u64,
    pub agent: String,
    pub story_id: Option<String>,
    pub task_title: Option<String>,
    /// Effective exit signal after engine overrides.
    pub exit_signal: Option<bool>,
    pub exit_signal_raw: Option<bool>,
    pub return_code: i32,
    pub log_path: Option<PathBuf>,
    pub progress_made: bool,
    pub no_progress_streak: u32,
    pub gates_ok: Option<bool>,
    pub repo_clean: bool,
    pub judge_ok: Option<bool>,
    pub review_ok: Option<bool>,
    pub timed_out: bool,
}

/// Per-call knobs for [`run_iteration`].
#[derive(Debug, Clone, Default)]
pub struct IterationOptions {
    /// Skip tracker selection and work on this task.
    pub task_override: Option<SelectedTask>,
    /// Stop after materializing the prompt: no subprocess, no state writes,
    /// nothing touched outside `.ralph/`.
    pub dry_run: bool,
}

/// Scan combined agent output for the exit-signal line; the last match
/// wins, absence is valid and means in-progress.
pub fn parse_exit_signal(output: &str) -> Option<bool> {
    EXIT_RE
        .captures_iter(output)
        .last()
        .map(|caps| caps[1].eq_ignore_ascii_case("true"))
}

fn parse_judge_verdict(output: &str) -> Option<bool> {
    JUDGE_RE
        .captures_iter(output)
        .last()
        .map(|caps| caps[1].eq_ignore_ascii_case("true"))
}

fn should_forward_output(config: &Config) -> bool {
    config.output.format != "json" && config.output.verbosity == "verbose"
}

/// Working-tree diff against HEAD, clipped for judge/review prompts.
async fn clipped_diff(project_root: &Path, max_chars: usize) -> String {
    let argv: Vec<String> = ["git", "diff", "HEAD"].iter().map(|s| s.to_string()).collect();
    let diff = match crate::process::run_command(&argv, project_root, None).await {
        Ok(result) => result.stdout,
        Err(_) => String::new(),
    };
    if diff.len() > max_chars {
        let mut clipped: String = diff.chars().take(max_chars).collect();
        clipped.push_str("\n... [diff truncated]\n");
        clipped
    } else {
        diff
    }
}

async fn run_verdict_agent(
    project_root: &Path,
    config: &Config,
    agent: &str,
    prompt_text: String,
    timeout: Duration,
) -> Option<CommandResult> {
    let runner = match get_runner(config, agent) {
        Ok(runner) => runner,
        Err(e) => {
            warn!(error = %e, "verdict agent unavailable");
            return None;
        }
    };
    let invocation = build_invocation(&AgentKind::from_name(agent), &prompt_text, runner);
    match run_streaming(&invocation.argv, project_root, Some(timeout), invocation.stdin, false).await
    {
        Ok(result) => Some(result),
        Err(e) => {
            warn!(error = %e, "verdict agent failed to start");
            None
        }
    }
}

/// LLM judge: the judge prompt file plus the clipped working diff, verdict
/// parsed from a `JUDGE_OK: true|false` line. A missing or unparsable
/// verdict counts as a fail - silence is not approval.
async fn run_llm_judge(project_root: &Path, config: &Config, timeout: Duration) -> Option<bool> {
    let judge = &config.gates.llm_judge;
    let diff = clipped_diff(project_root, judge.max_diff_chars).await;
    let instructions = std::fs::read_to_string(project_root.join(&judge.prompt))
        .unwrap_or_else(|_| "Judge whether this change is correct and complete.".to_string());
    let prompt_text = format!(
        "{instructions}\n\n--- DIFF ---\n{diff}\n--- END DIFF ---\n\nAt the very end of your output, print exactly one line:\nJUDGE_OK: true|false\n"
    );
    let result = run_verdict_agent(project_root, config, &judge.agent, prompt_text, timeout).await?;
    Some(parse_judge_verdict(&result.combined_output()).unwrap_or(false))
}

/// Review gate: passes iff the reviewer's output contains the required
/// token (default SHIP).
async fn run_review(project_root: &Path, config: &Config, timeout: Duration) -> Option<bool> {
    let review = &config.gates.review;
    if review.backend == "repoprompt" {
        warn!("review.backend=repoprompt is not supported; using the runner backend");
    }
    let diff = clipped_diff(project_root, review.max_diff_chars).await;
    let instructions = std::fs::read_to_string(project_root.join(&review.prompt))
        .unwrap_or_else(|_| "Review this change.".to_string());
    let prompt_text = format!(
        "{instructions}\n\n--- DIFF ---\n{diff}\n--- END DIFF ---\n\nReply with the single word {token} if and only if the change should ship.\n",
        token = review.required_token
    );
    let result = run_verdict_agent(project_root, config, &review.agent, prompt_text, timeout).await?;
    Some(result.combined_output().contains(&review.required_token))
}

fn select_task(
    tracker: Option<&dyn Tracker>,
    state: &PersistentState,
    skip_blocked: bool,
) -> Option<SelectedTask> {
    let tracker = tracker?;
    if skip_blocked && !state.blocked_tasks.is_empty() {
        let exclude: HashSet<String> = state.blocked_tasks.keys().cloned().collect();
        tracker.peek_next_task(&exclude)
    } else {
        tracker.claim_next_task()
    }
}

#[allow(clippy::too_many_arguments)]
fn write_iteration_log(
    log_path: &Path,
    ts: &str,
    iteration: u64,
    agent: &str,
    story_id: Option<&str>,
    argv: &[String],
    agent_result: &CommandResult,
    duration_seconds: f64,
    repo_clean: bool,
    exit_signal_raw: Option<bool>,
    exit_signal: Option<bool>,
    gates_ok: Option<bool>,
    gate_results: &[GateResult],
    config: &Config,
) {
    let argv_json = serde_json::to_string(argv).unwrap_or_default();
    let content = format!(
        "# ralph-gold log\n\
         timestamp_utc: {ts}\n\
         iteration: {iteration}\n\
         agent: {agent}\n\
         story_id: {story}\n\
         cmd: {argv_json}\n\
         duration_seconds: {duration_seconds:.2}\n\
         return_code: {rc}\n\
         timed_out: {timed_out}\n\
         repo_clean: {repo_clean}\n\
         exit_signal_raw: {raw:?}\n\
         exit_signal_effective: {eff:?}\n\
         \n--- stdout ---\n{stdout}\n\
         \n--- stderr ---\n{stderr}\n\
         \n--- gates ---\n{gates}",
        story = story_id.unwrap_or("None"),
        rc = agent_result.return_code,
        timed_out = agent_result.timed_out,
        raw = exit_signal_raw,
        eff = exit_signal,
        stdout = agent_result.stdout,
        stderr = agent_result.stderr,
        gates = format_gate_results(gates_ok, gate_results, &config.gates),
    );
    if let Err(e) = std::fs::write(log_path, content) {
        warn!(path = %log_path.display(), error = %e, "failed to write iteration log");
    }
}

/// Run one iteration against `project_root` (the repo root or a worktree).
pub async fn run_iteration(
    project_root: &Path,
    agent: &str,
    config: &Config,
    iteration: u64,
    opts: IterationOptions,
) -> Result<IterationResult> {
    git::ensure_git_repo(project_root).await?;

    let state_dir = project_root.join(".ralph");
    let logs_dir = state_dir.join("logs");
    std::fs::create_dir_all(&logs_dir)?;

    let settings = config.loop_.effective();
    let store = StateStore::for_root(project_root);
    let mut state = store.load();

    let (ok, wait_seconds) = rate_limit_check(&mut state, settings.rate_limit_per_hour, epoch_now());
    if !ok {
        return Err(EngineError::RateLimitExceeded {
            limit: settings.rate_limit_per_hour,
            wait_seconds,
        }
        .into());
    }

    let tracker = match make_tracker(&config.tracker_options(project_root)) {
        Ok(tracker) => Some(tracker),
        Err(e) => {
            warn!(error = %e, "tracker unavailable; running without task selection");
            None
        }
    };

    let task = opts
        .task_override
        .clone()
        .or_else(|| select_task(tracker.as_deref(), &state, settings.skip_blocked_tasks));
    let story_id = task.as_ref().map(|t| t.id.clone());
    let task_title = task.as_ref().map(|t| t.title.clone());
    debug!(iteration, task = ?story_id, "selected task");

    // Materialize the prompt for debugging / reproducibility.
    let prompt_text = build_prompt(config, task.as_ref(), iteration);
    let prompt_path = state_dir.join(format!("prompt-iter{iteration:04}.txt"));
    std::fs::write(&prompt_path, &prompt_text)?;

    if opts.dry_run {
        info!(iteration, "dry run: prompt written, agent not invoked");
        return Ok(IterationResult {
            iteration,
            agent: agent.to_string(),
            story_id,
            task_title,
            exit_signal: None,
            exit_signal_raw: None,
            return_code: 0,
            log_path: None,
            progress_made: false,
            no_progress_streak: state.no_progress_streak,
            gates_ok: None,
            repo_clean: true,
            judge_ok: None,
            review_ok: None,
            timed_out: false,
        });
    }

    let runner = get_runner(config, agent)?;
    let invocation = build_invocation(&AgentKind::from_name(agent), &prompt_text, runner);

    let head_before = git::head(project_root).await?;

    let timeout_seconds = match task.as_ref() {
        Some(task) => calculate_adaptive_timeout(
            task,
            state.attempts_for(&task.id),
            &config.adaptive_timeout,
            Some(settings.runner_timeout_seconds),
        ),
        None => settings.runner_timeout_seconds,
    };

    let started_at = utc_now_iso();
    let start = Instant::now();
    let agent_result = run_streaming(
        &invocation.argv,
        project_root,
        Some(Duration::from_secs(timeout_seconds)),
        invocation.stdin.clone(),
        should_forward_output(config),
    )
    .await?;
    let duration_seconds = start.elapsed().as_secs_f64();
    let ended_at = utc_now_iso();
    info!(
        iteration,
        rc = agent_result.return_code,
        timed_out = agent_result.timed_out,
        "agent finished"
    );

    // Gates, plus the prek pre-commit runner when enabled.
    let (mut gates_ok, mut gate_results) = if config.gates.commands.is_empty() {
        (None, Vec::new())
    } else {
        let (ok, results) = run_gates(project_root, &config.gates.commands, None).await;
        (Some(ok), results)
    };
    if config.gates.prek.enabled && !config.gates.prek.argv.is_empty() {
        let result = crate::gates::run_argv_gate(project_root, &config.gates.prek.argv).await;
        gates_ok = Some(gates_ok.unwrap_or(true) && result.passed());
        gate_results.push(result);
    }

    // Safety valve: if gates fail, undo any PRD completion the agent
    // applied this iteration.
    if gates_ok == Some(false) {
        if let (Some(tracker), Some(id)) = (tracker.as_deref(), story_id.as_deref()) {
            if tracker.force_task_open(id) {
                info!(task = id, "gates failed; task reopened");
            }
        }
    }

    let head_after = git::head(project_root).await?;
    let repo_clean = git::is_clean(project_root).await.unwrap_or(false);
    let progress_made = head_after != head_before || !repo_clean;

    let combined = agent_result.combined_output();
    let exit_signal_raw = parse_exit_signal(&combined);
    let mut exit_signal = exit_signal_raw;

    // Judge/review verify only what the gates did not already reject.
    let verdict_timeout = Duration::from_secs(settings.runner_timeout_seconds);
    let judge_ok = if config.gates.llm_judge.enabled && gates_ok != Some(false) {
        run_llm_judge(project_root, config, verdict_timeout).await
    } else {
        None
    };
    let review_ok = if config.gates.review.enabled && gates_ok != Some(false) {
        run_review(project_root, config, verdict_timeout).await
    } else {
        None
    };

    // Engine overrides: completion may only be claimed when every
    // invariant holds.
    if exit_signal == Some(true)
        && (!repo_clean
            || gates_ok == Some(false)
            || judge_ok == Some(false)
            || review_ok == Some(false))
    {
        exit_signal = Some(false);
    }
    if agent_result.timed_out {
        exit_signal = Some(false);
    }

    // Log + receipts.
    let ts = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let log_path = logs_dir.join(format!("{ts}-iter{iteration:04}-{agent}.log"));
    write_iteration_log(
        &log_path,
        &ts,
        iteration,
        agent,
        story_id.as_deref(),
        &invocation.argv,
        &agent_result,
        duration_seconds,
        repo_clean,
        exit_signal_raw,
        exit_signal,
        gates_ok,
        &gate_results,
        config,
    );

    let receipts = receipts_dir(project_root, iteration);
    let runner_receipt = RunnerReceipt {
        schema: RECEIPT_SCHEMA,
        name: agent.to_string(),
        argv: invocation.argv.clone(),
        returncode: agent_result.return_code,
        started_at: started_at.clone(),
        ended_at: ended_at.clone(),
        duration_seconds,
        timed_out: agent_result.timed_out,
    };
    if let Err(e) = write_receipt(&receipts.join("runner.json"), &runner_receipt) {
        warn!(error = %e, "failed to write runner receipt");
    }
    if let Err(e) = write_receipt(&receipts.join("evidence.json"), &EvidenceReceipt::from_output(&combined))
    {
        warn!(error = %e, "failed to write evidence receipt");
    }
    let changed = git::changed_user_files(project_root).await;
    if changed.is_empty() && head_after == head_before {
        let receipt = NoFilesWrittenReceipt::new(
            story_id.clone().unwrap_or_default(),
            iteration,
            started_at,
            ended_at,
            duration_seconds,
            agent_result.return_code,
        );
        if let Err(e) = write_receipt(&receipts.join("no_files_written.json"), &receipt) {
            warn!(error = %e, "failed to write no-files receipt");
        }
    }

    // State update.
    state.record_invocation(epoch_now());
    if progress_made {
        state.no_progress_streak = 0;
    } else {
        state.no_progress_streak += 1;
    }
    state.push_history(HistoryEntry {
        ts: ts.clone(),
        iteration,
        agent: agent.to_string(),
        story_id: story_id.clone(),
        duration_seconds: (duration_seconds * 100.0).round() / 100.0,
        return_code: agent_result.return_code,
        exit_signal_raw,
        exit_signal_effective: exit_signal,
        repo_clean,
        gates_ok,
        judge_ok,
        review_ok,
        timed_out: agent_result.timed_out,
        gate_results: gate_results
            .iter()
            .map(|r| GateSummary {
                cmd: r.cmd.clone(),
                return_code: r.return_code,
                duration_seconds: (r.duration_seconds * 100.0).round() / 100.0,
            })
            .collect(),
        log: log_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
    });

    // Attempts and attempt-limit blocking.
    if let Some(id) = story_id.as_deref() {
        let count = state.bump_attempts(id);
        let became_done = tracker
            .as_deref()
            .map(|t| t.is_task_done(id))
            .unwrap_or(false);
        if count >= settings.max_attempts_per_task && !became_done {
            let reason = format!("attempt limit reached ({count} attempts)");
            if let Some(tracker) = tracker.as_deref() {
                tracker.block_task(id, &reason);
            }
            state.blocked_tasks.insert(
                id.to_string(),
                BlockedTask {
                    blocked_at: utc_now_iso(),
                    reason,
                },
            );
            warn!(task = id, attempts = count, "task blocked at attempt limit");
        }
    }

    let no_progress_streak = state.no_progress_streak;
    store.save(&state)?;

    Ok(IterationResult {
        iteration,
        agent: agent.to_string(),
        story_id,
        task_title,
        exit_signal,
        exit_signal_raw,
        return_code: agent_result.return_code,
        log_path: Some(log_path),
        progress_made,
        no_progress_streak,
        gates_ok,
        repo_clean,
        judge_ok,
        review_ok,
        timed_out: agent_result.timed_out,
    })
}
