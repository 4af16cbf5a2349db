//! Long-running supervisor loop.
//!
//! Layers onto the iteration engine: a periodic heartbeat line, a wall-time
//! budget, rate-limit wait-or-stop policy, a no-progress stop-or-continue
//! policy, all-blocked detection, and best-effort notifications on
//! completion, stop, and error.

use std::path::Path;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::Config;
use crate::r#loop::{IterationOptions, IterationResult, run_iteration};
use crate::notify::{Notifier, default_title};
use crate::output::{Level, print_output};
use crate::state::{StateStore, epoch_now, rate_limit_check};

/// Terminal outcome of a supervise run. Exit codes: 0 complete, 1 stopped
/// (rate_limit, no_progress, max_runtime, all_blocked), 2 error.
#[derive(Debug, Clone)]
pub struct SuperviseResult {
    pub exit_code: i32,
    pub reason: String,
    pub iterations_run: u32,
    pub duration_seconds: f64,
    pub last_iteration: Option<u64>,
    pub last_story_id: Option<String>,
    pub last_task_title: Option<String>,
    pub last_log_path: Option<String>,
}

impl SuperviseResult {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "cmd": "supervise",
            "exit_code": self.exit_code,
            "reason": self.reason,
            "iterations_run": self.iterations_run,
            "duration_seconds": (self.duration_seconds * 100.0).round() / 100.0,
            "last_iteration": self.last_iteration,
            "last_story_id": self.last_story_id,
            "last_task_title": self.last_task_title,
            "last_log_path": self.last_log_path,
        })
    }
}

fn format_last(result: Option<&IterationResult>) -> String {
    match result {
        None => "(no iterations yet)".to_string(),
        Some(r) => format!(
            "last: iter={} task={} rc={} exit={:?} gates={:?} judge={:?} review={:?} no_prog={}",
            r.iteration,
            r.story_id.as_deref().unwrap_or("-"),
            r.return_code,
            r.exit_signal,
            r.gates_ok,
            r.judge_ok,
            r.review_ok,
            r.no_progress_streak,
        ),
    }
}

struct Supervisor<'a> {
    project_root: &'a Path,
    agent: &'a str,
    config: &'a Config,
    notifier: Notifier,
    title: String,
    started: Instant,
    iterations_run: u32,
    last: Option<IterationResult>,
}

impl<'a> Supervisor<'a> {
    fn finish(&self, exit_code: i32, reason: &str) -> SuperviseResult {
        SuperviseResult {
            exit_code,
            reason: reason.to_string(),
            iterations_run: self.iterations_run,
            duration_seconds: self.started.elapsed().as_secs_f64(),
            last_iteration: self.last.as_ref().map(|r| r.iteration),
            last_story_id: self.last.as_ref().and_then(|r| r.story_id.clone()),
            last_task_title: self.last.as_ref().and_then(|r| r.task_title.clone()),
            last_log_path: self
                .last
                .as_ref()
                .and_then(|r| r.log_path.as_ref())
                .map(|p| p.display().to_string()),
        }
    }

    async fn stop(&self, reason: &str, message: String) -> SuperviseResult {
        self.notifier.notify_event("stopped", &self.title, &message).await;
        self.finish(1, reason)
    }

    fn heartbeat(&self) {
        let (done, total) = prdtrack::make_tracker(&self.config.tracker_options(self.project_root))
            .map(|t| t.counts())
            .unwrap_or((0, 0));
        print_output(
            &format!("supervise: {done}/{total} done • {}", format_last(self.last.as_ref())),
            Level::Normal,
        );
    }
}

/// Run the supervisor until a stop condition fires.
pub async fn run_supervisor(project_root: &Path, agent: &str, config: &Config) -> SuperviseResult {
    let settings = config.loop_.effective();
    let policy = &config.supervisor;
    let store = StateStore::for_root(project_root);

    // Reset the streak at supervisor start for predictability.
    let mut state = store.load();
    state.no_progress_streak = 0;
    let _ = store.save(&state);

    let repo_name = project_root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut sup = Supervisor {
        project_root,
        agent,
        config,
        notifier: Notifier::new(config.notify.clone()),
        title: default_title(&repo_name),
        started: Instant::now(),
        iterations_run: 0,
        last: None,
    };

    let mut next_heartbeat = sup.started;

    loop {
        let now = Instant::now();

        if policy.heartbeat_seconds > 0 && now >= next_heartbeat {
            sup.heartbeat();
            next_heartbeat = now + Duration::from_secs(policy.heartbeat_seconds);
        }

        if policy.max_runtime_seconds > 0
            && sup.started.elapsed() >= Duration::from_secs(policy.max_runtime_seconds)
        {
            let message = format!("Stopped (max runtime reached). {}", format_last(sup.last.as_ref()));
            return sup.stop("max_runtime", message).await;
        }

        // Rate limit: pre-check so run_iteration does not have to raise.
        let mut state = store.load();
        let (ok, wait_seconds) =
            rate_limit_check(&mut state, settings.rate_limit_per_hour, epoch_now());
        if !ok {
            if policy.on_rate_limit == "wait" {
                let wait = wait_seconds.max(1);
                print_output(
                    &format!(
                        "Rate limit reached ({}/hour). Waiting ~{wait}s…",
                        settings.rate_limit_per_hour
                    ),
                    Level::Normal,
                );
                tokio::time::sleep(Duration::from_secs(wait)).await;
                continue;
            }
            let message = format!("Stopped (rate limit). {}", format_last(sup.last.as_ref()));
            return sup.stop("rate_limit", message).await;
        }

        // One iteration.
        let iteration = store.next_iteration_number();
        match run_iteration(project_root, sup.agent, config, iteration, IterationOptions::default())
            .await
        {
            Ok(result) => {
                sup.iterations_run += 1;
                sup.last = Some(result);
            }
            Err(e) => {
                warn!(error = %e, "iteration failed; supervisor stopping");
                sup.notifier
                    .notify_event("error", &sup.title, &format!("Error: {e}"))
                    .await;
                return sup.finish(2, "error");
            }
        }

        let last = sup.last.as_ref().expect("iteration just recorded");
        let tracker = prdtrack::make_tracker(&config.tracker_options(project_root)).ok();
        let done = tracker.as_deref().map(|t| t.all_done()).unwrap_or(false);
        let all_blocked = tracker.as_deref().map(|t| t.all_blocked()).unwrap_or(false);

        // Completion: backlog done (or an empty selection that exited
        // cleanly) plus an explicit exit signal.
        let empty_clean_exit = last.story_id.is_none() && last.return_code == 0;
        if (done || empty_clean_exit) && last.exit_signal == Some(true) {
            info!("supervisor: complete");
            let message = format!("Complete. {}", format_last(Some(last)));
            sup.notifier.notify_event("complete", &sup.title, &message).await;
            return sup.finish(0, "complete");
        }

        if all_blocked || (last.story_id.is_none() && last.return_code == 1) {
            let message = format!("Stopped (all blocked). {}", format_last(Some(last)));
            return sup.stop("all_blocked", message).await;
        }

        if last.no_progress_streak >= settings.no_progress_limit {
            if policy.on_no_progress_limit == "continue" {
                let mut state = store.load();
                state.no_progress_streak = 0;
                let _ = store.save(&state);
            } else {
                let message = format!(
                    "Stopped (no progress: {}/{}). {}",
                    last.no_progress_streak,
                    settings.no_progress_limit,
                    format_last(Some(last)),
                );
                return sup.stop("no_progress", message).await;
            }
        }

        if policy.sleep_seconds_between_runs > 0 {
            tokio::time::sleep(Duration::from_secs(policy.sleep_seconds_between_runs)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::git::setup_git_repo;
    use tempfile::tempdir;

    fn stub_config(dir: &Path, agent_script: &str) -> Config {
        let mut config = Config::default();
        config.runners.insert(
            "stub".to_string(),
            RunnerConfig {
                argv: vec!["sh".to_string(), "-c".to_string(), agent_script.to_string()],
            },
        );
        config.adaptive_timeout.enabled = false;
        config.supervisor.heartbeat_seconds = 0;
        std::fs::create_dir_all(dir.join(".ralph")).unwrap();
        std::fs::write(dir.join(".gitignore"), ".ralph/\n.gitignore\n").unwrap();
        config
    }

    #[tokio::test]
    async fn test_stops_on_no_progress() {
        let dir = tempdir().unwrap();
        setup_git_repo(dir.path()).await;
        let mut config = stub_config(dir.path(), "echo idle");
        config.loop_.no_progress_limit = 2;

        let result = run_supervisor(dir.path(), "stub", &config).await;
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.reason, "no_progress");
        assert_eq!(result.iterations_run, 2);
    }

    #[tokio::test]
    async fn test_completes_on_done_backlog() {
        let dir = tempdir().unwrap();
        setup_git_repo(dir.path()).await;
        let mut config = stub_config(dir.path(), "echo 'EXIT_SIGNAL: true'");
        config.loop_.no_progress_limit = 10;
        std::fs::write(dir.path().join(".ralph/PRD.md"), "## Tasks\n\n- [x] done\n").unwrap();

        let result = run_supervisor(dir.path(), "stub", &config).await;
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.reason, "complete");
        assert_eq!(result.iterations_run, 1);
    }

    #[tokio::test]
    async fn test_stops_on_rate_limit() {
        let dir = tempdir().unwrap();
        setup_git_repo(dir.path()).await;
        let mut config = stub_config(dir.path(), "echo idle");
        config.loop_.rate_limit_per_hour = 1;
        config.loop_.no_progress_limit = 100;
        config.supervisor.on_rate_limit = "stop".to_string();

        let result = run_supervisor(dir.path(), "stub", &config).await;
        // One iteration runs, then the pre-check trips.
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.reason, "rate_limit");
        assert_eq!(result.iterations_run, 1);
    }

    #[tokio::test]
    async fn test_stops_on_max_runtime() {
        let dir = tempdir().unwrap();
        setup_git_repo(dir.path()).await;
        let mut config = stub_config(dir.path(), "echo idle");
        config.supervisor.max_runtime_seconds = 1;
        config.loop_.no_progress_limit = 1_000;
        config.loop_.sleep_seconds_between_iters = 0;
        config.supervisor.sleep_seconds_between_runs = 1;

        let result = run_supervisor(dir.path(), "stub", &config).await;
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.reason, "max_runtime");
    }

    #[tokio::test]
    async fn test_error_exit_code() {
        let dir = tempdir().unwrap();
        // Not a git repo: the first iteration errors out.
        std::fs::create_dir_all(dir.path().join(".ralph")).unwrap();
        let mut config = Config::default();
        config.supervisor.heartbeat_seconds = 0;
        config.runners.insert(
            "stub".to_string(),
            RunnerConfig {
                argv: vec!["echo".to_string()],
            },
        );

        let result = run_supervisor(dir.path(), "stub", &config).await;
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.reason, "error");
    }

    #[test]
    fn test_json_summary_shape() {
        let result = SuperviseResult {
            exit_code: 0,
            reason: "complete".to_string(),
            iterations_run: 3,
            duration_seconds: 12.345,
            last_iteration: Some(3),
            last_story_id: Some("7".to_string()),
            last_task_title: None,
            last_log_path: None,
        };
        let value = result.to_json();
        assert_eq!(value["cmd"], "supervise");
        assert_eq!(value["exit_code"], 0);
        assert_eq!(value["iterations_run"], 3);
        assert_eq!(value["duration_seconds"], 12.35);
    }
}
