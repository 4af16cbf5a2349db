//! Gate runner: ordered shell commands whose exit codes gate iteration
//! success.
//!
//! Every command runs even after a failure, so one iteration surfaces all
//! breakage at once; the overall verdict is false as soon as any command
//! returns non-zero.

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::GatesConfig;
use crate::process::run_command;

/// Result of a single gate command.
#[derive(Debug, Clone)]
pub struct GateResult {
    pub cmd: String,
    pub return_code: i32,
    pub duration_seconds: f64,
    pub stdout: String,
    pub stderr: String,
}

impl GateResult {
    pub fn passed(&self) -> bool {
        self.return_code == 0
    }
}

/// Pick the platform shell: bash when available for predictable behavior,
/// otherwise sh; cmd on Windows.
pub fn gate_shell_argv(cmd: &str) -> Vec<String> {
    if cfg!(windows) {
        return vec!["cmd".to_string(), "/c".to_string(), cmd.to_string()];
    }
    let shell = if which::which("bash").is_ok() { "bash" } else { "sh" };
    vec![shell.to_string(), "-lc".to_string(), cmd.to_string()]
}

async fn run_gate(project_root: &Path, cmd: &str, timeout: Option<Duration>) -> GateResult {
    let argv = gate_shell_argv(cmd);
    let start = Instant::now();
    match run_command(&argv, project_root, timeout).await {
        Ok(result) => GateResult {
            cmd: cmd.to_string(),
            return_code: result.return_code,
            duration_seconds: start.elapsed().as_secs_f64(),
            stdout: result.stdout,
            stderr: result.stderr,
        },
        Err(e) => GateResult {
            cmd: cmd.to_string(),
            return_code: 127,
            duration_seconds: start.elapsed().as_secs_f64(),
            stdout: String::new(),
            stderr: e.to_string(),
        },
    }
}

/// Run the ordered gate commands. Returns `(gates_ok, per-command results)`;
/// an empty command list yields `(true, [])`.
pub async fn run_gates(
    project_root: &Path,
    commands: &[String],
    timeout: Option<Duration>,
) -> (bool, Vec<GateResult>) {
    if commands.is_empty() {
        return (true, Vec::new());
    }
    let mut results = Vec::with_capacity(commands.len());
    let mut ok = true;
    for cmd in commands {
        let result = run_gate(project_root, cmd, timeout).await;
        debug!(cmd = %result.cmd, rc = result.return_code, "gate finished");
        if !result.passed() {
            ok = false;
        }
        results.push(result);
    }
    (ok, results)
}

/// Run a single argv-style gate (no shell), e.g. the prek pre-commit
/// runner.
pub async fn run_argv_gate(project_root: &Path, argv: &[String]) -> GateResult {
    let cmd = argv.join(" ");
    let start = Instant::now();
    match run_command(argv, project_root, None).await {
        Ok(result) => GateResult {
            cmd,
            return_code: result.return_code,
            duration_seconds: start.elapsed().as_secs_f64(),
            stdout: result.stdout,
            stderr: result.stderr,
        },
        Err(e) => GateResult {
            cmd,
            return_code: 127,
            duration_seconds: start.elapsed().as_secs_f64(),
            stdout: String::new(),
            stderr: e.to_string(),
        },
    }
}

fn clip_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max_lines {
        return text.trim_end().to_string();
    }
    let omitted = lines.len() - max_lines;
    let mut clipped = lines[..max_lines].join("\n");
    clipped.push_str(&format!("\n... [{omitted} more lines]"));
    clipped
}

/// Render gate results for the iteration log per `gates.output_mode`:
/// `full` includes all output, `summary` clips to `max_output_lines`,
/// `errors_only` includes output only for failing gates.
pub fn format_gate_results(
    gates_ok: Option<bool>,
    results: &[GateResult],
    config: &GatesConfig,
) -> String {
    let Some(gates_ok) = gates_ok else {
        return "(gates: not configured)".to_string();
    };
    if results.is_empty() {
        return "(gates: configured but empty)".to_string();
    }

    let status = if gates_ok { "PASS" } else { "FAIL" };
    let mut lines: Vec<String> = vec![format!("gates_overall: {status}")];
    for (i, r) in results.iter().enumerate() {
        let n = i + 1;
        lines.push(String::new());
        lines.push(format!("gate_{n}_cmd: {}", r.cmd));
        lines.push(format!("gate_{n}_return_code: {}", r.return_code));
        lines.push(format!("gate_{n}_duration_seconds: {:.2}", r.duration_seconds));

        let include_output = match config.output_mode.as_str() {
            "errors_only" => !r.passed(),
            _ => true,
        };
        if !include_output {
            continue;
        }

        let (stdout, stderr) = match config.output_mode.as_str() {
            "full" => (r.stdout.trim_end().to_string(), r.stderr.trim_end().to_string()),
            _ => (
                clip_lines(&r.stdout, config.max_output_lines),
                clip_lines(&r.stderr, config.max_output_lines),
            ),
        };
        if !stdout.trim().is_empty() {
            lines.push("--- gate stdout ---".to_string());
            lines.push(stdout);
        }
        if !stderr.trim().is_empty() {
            lines.push("--- gate stderr ---".to_string());
            lines.push(stderr);
        }
    }
    let mut text = lines.join("\n");
    text.push('\n');
    text
}
