//! Subprocess execution with capture, live streaming, and bounded runtime.
//!
//! Agent runs stream output to the terminal while capturing it for the
//! iteration log: one reader task per stream, joined at process exit. On
//! timeout the whole process group is killed so shell-spawned grandchildren
//! do not outlive the iteration, and the partial output is preserved.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use eyre::{Result, eyre};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Return code recorded when a subprocess is killed on timeout.
pub const TIMEOUT_RETURN_CODE: i32 = 124;

/// Result of a subprocess execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cmd_str: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.return_code == 0
    }

    pub fn combined_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

fn build_command(argv: &[String], cwd: &Path) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| eyre!("Empty argv for subprocess"))?;
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd);
    // A fresh process group lets a timeout kill the whole tree.
    #[cfg(unix)]
    cmd.process_group(0);
    Ok(cmd)
}

#[cfg(unix)]
fn kill_process_group(child: &Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;
    if let Some(pid) = child.id() {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(%pid, error = %e, "killpg failed");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

/// Run a command, capturing output. An elapsed timeout kills the process
/// group and records [`TIMEOUT_RETURN_CODE`].
pub async fn run_command(
    argv: &[String],
    cwd: &Path,
    timeout: Option<Duration>,
) -> Result<CommandResult> {
    run_streaming(argv, cwd, timeout, None, false).await
}

/// Run a command with per-line streaming: stdout/stderr are captured, and
/// optionally forwarded live to the terminal. `stdin_text` is written and
/// the pipe closed before reading begins.
pub async fn run_streaming(
    argv: &[String],
    cwd: &Path,
    timeout: Option<Duration>,
    stdin_text: Option<String>,
    forward_output: bool,
) -> Result<CommandResult> {
    let cmd_str = argv.join(" ");
    let mut cmd = build_command(argv, cwd)?;
    cmd.stdin(if stdin_text.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| eyre!("Command not found or failed to start: {} ({e})", argv[0]))?;

    if let Some(text) = stdin_text {
        if let Some(mut stdin) = child.stdin.take() {
            // The agent may exit before consuming stdin; that is its call.
            if let Err(e) = stdin.write_all(text.as_bytes()).await {
                debug!(error = %e, "subprocess closed stdin early");
            }
            drop(stdin);
        }
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_task = tokio::spawn(read_stream(stdout, forward_output, false));
    let stderr_task = tokio::spawn(read_stream(stderr, forward_output, true));

    let (status, timed_out) = match timeout {
        Some(dur) => match tokio::time::timeout(dur, child.wait()).await {
            Ok(status) => (Some(status?), false),
            Err(_) => {
                warn!(cmd = %cmd_str, timeout_s = dur.as_secs(), "subprocess timed out; killing process group");
                kill_process_group(&child);
                let _ = child.kill().await;
                let _ = child.wait().await;
                (None, true)
            }
        },
        None => (Some(child.wait().await?), false),
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    let return_code = match (timed_out, status) {
        (true, _) => TIMEOUT_RETURN_CODE,
        (false, Some(status)) => status.code().unwrap_or(-1),
        (false, None) => -1,
    };

    Ok(CommandResult {
        return_code,
        stdout,
        stderr,
        timed_out,
        cmd_str,
    })
}

async fn read_stream<R>(stream: Option<R>, forward: bool, to_stderr: bool) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return String::new();
    };
    let mut captured = String::new();
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if forward {
            if to_stderr {
                eprintln!("{line}");
            } else {
                println!("{line}");
            }
        }
        captured.push_str(&line);
        captured.push('\n');
    }
    captured
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::tempdir;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_capture_stdout() {
        let dir = tempdir().unwrap();
        let result = run_command(&argv(&["echo", "hello"]), dir.path(), None)
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_nonzero_return_code() {
        let dir = tempdir().unwrap();
        let result = run_command(&argv(&["sh", "-c", "echo oops >&2; exit 3"]), dir.path(), None)
            .await
            .unwrap();
        assert_eq!(result.return_code, 3);
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_stdin_is_fed() {
        let dir = tempdir().unwrap();
        let result = run_streaming(
            &argv(&["cat"]),
            dir.path(),
            None,
            Some("from stdin".to_string()),
            false,
        )
        .await
        .unwrap();
        assert_eq!(result.stdout.trim(), "from stdin");
    }

    #[tokio::test]
    async fn test_timeout_kills_and_flags() {
        let dir = tempdir().unwrap();
        let start = Instant::now();
        let result = run_streaming(
            &argv(&["sh", "-c", "echo partial; sleep 30"]),
            dir.path(),
            Some(Duration::from_millis(300)),
            None,
            false,
        )
        .await
        .unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(result.timed_out);
        assert_eq!(result.return_code, TIMEOUT_RETURN_CODE);
        // Partial output survives the kill.
        assert_eq!(result.stdout.trim(), "partial");
    }

    #[tokio::test]
    async fn test_missing_command_errors() {
        let dir = tempdir().unwrap();
        let result = run_command(&argv(&["definitely-not-a-command-xyz"]), dir.path(), None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_combined_output() {
        let result = CommandResult {
            return_code: 0,
            stdout: "out".to_string(),
            stderr: "err".to_string(),
            timed_out: false,
            cmd_str: String::new(),
        };
        assert!(result.combined_output().contains("out"));
        assert!(result.combined_output().contains("err"));
    }
}
