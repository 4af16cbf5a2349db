//! Best-effort OS notifications.
//!
//! Never invokes a shell; always executes argv lists. Notification content
//! (task titles, reasons, paths) is untrusted input and is escaped for the
//! backend. Failures are logged and swallowed: a missing notify-send must
//! never take down the supervisor.

use std::time::Duration;

use tracing::debug;

use crate::config::NotifyConfig;
use crate::process::run_command;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyBackend {
    None,
    Macos,
    Linux,
    Windows,
    Command,
}

/// Resolve a configured backend name, probing PATH in auto mode.
pub fn resolve_backend(backend: &str) -> NotifyBackend {
    match backend.trim().to_lowercase().as_str() {
        "none" | "off" | "false" | "0" => return NotifyBackend::None,
        "macos" => return NotifyBackend::Macos,
        "linux" => return NotifyBackend::Linux,
        "windows" => return NotifyBackend::Windows,
        "command" => return NotifyBackend::Command,
        _ => {}
    }

    if cfg!(target_os = "macos") && which::which("osascript").is_ok() {
        NotifyBackend::Macos
    } else if cfg!(target_os = "linux") && which::which("notify-send").is_ok() {
        NotifyBackend::Linux
    } else if cfg!(target_os = "windows") && which::which("powershell").is_ok() {
        NotifyBackend::Windows
    } else {
        NotifyBackend::None
    }
}

fn clip(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= limit {
        return trimmed.to_string();
    }
    let mut clipped: String = trimmed.chars().take(limit).collect();
    clipped.push('…');
    clipped
}

/// Escape a string for embedding inside AppleScript double quotes.
fn escape_applescript(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\n', "\\n")
}

/// Notification sender bound to one configuration.
#[derive(Debug, Clone)]
pub struct Notifier {
    config: NotifyConfig,
}

impl Notifier {
    pub fn new(config: NotifyConfig) -> Self {
        Self { config }
    }

    pub fn disabled() -> Self {
        Self::new(NotifyConfig {
            enabled: false,
            ..Default::default()
        })
    }

    fn event_allowed(&self, event: &str) -> bool {
        if self.config.events.is_empty() {
            return true;
        }
        self.config
            .events
            .iter()
            .any(|e| e.trim().eq_ignore_ascii_case(event))
    }

    /// Send a notification for a lifecycle event (complete|stopped|error).
    /// Returns whether a backend was invoked successfully; never errors.
    pub async fn notify_event(&self, event: &str, title: &str, message: &str) -> bool {
        if !self.config.enabled || !self.event_allowed(event) {
            return false;
        }
        self.send(title, message).await
    }

    async fn send(&self, title: &str, message: &str) -> bool {
        let title = clip(title, 120);
        let message = clip(message, 500);

        let argv: Vec<String> = match resolve_backend(&self.config.backend) {
            NotifyBackend::None => return false,
            NotifyBackend::Macos => {
                let script = format!(
                    "display notification \"{}\" with title \"{}\"",
                    escape_applescript(&message),
                    escape_applescript(&title),
                );
                vec!["osascript".to_string(), "-e".to_string(), script]
            }
            NotifyBackend::Linux => vec!["notify-send".to_string(), title, message],
            NotifyBackend::Windows => {
                let cmd = format!("Write-Host '{}'", message.replace('\'', "''"));
                vec![
                    "powershell".to_string(),
                    "-NoProfile".to_string(),
                    "-Command".to_string(),
                    cmd,
                ]
            }
            NotifyBackend::Command => {
                let mut argv: Vec<String> = self.config.command_argv.clone();
                if argv.is_empty() {
                    return false;
                }
                argv.push(title);
                argv.push(message);
                argv
            }
        };

        let cwd = std::env::current_dir().unwrap_or_else(|_| ".".into());
        match run_command(&argv, &cwd, Some(NOTIFY_TIMEOUT)).await {
            Ok(result) => result.success(),
            Err(e) => {
                debug!(error = %e, "notification backend failed");
                false
            }
        }
    }
}

pub fn default_title(repo_name: &str) -> String {
    let name = repo_name.trim();
    if name.is_empty() {
        "Ralph".to_string()
    } else {
        format!("Ralph: {name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_explicit_backends() {
        assert_eq!(resolve_backend("none"), NotifyBackend::None);
        assert_eq!(resolve_backend("off"), NotifyBackend::None);
        assert_eq!(resolve_backend("macos"), NotifyBackend::Macos);
        assert_eq!(resolve_backend("linux"), NotifyBackend::Linux);
        assert_eq!(resolve_backend("command"), NotifyBackend::Command);
    }

    #[test]
    fn test_escape_applescript() {
        assert_eq!(escape_applescript("a \"b\""), "a \\\"b\\\"");
        assert_eq!(escape_applescript("line1\nline2"), "line1\\nline2");
        assert_eq!(escape_applescript("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn test_clip_long_message() {
        let long = "x".repeat(600);
        let clipped = clip(&long, 500);
        assert_eq!(clipped.chars().count(), 501);
        assert!(clipped.ends_with('…'));
    }

    #[test]
    fn test_event_filter() {
        let notifier = Notifier::new(NotifyConfig {
            enabled: true,
            backend: "none".to_string(),
            events: vec!["complete".to_string()],
            command_argv: Vec::new(),
        });
        assert!(notifier.event_allowed("complete"));
        assert!(notifier.event_allowed("Complete"));
        assert!(!notifier.event_allowed("error"));

        let all = Notifier::new(NotifyConfig {
            enabled: true,
            events: Vec::new(),
            ..Default::default()
        });
        assert!(all.event_allowed("anything"));
    }

    #[tokio::test]
    async fn test_disabled_never_sends() {
        let notifier = Notifier::disabled();
        assert!(!notifier.notify_event("complete", "t", "m").await);
    }

    #[tokio::test]
    async fn test_command_backend_runs_argv() {
        let dir = tempdir().unwrap();
        let title_file = dir.path().join("title.txt");
        let message_file = dir.path().join("message.txt");
        let notifier = Notifier::new(NotifyConfig {
            enabled: true,
            backend: "command".to_string(),
            events: Vec::new(),
            command_argv: vec!["touch".to_string()],
        });
        // The command receives title and message as trailing arguments.
        assert!(
            notifier
                .notify_event(
                    "complete",
                    &title_file.to_string_lossy(),
                    &message_file.to_string_lossy(),
                )
                .await
        );
        assert!(title_file.exists());
        assert!(message_file.exists());
    }

    #[tokio::test]
    async fn test_failing_command_is_swallowed() {
        let notifier = Notifier::new(NotifyConfig {
            enabled: true,
            backend: "command".to_string(),
            events: Vec::new(),
            command_argv: vec!["false".to_string()],
        });
        assert!(!notifier.notify_event("error", "t", "m").await);
    }

    #[test]
    fn test_default_title() {
        assert_eq!(default_title("myrepo"), "Ralph: myrepo");
        assert_eq!(default_title("  "), "Ralph");
    }
}
