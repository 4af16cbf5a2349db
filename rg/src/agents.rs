//! Agent invocation building.
//!
//! Each agent CLI takes its prompt differently: codex reads stdin behind a
//! `-` placeholder, claude wants `-p <prompt>`, copilot wants
//! `--prompt <prompt>`, and anything unknown gets the prompt appended as
//! the final argument. A literal `{prompt}` token anywhere in the argv
//! template short-circuits all of that.

use crate::config::{Config, RunnerConfig};
use crate::error::EngineError;

/// Known agent kinds, plus a generic fallback carrying the raw name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentKind {
    Codex,
    Claude,
    ClaudeZai,
    ClaudeKimi,
    Copilot,
    Generic(String),
}

impl AgentKind {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "codex" => Self::Codex,
            "claude" => Self::Claude,
            "claude-zai" => Self::ClaudeZai,
            "claude-kimi" => Self::ClaudeKimi,
            "copilot" => Self::Copilot,
            other => Self::Generic(other.to_string()),
        }
    }
}

/// A ready-to-spawn invocation: argv plus optional stdin payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub stdin: Option<String>,
}

/// Look up the runner for an agent name; unknown names are fatal for the
/// invocation since there is no argv to run.
pub fn get_runner<'a>(config: &'a Config, agent: &str) -> Result<&'a RunnerConfig, EngineError> {
    config.runners.get(agent).ok_or_else(|| EngineError::UnknownAgent {
        agent: agent.to_string(),
        available: config
            .runners
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// Translate agent kind + argv template + prompt into argv and stdin.
pub fn build_invocation(kind: &AgentKind, prompt: &str, runner: &RunnerConfig) -> Invocation {
    let mut argv: Vec<String> = runner.argv.clone();

    // Placeholder replacement wins over any per-agent convention.
    if argv.iter().any(|a| a == "{prompt}") {
        for arg in argv.iter_mut() {
            if arg == "{prompt}" {
                *arg = prompt.to_string();
            }
        }
        return Invocation { argv, stdin: None };
    }

    match kind {
        AgentKind::Codex => {
            // Stdin is the most robust path for long prompts.
            if !argv.iter().any(|a| a == "-") {
                argv.push("-".to_string());
            }
            Invocation {
                argv,
                stdin: Some(prompt.to_string()),
            }
        }
        AgentKind::Claude => {
            insert_after_flag(&mut argv, "-p", prompt, FlagFallback::Append);
            Invocation { argv, stdin: None }
        }
        AgentKind::ClaudeZai | AgentKind::ClaudeKimi => {
            // Wrapper scripts around claude: when no -p exists, inject it
            // right after the executable so wrapper-specific trailing args
            // keep their position.
            insert_after_flag(&mut argv, "-p", prompt, FlagFallback::AfterProgram);
            Invocation { argv, stdin: None }
        }
        AgentKind::Copilot => {
            insert_after_flag(&mut argv, "--prompt", prompt, FlagFallback::Append);
            Invocation { argv, stdin: None }
        }
        AgentKind::Generic(_) => {
            argv.push(prompt.to_string());
            Invocation { argv, stdin: None }
        }
    }
}

enum FlagFallback {
    /// Append `<flag> <prompt>` at the end.
    Append,
    /// Insert `<flag> <prompt>` immediately after the executable name.
    AfterProgram,
}

fn insert_after_flag(argv: &mut Vec<String>, flag: &str, prompt: &str, fallback: FlagFallback) {
    if let Some(i) = argv.iter().position(|a| a == flag) {
        // If the flag is last, or followed by another flag, the prompt slot
        // is missing: insert it. Otherwise overwrite the stale value.
        if i == argv.len() - 1 || argv[i + 1].starts_with('-') {
            argv.insert(i + 1, prompt.to_string());
        } else {
            argv[i + 1] = prompt.to_string();
        }
        return;
    }
    match fallback {
        FlagFallback::Append => {
            argv.push(flag.to_string());
            argv.push(prompt.to_string());
        }
        FlagFallback::AfterProgram => {
            let at = if argv.is_empty() { 0 } else { 1 };
            argv.insert(at, flag.to_string());
            argv.insert(at + 1, prompt.to_string());
        }
    }
}
