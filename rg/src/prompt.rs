//! Prompt building. The prompt stays small; the filesystem is the memory.

use prdtrack::SelectedTask;

use crate::config::Config;

/// Produce the per-iteration prompt: a preamble, the durable memory files
/// the agent must read, the iteration rules, the selected task, and the
/// exit protocol.
pub fn build_prompt(config: &Config, task: Option<&SelectedTask>, _iteration: u64) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push("You are running inside the Golden Ralph Loop.".to_string());
    lines.push(String::new());
    lines.push("Read these files for context and memory:".to_string());
    lines.push(format!("- {}", config.files.prompt));
    lines.push(format!("- {}", config.files.agents));
    lines.push(format!("- {}", config.files.prd));
    lines.push(format!("- {}", config.files.progress));
    lines.push(String::new());
    lines.push("Iteration rules:".to_string());
    lines.push("- One task per iteration.".to_string());
    lines.push(
        "- Use backpressure: run the quality gate commands from AGENTS.md and fix until they pass."
            .to_string(),
    );
    lines.push(
        "- Update the PRD file to mark the task done, append learnings to progress.md, then commit."
            .to_string(),
    );
    lines.push(String::new());

    match task {
        Some(task) => {
            lines.push("Work on this task (selected for you):".to_string());
            lines.push(format!("- Task ID: {}", task.id));
            if !task.title.is_empty() {
                lines.push(format!("- Title: {}", task.title));
            }
            lines.push(String::new());
            lines.push("Do not work on any other task in this iteration.".to_string());
            lines.push(String::new());
        }
        None => {
            lines.push("No task was selected (the PRD may be empty or malformed).".to_string());
            lines.push("If the PRD is complete, confirm and prepare to exit.".to_string());
            lines.push(String::new());
        }
    }

    lines.push("Exit protocol:".to_string());
    lines.push("At the very end of your output, print exactly one line:".to_string());
    lines.push("EXIT_SIGNAL: true|false".to_string());
    lines.push("- true ONLY if all tasks are done AND the repo is clean with all gates passing.".to_string());
    lines.push("- otherwise false.".to_string());
    lines.push(String::new());
    lines.join("\n")
}
