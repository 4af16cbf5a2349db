//! Output control: verbosity gating and text/JSON formatting.
//!
//! Commands print through [`print_output`] so quiet/normal/verbose modes
//! behave uniformly. JSON format suppresses all text output; structured
//! summaries go through [`print_json_output`] instead.

use std::sync::RwLock;

use serde_json::Value;

/// Message levels, in increasing verbosity requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Always printed, to stderr.
    Error,
    /// Printed in every mode.
    Quiet,
    /// Printed in normal and verbose modes.
    Normal,
    /// Printed only in verbose mode.
    Verbose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    pub verbosity: String,
    pub format: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            verbosity: "normal".to_string(),
            format: "text".to_string(),
        }
    }
}

static OUTPUT_CONFIG: RwLock<Option<OutputConfig>> = RwLock::new(None);

/// Install the output configuration for this process (set once by the CLI).
pub fn set_output_config(config: OutputConfig) {
    *OUTPUT_CONFIG.write().expect("output config lock poisoned") = Some(config);
}

pub fn get_output_config() -> OutputConfig {
    OUTPUT_CONFIG
        .read()
        .expect("output config lock poisoned")
        .clone()
        .unwrap_or_default()
}

pub fn is_json() -> bool {
    get_output_config().format == "json"
}

/// Print a message if the current verbosity admits its level.
pub fn print_output(message: &str, level: Level) {
    let config = get_output_config();

    if config.format == "json" {
        return;
    }

    let should_print = match level {
        Level::Error => true,
        Level::Quiet => true,
        Level::Normal => matches!(config.verbosity.as_str(), "normal" | "verbose"),
        Level::Verbose => config.verbosity == "verbose",
    };

    if should_print {
        if level == Level::Error {
            eprintln!("{message}");
        } else {
            println!("{message}");
        }
    }
}

/// Emit a structured summary; only active in JSON format mode.
pub fn print_json_output(data: &Value) {
    if is_json() {
        if let Ok(text) = serde_json::to_string_pretty(data) {
            println!("{text}");
        }
    }
}
