//! CLI argument parsing for the `pt` inspection tool

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pt")]
#[command(author, version, about = "Inspect a Ralph Gold PRD backlog", long_about = None)]
pub struct Cli {
    /// Path to the PRD file
    #[arg(short, long, default_value = ".ralph/PRD.md")]
    pub prd: PathBuf,

    /// Tracker kind (auto|markdown|json|yaml|beads)
    #[arg(short, long, default_value = "auto")]
    pub kind: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the next selectable task
    Next,

    /// Show done/total task counts
    Counts,

    /// Show parallel groups
    Groups,

    /// Show the PRD-declared branch name, if any
    Branch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_next() {
        let cli = Cli::parse_from(["pt", "next"]);
        assert!(matches!(cli.command, Command::Next));
        assert_eq!(cli.prd, PathBuf::from(".ralph/PRD.md"));
        assert_eq!(cli.kind, "auto");
    }

    #[test]
    fn test_parse_with_prd_path() {
        let cli = Cli::parse_from(["pt", "-p", ".ralph/tasks.yaml", "groups"]);
        assert!(matches!(cli.command, Command::Groups));
        assert_eq!(cli.prd, PathBuf::from(".ralph/tasks.yaml"));
    }
}
