//! Structured per-iteration receipts under `.ralph/receipts/<iteration>/`.
//!
//! Receipts are the machine-readable account of one iteration, distinct
//! from the human-readable log: `runner.json` records the agent invocation,
//! `evidence.json` counts `path:line` citations in agent output, and
//! `no_files_written.json` flags iterations where the agent touched nothing
//! outside `.ralph/`.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use eyre::Result;
use regex::Regex;
use serde::Serialize;

use super::atomic::atomic_write_json;

pub const RECEIPT_SCHEMA: &str = "ralph_gold.receipt.v1";

static CITATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9_./-]+\.[A-Za-z]+:\d+").unwrap());

#[derive(Debug, Clone, Serialize)]
pub struct RunnerReceipt {
    #[serde(rename = "_schema")]
    pub schema: &'static str,
    pub name: String,
    pub argv: Vec<String>,
    pub returncode: i32,
    pub started_at: String,
    pub ended_at: String,
    pub duration_seconds: f64,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvidenceReceipt {
    #[serde(rename = "_schema")]
    pub schema: &'static str,
    pub citation_count: usize,
}

impl EvidenceReceipt {
    pub fn from_output(output: &str) -> Self {
        Self {
            schema: RECEIPT_SCHEMA,
            citation_count: count_citations(output),
        }
    }
}

/// Emitted when the agent completed but wrote no user files.
#[derive(Debug, Clone, Serialize)]
pub struct NoFilesWrittenReceipt {
    #[serde(rename = "_schema")]
    pub schema: &'static str,
    pub task_id: String,
    pub iteration: u64,
    pub started_at: String,
    pub ended_at: String,
    pub duration_seconds: f64,
    pub agent_return_code: i32,
    pub possible_causes: Vec<String>,
    pub remediation: String,
}

impl NoFilesWrittenReceipt {
    pub fn new(
        task_id: String,
        iteration: u64,
        started_at: String,
        ended_at: String,
        duration_seconds: f64,
        agent_return_code: i32,
    ) -> Self {
        Self {
            schema: RECEIPT_SCHEMA,
            task_id,
            iteration,
            started_at,
            ended_at,
            duration_seconds,
            agent_return_code,
            possible_causes: vec![
                "Agent could not find the task in the PRD".to_string(),
                "Agent decided the task was already complete".to_string(),
                "Agent hit an internal error before editing".to_string(),
            ],
            remediation: "Check the iteration log, then re-run or unblock the task".to_string(),
        }
    }
}

/// Count `path:line` style citations in combined agent output.
pub fn count_citations(output: &str) -> usize {
    CITATION_RE.find_iter(output).count()
}

pub fn receipts_dir(project_root: &Path, iteration: u64) -> PathBuf {
    project_root
        .join(".ralph")
        .join("receipts")
        .join(iteration.to_string())
}

/// Atomically write one receipt, creating the iteration directory.
pub fn write_receipt<T: Serialize>(path: &Path, receipt: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    atomic_write_json(path, receipt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_count_citations() {
        let output = "\
Fixed the bug in src/engine.rs:42 and added a test at tests/engine_test.rs:101.
No citation here. Also touched lib/utils.py:7.
";
        assert_eq!(count_citations(output), 3);
        assert_eq!(count_citations("nothing to cite"), 0);
    }

    #[test]
    fn test_receipts_dir_layout() {
        let dir = receipts_dir(Path::new("/proj"), 12);
        assert_eq!(dir, PathBuf::from("/proj/.ralph/receipts/12"));
    }

    #[test]
    fn test_write_runner_receipt() {
        let dir = tempdir().unwrap();
        let receipt = RunnerReceipt {
            schema: RECEIPT_SCHEMA,
            name: "codex".to_string(),
            argv: vec!["codex".to_string(), "exec".to_string()],
            returncode: 0,
            started_at: "2026-01-01T00:00:00Z".to_string(),
            ended_at: "2026-01-01T00:01:00Z".to_string(),
            duration_seconds: 60.0,
            timed_out: false,
        };
        let path = receipts_dir(dir.path(), 1).join("runner.json");
        write_receipt(&path, &receipt).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["_schema"], RECEIPT_SCHEMA);
        assert_eq!(raw["returncode"], 0);
        assert_eq!(raw["argv"][0], "codex");
    }

    #[test]
    fn test_no_files_written_receipt_shape() {
        let receipt = NoFilesWrittenReceipt::new(
            "task-3".to_string(),
            4,
            "s".to_string(),
            "e".to_string(),
            12.5,
            0,
        );
        assert!(!receipt.possible_causes.is_empty());
        let value = serde_json::to_value(&receipt).unwrap();
        assert_eq!(value["task_id"], "task-3");
        assert_eq!(value["iteration"], 4);
        assert_eq!(value["agent_return_code"], 0);
    }

    #[test]
    fn test_evidence_from_output() {
        let receipt = EvidenceReceipt::from_output("see src/a.rs:1 and src/b.rs:2");
        assert_eq!(receipt.citation_count, 2);
    }
}
