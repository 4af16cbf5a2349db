//! Watch driver: file changes trigger a gate run, optionally followed by an
//! auto-commit.
//!
//! Polls modification times once a second (matching the git poller used for
//! branch watching; OS-native event APIs would need a crate this workspace
//! does not carry). Changes are coalesced over a debounce window and the
//! callback fires once per window with the changed set.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use eyre::{Result, eyre};
use glob::Pattern;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::Config;
use crate::gates::run_gates;
use crate::git;
use crate::output::{Level, print_output};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

const IGNORE_DIRS: [&str; 6] = [".ralph", ".git", "__pycache__", "node_modules", ".venv", "venv"];

/// True for paths the watcher never reports: ignored directories and
/// dotfiles anywhere in the relative path.
fn should_ignore(rel_path: &Path) -> bool {
    rel_path.components().any(|c| {
        let name = c.as_os_str().to_string_lossy();
        IGNORE_DIRS.contains(&name.as_ref()) || name.starts_with('.')
    })
}

fn matches_patterns(rel_path: &Path, patterns: &[Pattern]) -> bool {
    patterns.iter().any(|p| p.matches_path(rel_path))
}

/// Compile configured glob patterns, rejecting invalid ones up front.
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| Pattern::new(p).map_err(|e| eyre!("Invalid watch pattern {p:?}: {e}")))
        .collect()
}

/// One poll pass: relative paths of matching files modified at or after
/// `since`.
pub fn poll_changes(project_root: &Path, patterns: &[Pattern], since: SystemTime) -> BTreeSet<PathBuf> {
    let mut changed = BTreeSet::new();
    for entry in WalkDir::new(project_root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(project_root) else {
            continue;
        };
        if should_ignore(rel) || !matches_patterns(rel, patterns) {
            continue;
        }
        let Some(mtime) = entry.metadata().ok().and_then(|m| m.modified().ok()) else {
            continue;
        };
        if mtime >= since {
            changed.insert(rel.to_path_buf());
        }
    }
    changed
}

/// Watch the project and run gates on changes. Runs until `max_cycles`
/// debounce windows have fired (`None` = forever; the CLI stops it with
/// Ctrl-C).
pub async fn run_watch_mode(
    project_root: &Path,
    config: &Config,
    auto_commit: bool,
    max_cycles: Option<u32>,
) -> Result<()> {
    if !config.watch.enabled {
        return Err(eyre!(
            "Watch mode is not enabled. Set watch.enabled = true in ralph.toml"
        ));
    }

    let patterns = compile_patterns(&config.watch.patterns)?;
    let debounce = Duration::from_millis(config.watch.debounce_ms);
    let commit_enabled = auto_commit || config.watch.auto_commit;

    print_output(
        &format!(
            "Watch mode started (polling). Watching patterns: {}",
            config.watch.patterns.join(", ")
        ),
        Level::Normal,
    );

    let mut last_check = SystemTime::now();
    let mut pending: BTreeSet<PathBuf> = BTreeSet::new();
    let mut window_start: Option<tokio::time::Instant> = None;
    let mut cycles = 0u32;

    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        let now = SystemTime::now();
        let changed = poll_changes(project_root, &patterns, last_check);
        last_check = now;

        if !changed.is_empty() {
            debug!(count = changed.len(), "changes detected");
            pending.extend(changed);
            window_start.get_or_insert_with(tokio::time::Instant::now);
        }

        let Some(started) = window_start else {
            continue;
        };
        if started.elapsed() < debounce {
            continue;
        }

        // Debounce window closed: fire once for the coalesced set.
        let batch: Vec<PathBuf> = pending.iter().cloned().collect();
        pending.clear();
        window_start = None;
        on_changes(project_root, config, &batch, commit_enabled).await;

        cycles += 1;
        if let Some(max) = max_cycles {
            if cycles >= max {
                return Ok(());
            }
        }
    }
}

async fn on_changes(project_root: &Path, config: &Config, batch: &[PathBuf], auto_commit: bool) {
    info!(files = batch.len(), "running gates after change");
    for path in batch {
        print_output(&format!("File changed: {}", path.display()), Level::Normal);
    }

    let (gates_ok, results) = run_gates(project_root, &config.gates.commands, None).await;
    if gates_ok {
        print_output("✓ All gates passed", Level::Normal);
        if auto_commit {
            if let Some(first) = batch.first() {
                let message = format!("ralph watch: auto-commit after {}", first.display());
                if git::stage_all_and_commit(project_root, &message).await {
                    print_output(&format!("✓ Auto-committed changes: {message}"), Level::Normal);
                }
            }
        }
    } else {
        print_output("✗ Gates failed", Level::Normal);
        for result in results.iter().filter(|r| !r.passed()) {
            print_output(&format!("  Failed: {}", result.cmd), Level::Normal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn patterns(globs: &[&str]) -> Vec<Pattern> {
        compile_patterns(&globs.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(compile_patterns(&["[".to_string()]).is_err());
    }

    #[test]
    fn test_should_ignore() {
        assert!(should_ignore(Path::new(".ralph/state.json")));
        assert!(should_ignore(Path::new(".git/HEAD")));
        assert!(should_ignore(Path::new("node_modules/pkg/index.js")));
        assert!(should_ignore(Path::new("src/.hidden.rs")));
        assert!(!should_ignore(Path::new("src/main.rs")));
    }

    #[test]
    fn test_poll_detects_matching_changes() {
        let dir = tempdir().unwrap();
        let epoch = SystemTime::UNIX_EPOCH;
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.py"), "x = 1").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();
        std::fs::create_dir_all(dir.path().join(".ralph")).unwrap();
        std::fs::write(dir.path().join(".ralph/state.json"), "{}").unwrap();

        let changed = poll_changes(dir.path(), &patterns(&["**/*.py"]), epoch);
        assert_eq!(changed.len(), 1);
        assert!(changed.contains(&PathBuf::from("src/lib.py")));
    }

    #[test]
    fn test_poll_respects_since_cutoff() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("old.py"), "old").unwrap();
        // A cutoff far in the future sees nothing.
        let future = SystemTime::now() + Duration::from_secs(3600);
        let changed = poll_changes(dir.path(), &patterns(&["**/*.py"]), future);
        assert!(changed.is_empty());
    }

    #[tokio::test]
    async fn test_watch_disabled_errors() {
        let dir = tempdir().unwrap();
        let config = Config::default();
        let err = run_watch_mode(dir.path(), &config, false, Some(1)).await.unwrap_err();
        assert!(err.to_string().contains("watch.enabled"));
    }

    #[tokio::test]
    async fn test_debounced_gate_run_and_auto_commit() {
        let dir = tempdir().unwrap();
        crate::git::setup_git_repo(dir.path()).await;
        std::fs::write(dir.path().join(".gitignore"), ".gitignore\nmarker.txt\n").unwrap();

        let mut config = Config::default();
        config.watch.enabled = true;
        config.watch.patterns = vec!["**/*.py".to_string()];
        config.watch.debounce_ms = 100;
        // The gate drops a marker so the run is observable.
        config.gates.commands = vec!["touch marker.txt".to_string()];

        let root = dir.path().to_path_buf();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            std::fs::write(root.join("script.py"), "print('hi')").unwrap();
        });

        run_watch_mode(dir.path(), &config, true, Some(1)).await.unwrap();
        writer.await.unwrap();

        assert!(dir.path().join("marker.txt").exists());
        // Auto-commit ran after the gate pass: script.py is committed.
        assert!(crate::git::is_clean(dir.path()).await.unwrap());
    }
}
