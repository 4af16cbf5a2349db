//! Named savepoints: a git stash of the working tree (excluding `.ralph/`)
//! plus a backup of `state.json`.

use std::path::Path;
use std::sync::LazyLock;

use eyre::{Result, bail, eyre};
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info};

use crate::state::{SnapshotMeta, StateStore, atomic_write_text, utc_now_iso};

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());
static STASH_REF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(stash@\{\d+\})").unwrap());

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("Snapshot name cannot be empty");
    }
    if !NAME_RE.is_match(name) {
        bail!(
            "Invalid snapshot name '{name}'. Use only letters, numbers, hyphens, and underscores."
        );
    }
    Ok(())
}

async fn git(project_root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(project_root)
        .output()
        .await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

async fn is_dirty(project_root: &Path) -> bool {
    git(project_root, &["status", "--porcelain"])
        .await
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
}

/// Create a snapshot: stash the working tree (untracked included,
/// `.ralph/` excluded), back up `state.json`, and record the metadata.
pub async fn create_snapshot(
    project_root: &Path,
    name: &str,
    description: &str,
) -> Result<SnapshotMeta> {
    validate_name(name)?;
    crate::git::ensure_git_repo(project_root).await?;

    let git_commit = git(project_root, &["rev-parse", "HEAD"]).await?.trim().to_string();
    let timestamp = utc_now_iso();

    let mut stash_message = format!("ralph-snapshot: {name}");
    if !description.is_empty() {
        stash_message.push_str(&format!(" - {description}"));
    }

    git(
        project_root,
        &[
            "stash", "push", "-u", "-m", &stash_message, "--", ".", ":!.ralph/",
        ],
    )
    .await?;

    // Locate the stash we just created.
    let stash_list = git(project_root, &["stash", "list"]).await?;
    let stash_ref = stash_list
        .lines()
        .find(|line| line.contains(&stash_message))
        .and_then(|line| STASH_REF_RE.captures(line))
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| eyre!("Failed to find created stash reference"))?;

    // Back up state.json alongside the stash.
    let snapshots_dir = project_root.join(".ralph").join("snapshots");
    std::fs::create_dir_all(&snapshots_dir)?;
    let backup_path = snapshots_dir.join(format!("{name}_state.json"));
    let state_path = project_root.join(".ralph").join("state.json");
    let state_content = std::fs::read_to_string(&state_path).unwrap_or_else(|_| "{}".to_string());
    atomic_write_text(&backup_path, &state_content)?;

    let snapshot = SnapshotMeta {
        name: name.to_string(),
        timestamp,
        git_stash_ref: stash_ref,
        state_backup_path: format!(".ralph/snapshots/{name}_state.json"),
        description: description.to_string(),
        git_commit,
    };

    let store = StateStore::for_root(project_root);
    let mut state = store.load();
    state.snapshots.push(snapshot.clone());
    store.save(&state)?;

    info!(name, stash = %snapshot.git_stash_ref, "snapshot created");
    Ok(snapshot)
}

pub fn list_snapshots(project_root: &Path) -> Vec<SnapshotMeta> {
    StateStore::for_root(project_root).load().snapshots
}

/// Stash refs shift as newer stashes are pushed, so re-resolve by the
/// snapshot message before applying or dropping; the recorded ref is the
/// fallback.
async fn resolve_stash_ref(project_root: &Path, snapshot: &SnapshotMeta) -> String {
    let needle = format!("ralph-snapshot: {}", snapshot.name);
    let resolved = match git(project_root, &["stash", "list"]).await {
        Ok(list) => list
            .lines()
            .find(|line| line.contains(&needle))
            .and_then(|line| STASH_REF_RE.captures(line))
            .map(|caps| caps[1].to_string()),
        Err(_) => None,
    };
    resolved.unwrap_or_else(|| snapshot.git_stash_ref.clone())
}

/// Roll the working tree and `state.json` back to a snapshot. Refuses a
/// dirty tree unless `force`.
pub async fn rollback_snapshot(project_root: &Path, name: &str, force: bool) -> Result<()> {
    crate::git::ensure_git_repo(project_root).await?;

    if !force && is_dirty(project_root).await {
        bail!(
            "Working tree has uncommitted changes. Commit or stash changes before rollback, or pass --force."
        );
    }

    let snapshot = list_snapshots(project_root)
        .into_iter()
        .find(|s| s.name == name)
        .ok_or_else(|| eyre!("Snapshot '{name}' not found"))?;

    let stash_ref = resolve_stash_ref(project_root, &snapshot).await;
    git(project_root, &["stash", "apply", &stash_ref]).await?;

    let backup_path = project_root.join(&snapshot.state_backup_path);
    if backup_path.exists() {
        let content = std::fs::read_to_string(&backup_path)?;
        let state_path = project_root.join(".ralph").join("state.json");
        atomic_write_text(&state_path, &content)?;
    }

    info!(name, "snapshot rolled back");
    Ok(())
}

/// Keep the `keep_count` most recent snapshots; drop stashes, backups, and
/// metadata for the rest. Returns the number removed.
pub async fn cleanup_old_snapshots(project_root: &Path, keep_count: usize) -> Result<usize> {
    if keep_count < 1 {
        bail!("keep_count must be at least 1");
    }

    let mut snapshots = list_snapshots(project_root);
    if snapshots.len() <= keep_count {
        return Ok(0);
    }
    snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let mut removed = 0;
    for snapshot in &snapshots[keep_count..] {
        let stash_ref = resolve_stash_ref(project_root, snapshot).await;
        if let Err(e) = git(project_root, &["stash", "drop", &stash_ref]).await {
            debug!(name = %snapshot.name, error = %e, "stash drop failed; skipping");
            continue;
        }
        let backup = project_root.join(&snapshot.state_backup_path);
        if backup.exists() {
            let _ = std::fs::remove_file(&backup);
        }

        let store = StateStore::for_root(project_root);
        let mut state = store.load();
        state.snapshots.retain(|s| s.name != snapshot.name);
        store.save(&state)?;
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::setup_git_repo;
    use tempfile::tempdir;

    #[test]
    fn test_name_validation() {
        assert!(validate_name("before-refactor_2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("slash/name").is_err());
    }

    #[tokio::test]
    async fn test_create_requires_changes() {
        let dir = tempdir().unwrap();
        setup_git_repo(dir.path()).await;
        // A clean tree produces no stash, which is an error.
        assert!(create_snapshot(dir.path(), "empty", "").await.is_err());
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let dir = tempdir().unwrap();
        setup_git_repo(dir.path()).await;
        std::fs::write(dir.path().join("y.txt"), "original").unwrap();

        let snapshot = create_snapshot(dir.path(), "S", "before changes").await.unwrap();
        assert_eq!(snapshot.name, "S");
        assert!(snapshot.git_stash_ref.starts_with("stash@{"));
        assert_eq!(snapshot.git_commit.len(), 40);

        let listed = list_snapshots(dir.path());
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].description, "before changes");
        assert!(dir.path().join(".ralph/snapshots/S_state.json").exists());
    }

    #[tokio::test]
    async fn test_rollback_restores_tree_and_state() {
        let dir = tempdir().unwrap();
        setup_git_repo(dir.path()).await;

        // Seed state with a marker, then a file to snapshot.
        let store = StateStore::for_root(dir.path());
        let mut state = store.load();
        state.no_progress_streak = 5;
        store.save(&state).unwrap();
        std::fs::write(dir.path().join("y.txt"), "original").unwrap();

        create_snapshot(dir.path(), "S", "").await.unwrap();
        // The stash reverted the working tree: y.txt is gone.
        assert!(!dir.path().join("y.txt").exists());

        // Diverge: new commit and mutated state.
        std::fs::write(dir.path().join("z.txt"), "later work").unwrap();
        crate::git::stage_all_and_commit(dir.path(), "later work").await;
        let mut state = store.load();
        state.no_progress_streak = 9;
        store.save(&state).unwrap();

        rollback_snapshot(dir.path(), "S", true).await.unwrap();

        // y.txt is back with its pre-snapshot content.
        assert_eq!(std::fs::read_to_string(dir.path().join("y.txt")).unwrap(), "original");
        // state.json restored from the backup.
        assert_eq!(store.load().no_progress_streak, 5);
    }

    #[tokio::test]
    async fn test_rollback_refuses_dirty_tree() {
        let dir = tempdir().unwrap();
        setup_git_repo(dir.path()).await;
        std::fs::write(dir.path().join("y.txt"), "v1").unwrap();
        create_snapshot(dir.path(), "S", "").await.unwrap();

        std::fs::write(dir.path().join("dirty.txt"), "uncommitted").unwrap();
        let err = rollback_snapshot(dir.path(), "S", false).await.unwrap_err();
        assert!(err.to_string().contains("uncommitted changes"));

        // Force overrides the guard.
        rollback_snapshot(dir.path(), "S", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_unknown_name() {
        let dir = tempdir().unwrap();
        setup_git_repo(dir.path()).await;
        let err = rollback_snapshot(dir.path(), "ghost", true).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_most_recent() {
        let dir = tempdir().unwrap();
        setup_git_repo(dir.path()).await;

        for i in 0..3 {
            std::fs::write(dir.path().join(format!("f{i}.txt")), format!("v{i}")).unwrap();
            create_snapshot(dir.path(), &format!("snap{i}"), "").await.unwrap();
            // Distinct timestamps for a deterministic recency order.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let removed = cleanup_old_snapshots(dir.path(), 2).await.unwrap();
        assert_eq!(removed, 1);

        let names: Vec<String> = list_snapshots(dir.path()).into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["snap1", "snap2"]);
        assert!(!dir.path().join(".ralph/snapshots/snap0_state.json").exists());

        assert!(cleanup_old_snapshots(dir.path(), 0).await.is_err());
    }
}
