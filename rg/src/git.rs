//! Git plumbing shared by the engine, watch driver, and snapshot manager.

use std::path::Path;

use eyre::{Result, eyre};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::EngineError;

async fn git_output(project_root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(project_root)
        .output()
        .await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(eyre!("git {} failed: {}", args.join(" "), stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Pre-check: the engine only runs inside a git work tree.
pub async fn ensure_git_repo(project_root: &Path) -> Result<(), EngineError> {
    let ok = Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(project_root)
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false);
    if ok { Ok(()) } else { Err(EngineError::NotAGitRepo) }
}

pub async fn head(project_root: &Path) -> Result<String> {
    Ok(git_output(project_root, &["rev-parse", "HEAD"]).await?.trim().to_string())
}

pub async fn is_clean(project_root: &Path) -> Result<bool> {
    let status = git_output(project_root, &["status", "--porcelain"]).await?;
    Ok(status.trim().is_empty())
}

/// Paths changed in the working tree, `.ralph/` internals excluded. Drives
/// the no-files-written receipt.
pub async fn changed_user_files(project_root: &Path) -> Vec<String> {
    let Ok(status) = git_output(project_root, &["status", "--porcelain"]).await else {
        return Vec::new();
    };
    status
        .lines()
        .filter_map(|line| {
            // Porcelain format: XY <path> (or XY <old> -> <new>).
            let path = line.get(3..)?.trim();
            let path = path.rsplit(" -> ").next().unwrap_or(path);
            if path.is_empty() || path.starts_with(".ralph/") || path == ".ralph" {
                None
            } else {
                Some(path.to_string())
            }
        })
        .collect()
}

/// Best-effort `git checkout -B <branch> [base]` for the configured branch
/// strategy. Never fatal: a failed checkout logs and leaves HEAD alone.
pub async fn checkout_branch(project_root: &Path, branch: &str, base: &str) -> bool {
    let mut args = vec!["checkout", "-B", branch];
    if !base.is_empty() {
        args.push(base);
    }
    match git_output(project_root, &args).await {
        Ok(_) => {
            debug!(%branch, "checked out branch");
            true
        }
        Err(e) => {
            warn!(%branch, error = %e, "branch checkout failed; staying on current HEAD");
            false
        }
    }
}

/// Stage everything and commit. Returns false when there was nothing to
/// commit or the commit failed.
pub async fn stage_all_and_commit(project_root: &Path, message: &str) -> bool {
    let Ok(status) = git_output(project_root, &["status", "--porcelain"]).await else {
        return false;
    };
    if status.trim().is_empty() {
        return false;
    }
    if git_output(project_root, &["add", "-A"]).await.is_err() {
        return false;
    }
    git_output(project_root, &["commit", "-m", message]).await.is_ok()
}

#[cfg(test)]
pub(crate) async fn setup_git_repo(dir: &Path) {
    for args in [
        vec!["init"],
        vec!["config", "user.email", "test@test.com"],
        vec!["config", "user.name", "Test"],
        vec!["commit", "--allow-empty", "-m", "initial"],
    ] {
        Command::new("git")
            .args(&args)
            .current_dir(dir)
            .output()
            .await
            .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_ensure_git_repo() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            ensure_git_repo(dir.path()).await,
            Err(EngineError::NotAGitRepo)
        ));

        setup_git_repo(dir.path()).await;
        assert!(ensure_git_repo(dir.path()).await.is_ok());
    }

    #[tokio::test]
    async fn test_head_and_clean() {
        let dir = tempdir().unwrap();
        setup_git_repo(dir.path()).await;

        let sha = head(dir.path()).await.unwrap();
        assert_eq!(sha.len(), 40);
        assert!(is_clean(dir.path()).await.unwrap());

        std::fs::write(dir.path().join("x.txt"), "hello").unwrap();
        assert!(!is_clean(dir.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_changed_user_files_skips_ralph() {
        let dir = tempdir().unwrap();
        setup_git_repo(dir.path()).await;

        std::fs::create_dir_all(dir.path().join(".ralph")).unwrap();
        std::fs::write(dir.path().join(".ralph/state.json"), "{}").unwrap();
        std::fs::write(dir.path().join("code.rs"), "fn main() {}").unwrap();

        let changed = changed_user_files(dir.path()).await;
        assert_eq!(changed, vec!["code.rs"]);
    }

    #[tokio::test]
    async fn test_stage_all_and_commit() {
        let dir = tempdir().unwrap();
        setup_git_repo(dir.path()).await;

        // Nothing to commit.
        assert!(!stage_all_and_commit(dir.path(), "empty").await);

        std::fs::write(dir.path().join("y.txt"), "content").unwrap();
        let before = head(dir.path()).await.unwrap();
        assert!(stage_all_and_commit(dir.path(), "add y").await);
        let after = head(dir.path()).await.unwrap();
        assert_ne!(before, after);
        assert!(is_clean(dir.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_checkout_branch() {
        let dir = tempdir().unwrap();
        setup_git_repo(dir.path()).await;
        assert!(checkout_branch(dir.path(), "ralph/test-branch", "").await);
        let branch = git_output(dir.path(), &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .unwrap();
        assert_eq!(branch.trim(), "ralph/test-branch");
    }
}
