//! Worktree manager: one isolated checkout plus a unique branch per
//! parallel worker.

use std::path::{Path, PathBuf};
use std::time::Duration;

use prdtrack::SelectedTask;
use tokio::process::Command;
use tracing::{debug, info, warn};

const CREATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Error types for worktree operations.
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("Failed to create worktree: {0}")]
    CreateFailed(String),

    #[error("Failed to remove worktree: {0}")]
    RemoveFailed(String),

    #[error("Git command failed: {0}")]
    GitError(String),
}

/// Manager for the worktrees under one `worktree_root`.
pub struct WorktreeManager {
    project_root: PathBuf,
    worktree_root: PathBuf,
}

impl WorktreeManager {
    pub fn new(project_root: PathBuf, worktree_root: PathBuf) -> Self {
        Self {
            project_root,
            worktree_root,
        }
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output, WorktreeError> {
        Command::new("git")
            .args(args)
            .current_dir(&self.project_root)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))
    }

    /// `ralph/worker-<id>-task-<sanitized-task-id>`
    fn branch_name(task: &SelectedTask, worker_id: usize) -> String {
        let safe_id: String = task
            .id
            .chars()
            .map(|c| if c == '/' || c.is_whitespace() { '-' } else { c })
            .collect();
        format!("ralph/worker-{worker_id}-task-{safe_id}")
    }

    /// Create an isolated worktree for one task. Returns `(path, branch)`.
    pub async fn create_worktree(
        &self,
        task: &SelectedTask,
        worker_id: usize,
    ) -> Result<(PathBuf, String), WorktreeError> {
        std::fs::create_dir_all(&self.worktree_root)
            .map_err(|e| WorktreeError::CreateFailed(format!("worktree root: {e}")))?;

        let branch = Self::branch_name(task, worker_id);
        let mut path = self.worktree_root.join(format!("worker-{worker_id}-{}", task.id));

        // Leftovers from a previous run: remove, or fall back to a retry
        // path when removal fails.
        if path.exists() {
            if let Err(e) = self.remove_worktree(&path).await {
                debug!(error = %e, "stale worktree removal failed; using retry path");
                path = self
                    .worktree_root
                    .join(format!("worker-{worker_id}-{}-retry", task.id));
            }
        }

        // Delete any pre-existing branch by the same name (best effort).
        let _ = self.git(&["branch", "-D", &branch]).await;

        let path_str = path.to_string_lossy().to_string();
        let create = tokio::time::timeout(
            CREATE_TIMEOUT,
            self.git(&["worktree", "add", "-b", &branch, &path_str]),
        )
        .await
        .map_err(|_| WorktreeError::CreateFailed("git worktree add timed out".to_string()))??;

        if !create.status.success() {
            let stderr = String::from_utf8_lossy(&create.stderr);
            return Err(WorktreeError::CreateFailed(stderr.trim().to_string()));
        }

        info!(path = %path.display(), %branch, "created worktree");
        Ok((path, branch))
    }

    pub async fn remove_worktree(&self, path: &Path) -> Result<(), WorktreeError> {
        if !path.exists() {
            return Ok(());
        }
        let path_str = path.to_string_lossy().to_string();
        let output = self.git(&["worktree", "remove", &path_str, "--force"]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::RemoveFailed(stderr.trim().to_string()));
        }
        Ok(())
    }

    /// Worker directories currently on disk.
    pub fn list_worktrees(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.worktree_root) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_dir()
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with("worker-"))
                        .unwrap_or(false)
            })
            .collect()
    }

    /// Remove directories that exist on disk but are no longer registered
    /// with git (leftovers from crashed processes). Returns the count
    /// cleaned.
    pub async fn cleanup_stale_worktrees(&self) -> usize {
        let Ok(output) = self.git(&["worktree", "list", "--porcelain"]).await else {
            return 0;
        };
        if !output.status.success() {
            return 0;
        }

        let registered: Vec<PathBuf> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.strip_prefix("worktree "))
            .map(PathBuf::from)
            .filter_map(|p| p.canonicalize().ok())
            .collect();

        let mut cleaned = 0;
        for path in self.list_worktrees() {
            let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
            if registered.contains(&canonical) {
                continue;
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => cleaned += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stale worktree"),
            }
        }
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::setup_git_repo;
    use prdtrack::PrdKind;
    use tempfile::tempdir;

    fn task(id: &str) -> SelectedTask {
        SelectedTask::new(id, format!("task {id}"), PrdKind::Yaml)
    }

    fn manager(repo: &Path) -> WorktreeManager {
        WorktreeManager::new(repo.to_path_buf(), repo.join(".ralph/worktrees"))
    }

    #[test]
    fn test_branch_name_sanitization() {
        assert_eq!(
            WorktreeManager::branch_name(&task("auth/login step"), 2),
            "ralph/worker-2-task-auth-login-step"
        );
    }

    #[tokio::test]
    async fn test_create_and_remove() {
        let dir = tempdir().unwrap();
        setup_git_repo(dir.path()).await;
        let mgr = manager(dir.path());

        let (path, branch) = mgr.create_worktree(&task("t1"), 0).await.unwrap();
        assert!(path.exists());
        assert_eq!(branch, "ralph/worker-0-task-t1");
        // The worktree is a checkout of the repo.
        assert!(path.join(".git").exists());

        mgr.remove_worktree(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_recreate_over_existing() {
        let dir = tempdir().unwrap();
        setup_git_repo(dir.path()).await;
        let mgr = manager(dir.path());

        let (first, _) = mgr.create_worktree(&task("t1"), 0).await.unwrap();
        // Same worker/task again: the old worktree is replaced.
        let (second, _) = mgr.create_worktree(&task("t1"), 0).await.unwrap();
        assert_eq!(first, second);
        assert!(second.exists());
    }

    #[tokio::test]
    async fn test_list_and_cleanup_stale() {
        let dir = tempdir().unwrap();
        setup_git_repo(dir.path()).await;
        let mgr = manager(dir.path());

        mgr.create_worktree(&task("t1"), 0).await.unwrap();
        // A directory that looks like a worktree but is not registered.
        let stale = dir.path().join(".ralph/worktrees/worker-9-ghost");
        std::fs::create_dir_all(&stale).unwrap();

        assert_eq!(mgr.list_worktrees().len(), 2);
        let cleaned = mgr.cleanup_stale_worktrees().await;
        assert_eq!(cleaned, 1);
        assert!(!stale.exists());
        assert_eq!(mgr.list_worktrees().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let dir = tempdir().unwrap();
        setup_git_repo(dir.path()).await;
        let mgr = manager(dir.path());
        assert!(mgr.remove_worktree(Path::new("/nonexistent/wt")).await.is_ok());
    }
}
