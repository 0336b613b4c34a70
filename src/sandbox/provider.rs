//! Workspace provider trait and the git worktree implementation.

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{Error, Result};

/// Prefix for the branches backing sandbox worktrees.
pub const SANDBOX_BRANCH_PREFIX: &str = "sandbox/";

/// One line of `git status --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    /// Two-character status code, e.g. `" M"` or `"??"`.
    pub code: String,
    pub path: String,
}

/// Version-control primitives consumed by the sandbox core.
///
/// Any snapshotting mechanism that can create an isolated directory from a
/// ref and report changes inside it can stand in for git.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Creates an isolated checkout of `base_ref` at `path`.
    async fn create_worktree(&self, base_ref: &str, path: &Path) -> Result<()>;

    /// Destroys the checkout at `path`. Must succeed if `path` is already gone.
    async fn remove_worktree(&self, path: &Path) -> Result<()>;

    /// Diff of the working tree (including new files) against the base snapshot.
    async fn diff(&self, path: &Path) -> Result<String>;

    /// Diff of the staged changes.
    async fn staged_diff(&self, path: &Path) -> Result<String>;

    /// Stages `files`, or everything if `files` is empty.
    async fn add(&self, path: &Path, files: &[String]) -> Result<()>;

    /// Commits staged changes. Returns the commit hash, or `None` if there
    /// was nothing to commit.
    async fn commit(&self, path: &Path, message: &str) -> Result<Option<String>>;

    async fn current_branch(&self, path: &Path) -> Result<String>;

    async fn status(&self, path: &Path) -> Result<Vec<StatusEntry>>;
}

/// Provider that creates sandboxes using git worktrees.
#[derive(Debug, Clone)]
pub struct GitWorkspaceProvider {
    /// Path to the git repository.
    repo_path: PathBuf,
}

impl GitWorkspaceProvider {
    pub fn new(repo_path: PathBuf) -> Self {
        Self { repo_path }
    }

    /// Returns the path to the repository root.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn branch_for(path: &Path) -> Result<String> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::Provisioning(format!("invalid worktree path: {}", path.display()))
            })?;
        Ok(format!("{}{}", SANDBOX_BRANCH_PREFIX, name))
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .current_dir(dir)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Git(format!("failed to run git {}: {}", args.join(" "), e)))
    }

    /// Runs git and fails on a non-zero exit, returning stdout.
    async fn git_checked(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = self.git(dir, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl WorkspaceProvider for GitWorkspaceProvider {
    async fn create_worktree(&self, base_ref: &str, path: &Path) -> Result<()> {
        let branch = Self::branch_for(path)?;
        let path_str = path.to_string_lossy();

        // Create the worktree with a new branch (run from repo dir)
        let output = self
            .git(
                &self.repo_path,
                &["worktree", "add", "-b", &branch, &path_str, base_ref],
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Provisioning(format!(
                "git worktree add failed: {}",
                stderr.trim()
            )));
        }

        tracing::info!(path = ?path, branch = %branch, base_ref, "created sandbox worktree");
        Ok(())
    }

    async fn remove_worktree(&self, path: &Path) -> Result<()> {
        let branch = Self::branch_for(path)?;

        if path.exists() {
            let path_str = path.to_string_lossy();
            let output = self
                .git(&self.repo_path, &["worktree", "remove", "--force", &path_str])
                .await?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(Error::Provisioning(format!(
                    "git worktree remove failed for {}: {}",
                    path.display(),
                    stderr.trim()
                )));
            }
        } else {
            // Directory already gone; drop git's stale bookkeeping.
            let output = self.git(&self.repo_path, &["worktree", "prune"]).await?;
            if !output.status.success() {
                tracing::warn!(path = ?path, "git worktree prune failed");
            }
        }

        let output = self.git(&self.repo_path, &["branch", "-D", &branch]).await?;
        if !output.status.success() {
            // Branch deletion failure is non-fatal - worktree is already gone
            tracing::warn!(
                branch = %branch,
                "failed to delete worktree branch, may need manual cleanup"
            );
        }

        tracing::info!(path = ?path, "removed sandbox worktree");
        Ok(())
    }

    async fn diff(&self, path: &Path) -> Result<String> {
        // Record untracked files so they show up in the diff.
        let untracked = self
            .git_checked(path, &["ls-files", "--others", "--exclude-standard"])
            .await?;
        let untracked: Vec<&str> = untracked.lines().filter(|l| !l.is_empty()).collect();
        if !untracked.is_empty() {
            let mut args = vec!["add", "--intent-to-add", "--"];
            args.extend(untracked);
            self.git_checked(path, &args).await?;
        }
        self.git_checked(path, &["diff", "HEAD"]).await
    }

    async fn staged_diff(&self, path: &Path) -> Result<String> {
        self.git_checked(path, &["diff", "--cached"]).await
    }

    async fn add(&self, path: &Path, files: &[String]) -> Result<()> {
        let mut args = vec!["add"];
        if files.is_empty() {
            args.push("--all");
        } else {
            args.push("--");
            args.extend(files.iter().map(String::as_str));
        }
        self.git_checked(path, &args).await.map(|_| ())
    }

    async fn commit(&self, path: &Path, message: &str) -> Result<Option<String>> {
        let staged = self
            .git(path, &["diff", "--cached", "--quiet"])
            .await?;
        if staged.status.success() {
            return Ok(None);
        }

        self.git_checked(path, &["commit", "-m", message]).await?;
        let hash = self.git_checked(path, &["rev-parse", "HEAD"]).await?;
        Ok(Some(hash.trim().to_string()))
    }

    async fn current_branch(&self, path: &Path) -> Result<String> {
        let branch = self
            .git_checked(path, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        Ok(branch.trim().to_string())
    }

    async fn status(&self, path: &Path) -> Result<Vec<StatusEntry>> {
        let output = self
            .git_checked(path, &["status", "--porcelain"])
            .await?;
        Ok(parse_porcelain(&output))
    }
}

fn parse_porcelain(output: &str) -> Vec<StatusEntry> {
    output
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| StatusEntry {
            code: line[..2].to_string(),
            path: line[3..].to_string(),
        })
        .collect()
}
