//! A single isolated worktree: scoped file I/O, command execution, change
//! collection and cleanup.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{Error, Result};
use crate::pattern::canonical_path;
use crate::process::{CommandOutput, RunningCommand};

use super::manager::ManagerInner;
use super::provider::WorkspaceProvider;

/// An isolated checkout of a branch under the managed temp root.
///
/// A worktree is owned by the call that provisioned it, so file operations
/// need no locking beyond the atomics tracking recency.
pub struct Worktree {
    id: String,
    /// Path to the worktree directory.
    path: PathBuf,
    /// Ref the worktree was created from.
    base_ref: String,
    created_at: DateTime<Utc>,
    /// Milliseconds since the epoch of the last operation.
    last_used: AtomicI64,
    /// Set while an execution owns the worktree.
    leased: AtomicBool,
    provider: Arc<dyn WorkspaceProvider>,
    manager: Weak<ManagerInner>,
}

/// Refreshes `last_used` when dropped, covering every exit path.
struct Touch<'a>(&'a Worktree);

impl Drop for Touch<'_> {
    fn drop(&mut self) {
        self.0.touch();
    }
}

impl Worktree {
    pub(crate) fn new(
        id: String,
        path: PathBuf,
        base_ref: String,
        provider: Arc<dyn WorkspaceProvider>,
        manager: Weak<ManagerInner>,
    ) -> Self {
        // Stored at the same millisecond precision as `last_used`.
        let millis = Utc::now().timestamp_millis();
        let now = Utc
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now);
        Self {
            id,
            path,
            base_ref,
            created_at: now,
            last_used: AtomicI64::new(now.timestamp_millis()),
            leased: AtomicBool::new(false),
            provider,
            manager,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the working directory path of the worktree.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base_ref(&self) -> &str {
        &self.base_ref
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        let millis = self.last_used.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or(self.created_at)
    }

    /// Time since the last operation.
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_used()
    }

    /// Marks the worktree as used now. Never moves `last_used` backwards.
    pub fn touch(&self) {
        self.last_used
            .fetch_max(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn is_leased(&self) -> bool {
        self.leased.load(Ordering::SeqCst)
    }

    pub(crate) fn set_leased(&self, leased: bool) {
        self.leased.store(leased, Ordering::SeqCst);
    }

    fn touched(&self) -> Touch<'_> {
        self.touch();
        Touch(self)
    }

    /// Resolves `relative` against the root, rejecting anything that could
    /// land outside it.
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let clean = canonical_path(relative)
            .ok_or_else(|| Error::PathEscape(PathBuf::from(relative)))?;
        if clean.is_empty() {
            return Err(Error::Input(format!("empty file path '{}'", relative)));
        }
        Ok(self.path.join(clean))
    }

    /// Fails if `existing` (which must exist) resolves outside the root,
    /// e.g. through a symlink.
    async fn ensure_contained(&self, existing: &Path) -> Result<()> {
        let root = tokio::fs::canonicalize(&self.path).await?;
        let resolved = tokio::fs::canonicalize(existing).await?;
        if !resolved.starts_with(&root) {
            return Err(Error::PathEscape(existing.to_path_buf()));
        }
        Ok(())
    }

    /// Writes `contents` to `relative`, creating parent directories.
    pub async fn write_file(&self, relative: &str, contents: &[u8]) -> Result<()> {
        let _touch = self.touched();
        let full = self.resolve(relative)?;
        if let Some(parent) = full.parent() {
            // Check before creating anything: a symlinked ancestor must not
            // get directories made on the far side of it.
            let mut existing = parent;
            while tokio::fs::symlink_metadata(existing).await.is_err() {
                existing = existing
                    .parent()
                    .ok_or_else(|| Error::PathEscape(parent.to_path_buf()))?;
            }
            self.ensure_contained(existing).await?;
            tokio::fs::create_dir_all(parent).await?;
            self.ensure_contained(parent).await?;
        }
        if tokio::fs::symlink_metadata(&full).await.is_ok() {
            self.ensure_contained(&full).await?;
        }
        tokio::fs::write(&full, contents).await?;
        Ok(())
    }

    /// Reads `relative`.
    pub async fn read_file(&self, relative: &str) -> Result<Vec<u8>> {
        let _touch = self.touched();
        let full = self.resolve(relative)?;
        if tokio::fs::symlink_metadata(&full).await.is_err() {
            return Err(Error::NotFound(format!("{} in worktree {}", relative, self.id)));
        }
        self.ensure_contained(&full).await?;
        Ok(tokio::fs::read(&full).await?)
    }

    /// Removes `relative`. A missing file is not an error.
    pub async fn remove_file(&self, relative: &str) -> Result<()> {
        let _touch = self.touched();
        let full = self.resolve(relative)?;
        if let Some(parent) = full.parent() {
            if tokio::fs::symlink_metadata(parent).await.is_ok() {
                self.ensure_contained(parent).await?;
            }
        }
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(worktree = %self.id, path = relative, "delete of absent file");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Runs `command` in the worktree root and waits for it.
    ///
    /// No allow/deny gating happens here.
    pub async fn execute(&self, command: &str, args: &[String]) -> Result<CommandOutput> {
        let _touch = self.touched();
        RunningCommand::spawn(&self.path, command, args)?.wait().await
    }

    /// Starts `command` in the worktree root without waiting for it.
    pub fn spawn(&self, command: &str, args: &[String]) -> Result<RunningCommand> {
        let _touch = self.touched();
        RunningCommand::spawn(&self.path, command, args)
    }

    /// Diff between the current state and the base snapshot.
    pub async fn changes(&self) -> Result<String> {
        let _touch = self.touched();
        self.provider.diff(&self.path).await
    }

    /// Stages and commits everything. Returns the commit hash, if anything
    /// was committed.
    pub async fn commit(&self, message: &str) -> Result<Option<String>> {
        let _touch = self.touched();
        self.provider.add(&self.path, &[]).await?;
        self.provider.commit(&self.path, message).await
    }

    /// Removes the worktree through its manager. Idempotent.
    pub async fn cleanup(&self) -> Result<()> {
        let _touch = self.touched();
        let Some(manager) = self.manager.upgrade() else {
            return Ok(());
        };
        match manager.cleanup(&self.id).await {
            Ok(()) => Ok(()),
            Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for Worktree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worktree")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("base_ref", &self.base_ref)
            .field("created_at", &self.created_at)
            .field("last_used", &self.last_used())
            .field("leased", &self.is_leased())
            .finish()
    }
}
