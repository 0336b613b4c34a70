//! Registry of live worktrees: creation, lookup, cleanup and reaping.

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::Span;

use crate::error::{Error, Result};

use super::provider::WorkspaceProvider;
use super::worktree::Worktree;

#[derive(Default)]
struct Registry {
    worktrees: HashMap<String, Arc<Worktree>>,
    /// IDs reserved by creations that have not finished provisioning.
    provisioning: HashSet<String>,
}

impl Registry {
    fn occupied(&self) -> usize {
        self.worktrees.len() + self.provisioning.len()
    }

    fn is_taken(&self, id: &str) -> bool {
        self.worktrees.contains_key(id) || self.provisioning.contains(id)
    }
}

pub(crate) struct ManagerInner {
    provider: Arc<dyn WorkspaceProvider>,
    root: PathBuf,
    max_worktrees: usize,
    registry: RwLock<Registry>,
    span: Span,
}

impl ManagerInner {
    pub(crate) async fn cleanup(&self, id: &str) -> Result<()> {
        let worktree = self
            .registry
            .write()
            .await
            .worktrees
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("worktree {}", id)))?;

        self.destroy(&worktree).await
    }

    async fn destroy(&self, worktree: &Worktree) -> Result<()> {
        self.provider
            .remove_worktree(worktree.path())
            .await
            .map_err(|e| {
                tracing::error!(parent: &self.span, worktree = %worktree.id(), error = %e, "failed to remove worktree");
                e
            })?;
        tracing::info!(parent: &self.span, worktree = %worktree.id(), "cleaned up worktree");
        Ok(())
    }
}

/// Owns the registry of live worktrees.
///
/// Cloning is cheap; clones share the registry.
#[derive(Clone)]
pub struct WorktreeManager {
    inner: Arc<ManagerInner>,
}

impl WorktreeManager {
    /// Creates a manager that provisions worktrees under `root`.
    ///
    /// `max_worktrees == 0` disables the capacity limit.
    pub fn new(
        provider: Arc<dyn WorkspaceProvider>,
        root: impl AsRef<Path>,
        max_worktrees: usize,
    ) -> Result<Self> {
        Self::with_span(
            provider,
            root,
            max_worktrees,
            tracing::info_span!("worktree_manager"),
        )
    }

    /// Like [`WorktreeManager::new`], logging under `span`.
    pub fn with_span(
        provider: Arc<dyn WorkspaceProvider>,
        root: impl AsRef<Path>,
        max_worktrees: usize,
        span: Span,
    ) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = std::fs::canonicalize(root.as_ref())?;

        Ok(Self {
            inner: Arc::new(ManagerInner {
                provider,
                root,
                max_worktrees,
                registry: RwLock::new(Registry::default()),
                span,
            }),
        })
    }

    /// The directory all worktrees live under.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn max_worktrees(&self) -> usize {
        self.inner.max_worktrees
    }

    /// Provisions a new worktree from `base_ref`.
    pub async fn create_worktree(&self, base_ref: &str) -> Result<Arc<Worktree>> {
        self.provision(base_ref, false).await
    }

    /// Provisions a worktree owned exclusively by the returned lease.
    ///
    /// Leased worktrees are never reaped; the lease removes the worktree on
    /// release.
    pub async fn acquire(&self, base_ref: &str) -> Result<WorktreeLease> {
        let worktree = self.provision(base_ref, true).await?;
        Ok(WorktreeLease {
            worktree,
            released: false,
        })
    }

    async fn provision(&self, base_ref: &str, leased: bool) -> Result<Arc<Worktree>> {
        let id = {
            let mut registry = self.inner.registry.write().await;
            let occupied = registry.occupied();
            if self.inner.max_worktrees > 0 && occupied >= self.inner.max_worktrees {
                tracing::warn!(parent: &self.inner.span, occupied, max = self.inner.max_worktrees, "worktree capacity exceeded");
                return Err(Error::CapacityExceeded {
                    active: occupied,
                    max: self.inner.max_worktrees,
                });
            }
            let mut id = generate_worktree_id();
            while registry.is_taken(&id) {
                id = generate_worktree_id();
            }
            registry.provisioning.insert(id.clone());
            id
        };

        let path = self.inner.root.join(&id);
        let created = if path.starts_with(&self.inner.root) {
            self.inner.provider.create_worktree(base_ref, &path).await
        } else {
            Err(Error::PathEscape(path.clone()))
        };

        let mut registry = self.inner.registry.write().await;
        registry.provisioning.remove(&id);

        if let Err(e) = created {
            tracing::error!(parent: &self.inner.span, worktree = %id, base_ref, error = %e, "failed to provision worktree");
            return Err(match e {
                Error::Provisioning(_) => e,
                other => Error::Provisioning(other.to_string()),
            });
        }

        let worktree = Arc::new(Worktree::new(
            id.clone(),
            path,
            base_ref.to_string(),
            Arc::clone(&self.inner.provider),
            Arc::downgrade(&self.inner),
        ));
        worktree.set_leased(leased);
        registry.worktrees.insert(id.clone(), Arc::clone(&worktree));

        tracing::info!(parent: &self.inner.span, worktree = %id, base_ref, leased, "created worktree");
        Ok(worktree)
    }

    /// Looks up a worktree and marks it as used.
    pub async fn get_worktree(&self, id: &str) -> Result<Arc<Worktree>> {
        let registry = self.inner.registry.read().await;
        let worktree = registry
            .worktrees
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("worktree {}", id)))?;
        worktree.touch();
        Ok(worktree)
    }

    /// Snapshot of all registered worktrees, oldest first.
    pub async fn list_worktrees(&self) -> Vec<Arc<Worktree>> {
        let mut worktrees: Vec<_> = self
            .inner
            .registry
            .read()
            .await
            .worktrees
            .values()
            .cloned()
            .collect();
        worktrees.sort_by_key(|w| w.created_at());
        worktrees
    }

    pub async fn len(&self) -> usize {
        self.inner.registry.read().await.worktrees.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Unregisters and destroys a worktree.
    pub async fn cleanup_worktree(&self, id: &str) -> Result<()> {
        self.inner.cleanup(id).await
    }

    /// Reaps every unleased worktree idle for longer than `max_age`.
    ///
    /// Staleness is judged against the worktree's recency at removal time.
    /// Failures are logged and do not stop the sweep. Returns the number of
    /// worktrees removed.
    pub async fn cleanup_old_worktrees(&self, max_age: Duration) -> usize {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let candidates: Vec<String> = self
            .inner
            .registry
            .read()
            .await
            .worktrees
            .keys()
            .cloned()
            .collect();

        let mut reaped = 0;
        for id in candidates {
            let stale = {
                let mut registry = self.inner.registry.write().await;
                let is_stale = registry.worktrees.get(&id).is_some_and(|w| {
                    !w.is_leased() && w.idle_for(Utc::now()).num_milliseconds() > max_age_ms
                });
                if is_stale {
                    registry.worktrees.remove(&id)
                } else {
                    None
                }
            };

            if let Some(worktree) = stale {
                match self.inner.destroy(&worktree).await {
                    Ok(()) => reaped += 1,
                    Err(e) => {
                        tracing::warn!(parent: &self.inner.span, worktree = %id, error = %e, "failed to reap stale worktree");
                    }
                }
            }
        }

        if reaped > 0 {
            tracing::info!(parent: &self.inner.span, reaped, "reaped stale worktrees");
        }
        reaped
    }
}

/// Generates `wt-<utc timestamp>-<random suffix>`.
fn generate_worktree_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "wt-{}-{}",
        Utc::now().format("%Y%m%d%H%M%S%3f"),
        &suffix[..8]
    )
}

/// Exclusive ownership of a worktree for the duration of one execution.
///
/// Call [`WorktreeLease::release`] to remove the worktree. A lease dropped
/// without release schedules the removal on the current runtime.
pub struct WorktreeLease {
    worktree: Arc<Worktree>,
    released: bool,
}

impl WorktreeLease {
    pub fn worktree(&self) -> &Arc<Worktree> {
        &self.worktree
    }

    /// Ends the lease and removes the worktree.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.worktree.set_leased(false);
        self.worktree.cleanup().await
    }
}

impl Deref for WorktreeLease {
    type Target = Worktree;

    fn deref(&self) -> &Worktree {
        &self.worktree
    }
}

impl Drop for WorktreeLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.worktree.set_leased(false);
        let worktree = Arc::clone(&self.worktree);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = worktree.cleanup().await {
                        tracing::error!(worktree = %worktree.id(), error = %e, "failed to cleanup worktree on drop");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(worktree = %worktree.id(), "lease dropped outside a runtime, worktree left for the reaper");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sandbox::GitWorkspaceProvider;
    use std::process::Command;
    use tempfile::TempDir;

    /// Helper to create a temp git repo for testing.
    fn create_temp_git_repo() -> TempDir {
        let temp_dir = TempDir::new().expect("failed to create temp dir");

        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test User"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(temp_dir.path())
                .output()
                .expect("failed to configure git repo");
        }

        std::fs::write(temp_dir.path().join("README.md"), "# Test Repo\n")
            .expect("failed to write README");

        for args in [vec!["add", "."], vec!["commit", "-m", "Initial commit"]] {
            Command::new("git")
                .args(&args)
                .current_dir(temp_dir.path())
                .output()
                .expect("failed to create initial commit");
        }

        temp_dir
    }

    struct Fixture {
        _repo: TempDir,
        _root: TempDir,
        manager: WorktreeManager,
    }

    fn fixture(max_worktrees: usize) -> Fixture {
        let repo = create_temp_git_repo();
        let root = TempDir::new().unwrap();
        let provider = Arc::new(GitWorkspaceProvider::new(repo.path().to_path_buf()));
        let manager = WorktreeManager::new(provider, root.path(), max_worktrees).unwrap();
        Fixture {
            _repo: repo,
            _root: root,
            manager,
        }
    }

    #[test]
    fn worktree_ids_are_unique_and_prefixed() {
        let a = generate_worktree_id();
        let b = generate_worktree_id();
        assert_ne!(a, b);
        assert!(a.starts_with("wt-"));
    }

    #[tokio::test]
    async fn creates_and_looks_up_worktrees() {
        let f = fixture(10);
        let wt = f.manager.create_worktree("HEAD").await.unwrap();

        assert!(wt.path().starts_with(f.manager.root()));
        assert!(wt.path().join("README.md").exists());
        assert_eq!(wt.base_ref(), "HEAD");

        let found = f.manager.get_worktree(wt.id()).await.unwrap();
        assert_eq!(found.id(), wt.id());
        assert!(found.last_used() >= wt.created_at());

        let listed = f.manager.list_worktrees().await;
        assert_eq!(listed.len(), 1);

        let err = f.manager.get_worktree("wt-missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn cleanup_twice_is_ok_then_not_found() {
        let f = fixture(10);
        let a = f.manager.create_worktree("HEAD").await.unwrap();
        let b = f.manager.create_worktree("HEAD").await.unwrap();

        f.manager.cleanup_worktree(a.id()).await.unwrap();
        assert!(!a.path().exists());

        let err = f.manager.cleanup_worktree(a.id()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        assert!(f.manager.get_worktree(b.id()).await.is_ok());
        assert!(b.path().exists());
    }

    #[tokio::test]
    async fn cleanup_tolerates_missing_directory() {
        let f = fixture(10);
        let wt = f.manager.create_worktree("HEAD").await.unwrap();
        std::fs::remove_dir_all(wt.path()).unwrap();

        f.manager.cleanup_worktree(wt.id()).await.unwrap();
        assert!(f.manager.is_empty().await);
    }

    #[tokio::test]
    async fn bad_ref_is_a_provisioning_error_and_frees_the_slot() {
        let f = fixture(1);
        let err = f.manager.create_worktree("no-such-ref").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Provisioning);

        assert!(f.manager.create_worktree("HEAD").await.is_ok());
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let f = fixture(2);
        let a = f.manager.create_worktree("HEAD").await.unwrap();
        f.manager.create_worktree("HEAD").await.unwrap();

        let err = f.manager.create_worktree("HEAD").await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { active: 2, max: 2 }));

        f.manager.cleanup_worktree(a.id()).await.unwrap();
        assert!(f.manager.create_worktree("HEAD").await.is_ok());
    }

    #[tokio::test]
    async fn reaper_removes_only_idle_unleased_worktrees() {
        let f = fixture(10);
        let idle = f.manager.create_worktree("HEAD").await.unwrap();
        let busy = f.manager.create_worktree("HEAD").await.unwrap();
        let lease = f.manager.acquire("HEAD").await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        busy.touch();

        let reaped = f
            .manager
            .cleanup_old_worktrees(Duration::from_millis(200))
            .await;
        assert_eq!(reaped, 1);

        assert!(f.manager.get_worktree(idle.id()).await.is_err());
        assert!(!idle.path().exists());
        assert!(f.manager.get_worktree(busy.id()).await.is_ok());
        assert!(f.manager.get_worktree(lease.id()).await.is_ok());

        lease.release().await.unwrap();
        assert_eq!(f.manager.len().await, 1);
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let f = fixture(10);
        let wt = f.manager.create_worktree("HEAD").await.unwrap();

        let bytes = b"fn main() {}\n\x00\xff".to_vec();
        wt.write_file("src/deep/nested/main.rs", &bytes).await.unwrap();
        assert_eq!(wt.read_file("src/deep/nested/main.rs").await.unwrap(), bytes);

        let err = wt.read_file("missing.txt").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn escaping_paths_are_rejected() {
        let f = fixture(10);
        let wt = f.manager.create_worktree("HEAD").await.unwrap();

        for path in ["../outside.txt", "/etc/passwd", "a/../../b.txt"] {
            let err = wt.write_file(path, b"x").await.unwrap_err();
            assert!(matches!(err, Error::PathEscape(_)), "{} was accepted", path);
        }

        #[cfg(unix)]
        {
            let outside = TempDir::new().unwrap();
            std::os::unix::fs::symlink(outside.path(), wt.path().join("link")).unwrap();
            let err = wt.write_file("link/evil.txt", b"x").await.unwrap_err();
            assert!(matches!(err, Error::PathEscape(_)));
            assert!(!outside.path().join("evil.txt").exists());
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_parents_are_not_followed_outside_the_root() {
        let f = fixture(10);
        let wt = f.manager.create_worktree("HEAD").await.unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("keep.txt"), "precious").unwrap();
        std::os::unix::fs::symlink(outside.path(), wt.path().join("link")).unwrap();

        let err = wt.write_file("link/newdir/evil.txt", b"x").await.unwrap_err();
        assert!(matches!(err, Error::PathEscape(_)));
        assert!(!outside.path().join("newdir").exists());

        let err = wt.remove_file("link/keep.txt").await.unwrap_err();
        assert!(matches!(err, Error::PathEscape(_)));
        assert!(outside.path().join("keep.txt").exists());
    }

    #[tokio::test]
    async fn redundant_segments_resolve_to_the_canonical_file() {
        let f = fixture(10);
        let wt = f.manager.create_worktree("HEAD").await.unwrap();

        wt.write_file("docs/./guide//intro.md", b"hi").await.unwrap();
        assert_eq!(std::fs::read(wt.path().join("docs/guide/intro.md")).unwrap(), b"hi");

        wt.remove_file("docs//guide/./intro.md").await.unwrap();
        assert!(!wt.path().join("docs/guide/intro.md").exists());
    }

    #[tokio::test]
    async fn fresh_worktree_was_last_used_at_creation() {
        let f = fixture(10);
        let wt = f.manager.create_worktree("HEAD").await.unwrap();
        let created = wt.created_at();
        assert_eq!(created.timestamp_subsec_nanos() % 1_000_000, 0);
        assert!(wt.last_used() >= created);
    }

    #[tokio::test]
    async fn operations_refresh_last_used_even_on_failure() {
        let f = fixture(10);
        let wt = f.manager.create_worktree("HEAD").await.unwrap();
        let before = wt.last_used();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(wt.read_file("nope.txt").await.is_err());
        assert!(wt.last_used() > before);
    }

    #[tokio::test]
    async fn executes_commands_and_reports_changes() {
        let f = fixture(10);
        let wt = f.manager.create_worktree("HEAD").await.unwrap();

        wt.write_file("hello.txt", b"hello\n").await.unwrap();
        wt.remove_file("README.md").await.unwrap();
        wt.remove_file("README.md").await.unwrap();

        let output = wt.execute("cat", &["hello.txt".to_string()]).await.unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.output, "hello\n");

        let diff = wt.changes().await.unwrap();
        assert!(diff.contains("hello.txt"));
        assert!(diff.contains("README.md"));

        let hash = wt.commit("apply sandbox changes").await.unwrap();
        assert!(hash.is_some());
        assert!(wt.changes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn worktree_cleanup_is_idempotent() {
        let f = fixture(10);
        let wt = f.manager.create_worktree("HEAD").await.unwrap();

        wt.cleanup().await.unwrap();
        wt.cleanup().await.unwrap();
        assert!(f.manager.is_empty().await);
    }

    #[tokio::test]
    async fn dropped_lease_still_removes_worktree() {
        let f = fixture(10);
        let lease = f.manager.acquire("HEAD").await.unwrap();
        let path = lease.path().to_path_buf();
        drop(lease);

        for _ in 0..50 {
            if f.manager.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(f.manager.is_empty().await);
        assert!(!path.exists());
    }
}
