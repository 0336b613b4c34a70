//! Sandbox module for isolated execution environments.
//!
//! This module provides the [`WorkspaceProvider`] trait for creating isolated
//! checkouts, the [`GitWorkspaceProvider`] implementation using git worktrees,
//! and the [`WorktreeManager`] registry that owns live [`Worktree`]s.

mod manager;
mod provider;
mod worktree;

pub use manager::{WorktreeLease, WorktreeManager};
pub use provider::{GitWorkspaceProvider, StatusEntry, WorkspaceProvider, SANDBOX_BRANCH_PREFIX};
pub use worktree::Worktree;
