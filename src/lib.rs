//! Worktree Sandbox - verifies proposed code changes in disposable git worktrees
//!
//! This library applies a set of file changes inside an isolated git worktree,
//! checks them against declarative validation rules, runs build/test/lint
//! commands under a deadline with allow/deny gating, and reports per-step
//! results and the resulting diff.

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod logging;
pub mod manager;
pub mod pattern;
pub mod process;
pub mod rules;
pub mod sandbox;
pub mod types;
pub mod validator;

pub use config::{
    LanguageCommands, ProjectConfig, SandboxConfig, Validate, ValidationResult, KNOWN_COMMANDS,
};
pub use error::{Error, ErrorKind, ExecutionFailure, RuleViolation, ViolationKind};
pub use events::{
    ChannelObserver, EventManager, EventObserver, ObserverId, SandboxEvent, SandboxEventType,
};
pub use executor::{Executor, ExecutorConfig};
pub use logging::{build_dispatch, LogConfig, LogFormat};
pub use manager::{Manager, MetricsSnapshot};
pub use rules::{ContentRule, FileRule, Rules, SecurityRule, SizeRule};
pub use sandbox::{
    GitWorkspaceProvider, WorkspaceProvider, Worktree, WorktreeLease, WorktreeManager,
};
pub use types::{
    ExecutionRequest, ExecutionResponse, ExecutionResult, ExecutionStatus, FileChange,
    FileOperation, ValidationStep,
};
pub use validator::{PathRules, Validator};
