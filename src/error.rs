//! Error types for the sandboxed execution engine.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ExecutionResponse;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Malformed request (unknown operation, missing field).
    Input,
    /// Rule violation (size, content, security).
    Validation,
    /// Workspace create/remove failure or capacity exhaustion.
    Provisioning,
    /// Spawn failure, required step failure, gating rejection, deadline.
    Execution,
    /// Lookup of an unknown worktree or file.
    NotFound,
    /// Anything else.
    Internal,
}

/// The rule family a [`RuleViolation`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    TooManyFiles,
    FileTooLarge,
    TotalSizeExceeded,
    OperationBlocked,
    OperationNotAllowed,
    BlockedContent,
    MissingRequiredContent,
    PathTraversal,
    BlockedExtension,
    BlockedPath,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViolationKind::TooManyFiles => "too many files",
            ViolationKind::FileTooLarge => "file too large",
            ViolationKind::TotalSizeExceeded => "total size too large",
            ViolationKind::OperationBlocked => "operation blocked",
            ViolationKind::OperationNotAllowed => "operation not allowed",
            ViolationKind::BlockedContent => "blocked content",
            ViolationKind::MissingRequiredContent => "missing required content",
            ViolationKind::PathTraversal => "path traversal",
            ViolationKind::BlockedExtension => "blocked extension",
            ViolationKind::BlockedPath => "blocked path",
        };
        f.write_str(s)
    }
}

/// A rule violation found while validating a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleViolation {
    /// Which family of rule was violated.
    pub kind: ViolationKind,
    /// Name of the violated rule.
    pub rule: String,
    /// Offending file, if the violation is tied to one.
    pub file: Option<String>,
    /// Human-readable detail.
    pub message: String,
}

impl RuleViolation {
    pub fn new(kind: ViolationKind, rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            rule: rule.into(),
            file: None,
            message: message.into(),
        }
    }

    /// Attaches the offending file.
    pub fn in_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }
}

impl fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (rule '{}'", self.kind, self.rule)?;
        if let Some(file) = &self.file {
            write!(f, ", file '{}'", file)?;
        }
        write!(f, "): {}", self.message)
    }
}

impl std::error::Error for RuleViolation {}

/// Top-level error type for sandbox operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The request is malformed.
    #[error("invalid request: {0}")]
    Input(String),

    /// The request violates a validation rule.
    #[error("validation failed: {0}")]
    Validation(#[from] RuleViolation),

    /// Failed to create or remove a worktree.
    #[error("failed to provision worktree: {0}")]
    Provisioning(String),

    /// The worktree registry is full.
    #[error("capacity exceeded: {active} of {max} worktrees in use")]
    CapacityExceeded { active: usize, max: usize },

    /// Unknown worktree ID or missing file.
    #[error("not found: {0}")]
    NotFound(String),

    /// A path resolved outside the worktree root.
    #[error("path escapes worktree root: {0}")]
    PathEscape(PathBuf),

    /// The command is not allow-listed or is deny-listed.
    #[error("command not allowed: {0}")]
    CommandNotAllowed(String),

    /// The command could not be started.
    #[error("failed to spawn {command}: {reason}")]
    Spawn { command: String, reason: String },

    /// A required validation step exited non-zero.
    #[error("required step '{step}' failed with exit code {exit_code}")]
    StepFailed { step: String, exit_code: i32 },

    /// The execution deadline elapsed.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// Git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// IO error during sandbox operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unexpected failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// An error annotated with the operation that produced it.
    #[error("{op}: {source}")]
    Context {
        op: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wraps this error with the name of the failing operation.
    pub fn context(self, op: &'static str) -> Self {
        Error::Context {
            op,
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, looking through context wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Input(_) | Error::PathEscape(_) => ErrorKind::Input,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Provisioning(_) | Error::CapacityExceeded { .. } | Error::Git(_) => {
                ErrorKind::Provisioning
            }
            Error::CommandNotAllowed(_)
            | Error::Spawn { .. }
            | Error::StepFailed { .. }
            | Error::Timeout(_) => ErrorKind::Execution,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Io(_) | Error::Config(_) | Error::Internal(_) => ErrorKind::Internal,
            Error::Context { source, .. } => source.kind(),
        }
    }

    /// Returns true if the error is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Error::Timeout(_))
    }

    /// Returns the rule violation, if this is a validation error.
    pub fn violation(&self) -> Option<&RuleViolation> {
        match self.root() {
            Error::Validation(v) => Some(v),
            _ => None,
        }
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A failed execution together with the best-effort response.
///
/// Step failures keep the partial results gathered before the failure.
#[derive(Error, Debug)]
#[error("execution {} failed: {error}", .response.request_id)]
pub struct ExecutionFailure {
    pub error: Error,
    pub response: Box<ExecutionResponse>,
}

impl ExecutionFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}
