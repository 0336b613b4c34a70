//! Request and response model for sandboxed executions.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Operation applied to a single file.
///
/// Unknown operation strings deserialize into [`FileOperation::Unsupported`]
/// so the engine can reject them as input errors instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FileOperation {
    Create,
    Update,
    Delete,
    Unsupported(String),
}

impl FileOperation {
    pub fn as_str(&self) -> &str {
        match self {
            FileOperation::Create => "create",
            FileOperation::Update => "update",
            FileOperation::Delete => "delete",
            FileOperation::Unsupported(op) => op,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, FileOperation::Unsupported(_))
    }
}

impl From<String> for FileOperation {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "create" => FileOperation::Create,
            "update" => FileOperation::Update,
            "delete" => FileOperation::Delete,
            _ => FileOperation::Unsupported(s),
        }
    }
}

impl From<FileOperation> for String {
    fn from(op: FileOperation) -> Self {
        op.as_str().to_string()
    }
}

impl fmt::Display for FileOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proposed change to one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Path relative to the worktree root.
    pub path: String,
    /// New file content (ignored for deletes).
    #[serde(default)]
    pub content: String,
    pub operation: FileOperation,
}

impl FileChange {
    pub fn create(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            operation: FileOperation::Create,
        }
    }

    pub fn update(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            operation: FileOperation::Update,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: String::new(),
            operation: FileOperation::Delete,
        }
    }

    /// Size of the content in bytes.
    pub fn size(&self) -> usize {
        self.content.len()
    }
}

/// A verification command run after the changes are applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationStep {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// A required step that exits non-zero fails the whole execution.
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

impl ValidationStep {
    /// Creates a required step.
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            required: true,
            description: String::new(),
        }
    }

    /// Marks the step as optional.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Renders the command line, e.g. `cargo test --quiet`.
    pub fn command_line(&self) -> String {
        render_command_line(&self.command, &self.args)
    }
}

pub(crate) fn render_command_line(command: &str, args: &[String]) -> String {
    std::iter::once(command)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A request to apply changes and verify them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub id: String,
    #[serde(rename = "type", default)]
    pub request_type: String,
    #[serde(default)]
    pub changes: Vec<FileChange>,
    #[serde(default)]
    pub steps: Vec<ValidationStep>,
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ExecutionRequest {
    /// Creates an empty request with a fresh ID.
    pub fn new(request_type: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request_type: request_type.into(),
            ..Default::default()
        }
    }

    pub fn with_change(mut self, change: FileChange) -> Self {
        self.changes.push(change);
        self
    }

    pub fn with_step(mut self, step: ValidationStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Total content size across all changes.
    pub fn total_size(&self) -> usize {
        self.changes.iter().map(FileChange::size).sum()
    }

    /// Checks the request is well formed.
    pub fn check(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Input("request id is required".to_string()));
        }
        for change in &self.changes {
            if change.path.trim().is_empty() {
                return Err(Error::Input("file change path is required".to_string()));
            }
            if !change.operation.is_supported() {
                return Err(Error::Input(format!(
                    "unsupported operation '{}' for {}",
                    change.operation, change.path
                )));
            }
        }
        for step in &self.steps {
            if step.command.trim().is_empty() {
                return Err(Error::Input(format!(
                    "validation step '{}' has no command",
                    step.name
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of one validation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub command: String,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: i32,
    pub worktree_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Timeout
        )
    }
}

/// Response for an execution request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub request_id: String,
    pub worktree_id: Option<String>,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub results: Vec<ExecutionResult>,
    pub diff: String,
    pub error: Option<String>,
}

impl ExecutionResponse {
    /// Creates a pending response.
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            worktree_id: None,
            status: ExecutionStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            results: Vec::new(),
            diff: String::new(),
            error: None,
        }
    }

    /// Pending -> Running. Returns false if the response was not pending.
    pub fn start(&mut self) -> bool {
        if self.status != ExecutionStatus::Pending {
            tracing::warn!(request_id = %self.request_id, status = ?self.status, "ignoring start of non-pending execution");
            return false;
        }
        self.status = ExecutionStatus::Running;
        true
    }

    /// Running -> Completed.
    pub fn complete(&mut self) -> bool {
        self.finish(ExecutionStatus::Completed, None)
    }

    /// Running -> Failed, recording the error.
    pub fn fail(&mut self, error: &Error) -> bool {
        self.finish(ExecutionStatus::Failed, Some(error.to_string()))
    }

    /// Running -> Timeout, recording the error.
    pub fn time_out(&mut self, error: &Error) -> bool {
        self.finish(ExecutionStatus::Timeout, Some(error.to_string()))
    }

    fn finish(&mut self, status: ExecutionStatus, error: Option<String>) -> bool {
        if self.status != ExecutionStatus::Running {
            tracing::warn!(
                request_id = %self.request_id,
                from = ?self.status,
                to = ?status,
                "ignoring invalid status transition"
            );
            return false;
        }
        self.status = status;
        self.error = error;
        self.end_time = Some(Utc::now());
        true
    }

    /// Wall-clock duration, if the execution has finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}
