//! Runs one execution request end to end.
//!
//! A request goes through validate, provision, apply, run steps and finalize.
//! Each request gets a freshly provisioned worktree that is released on every
//! exit path, and its steps share one deadline derived from the configured
//! timeout.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Span;

use crate::config::{program_name, ProjectConfig, SandboxConfig};
use crate::error::{Error, ExecutionFailure, Result};
use crate::process::{CommandOutcome, NO_EXIT_CODE};
use crate::sandbox::{Worktree, WorktreeManager};
use crate::types::{
    ExecutionRequest, ExecutionResponse, ExecutionResult, FileChange, FileOperation,
    ValidationStep,
};
use crate::validator::Validator;

/// Reaper ticks are never shorter than this.
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(10);

/// Settings the executor runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Ref every worktree is provisioned from.
    pub base_ref: String,
    /// Budget for all steps of one request.
    pub timeout: Duration,
    /// Reaper tick. Worktrees idle for twice this long are removed.
    pub cleanup_interval: Duration,
    /// Commands steps may run. A bare name admits only that name (resolved
    /// through `PATH`); an entry with a directory admits only that path.
    pub allowed_commands: HashSet<String>,
    /// Program names steps may never run, even if allowed.
    pub blocked_commands: HashSet<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_config(&SandboxConfig::default(), None)
    }
}

impl ExecutorConfig {
    /// Builds the executor settings, seeding the allow-list from `project`
    /// when the config asks for it.
    pub fn from_config(config: &SandboxConfig, project: Option<&ProjectConfig>) -> Self {
        let execution = &config.execution;

        let mut allowed: HashSet<String> = execution
            .allowed_commands
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if execution.seed_from_project {
            if let Some(project) = project {
                allowed.extend(project.command_names());
            }
        }

        let blocked = execution
            .blocked_commands
            .iter()
            .map(|c| program_name(c.trim()).to_string())
            .filter(|c| !c.is_empty())
            .collect();

        Self {
            base_ref: config.workspace.base_ref.clone(),
            timeout: execution.timeout(),
            cleanup_interval: execution.cleanup_interval(),
            allowed_commands: allowed,
            blocked_commands: blocked,
        }
    }

    /// Deny by default: a command runs only if it is allowed verbatim and
    /// its program name is not blocked.
    pub fn is_command_allowed(&self, command: &str) -> bool {
        let command = command.trim();
        let name = program_name(command);
        if name.is_empty() || self.blocked_commands.contains(name) {
            return false;
        }
        self.allowed_commands.contains(command)
    }
}

/// Result of running one step.
struct StepRun {
    result: ExecutionResult,
    timed_out: bool,
}

/// Orchestrates execution requests.
///
/// Owns a background reaper that removes idle worktrees; it is stopped when
/// the executor is dropped.
pub struct Executor {
    config: ExecutorConfig,
    validator: Arc<Validator>,
    worktrees: WorktreeManager,
    reaper: JoinHandle<()>,
    span: Span,
}

impl Executor {
    /// Creates an executor and starts its reaper on the current runtime.
    pub fn new(
        config: ExecutorConfig,
        validator: Arc<Validator>,
        worktrees: WorktreeManager,
    ) -> Result<Self> {
        Self::with_span(config, validator, worktrees, tracing::info_span!("executor"))
    }

    pub fn with_span(
        config: ExecutorConfig,
        validator: Arc<Validator>,
        worktrees: WorktreeManager,
        span: Span,
    ) -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("executor requires a tokio runtime: {}", e)))?;

        let reaper = handle.spawn(reap_idle_worktrees(
            worktrees.clone(),
            config.cleanup_interval.max(MIN_CLEANUP_INTERVAL),
            span.clone(),
        ));

        tracing::info!(
            parent: &span,
            base_ref = %config.base_ref,
            timeout = ?config.timeout,
            allowed = config.allowed_commands.len(),
            blocked = config.blocked_commands.len(),
            "executor ready"
        );

        Ok(Self {
            config,
            validator,
            worktrees,
            reaper,
            span,
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn validator(&self) -> &Arc<Validator> {
        &self.validator
    }

    pub fn worktrees(&self) -> &WorktreeManager {
        &self.worktrees
    }

    /// See [`ExecutorConfig::is_command_allowed`].
    pub fn is_command_allowed(&self, command: &str) -> bool {
        self.config.is_command_allowed(command)
    }

    /// Validates `request`, applies it in a fresh worktree and runs its steps.
    ///
    /// On failure the returned [`ExecutionFailure`] carries the response with
    /// whatever results were gathered before the failure.
    pub async fn execute_code(
        &self,
        request: &ExecutionRequest,
    ) -> std::result::Result<ExecutionResponse, ExecutionFailure> {
        let span = tracing::info_span!(parent: &self.span, "execution", request_id = %request.id);
        let mut response = ExecutionResponse::new(&request.id);
        response.start();

        tracing::info!(parent: &span, files = request.changes.len(), steps = request.steps.len(), "execution started");

        match self.run(request, &mut response, &span).await {
            Ok(()) => {
                response.complete();
                tracing::info!(parent: &span, results = response.results.len(), "execution completed");
                Ok(response)
            }
            Err(error) => {
                if error.is_timeout() {
                    response.time_out(&error);
                } else {
                    response.fail(&error);
                }
                tracing::warn!(parent: &span, status = ?response.status, error = %error, "execution failed");
                Err(ExecutionFailure {
                    error,
                    response: Box::new(response),
                })
            }
        }
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        response: &mut ExecutionResponse,
        span: &Span,
    ) -> Result<()> {
        request.check().map_err(|e| e.context("validate"))?;
        self.validator
            .validate_request(request)
            .map_err(|v| Error::from(v).context("validate"))?;

        let lease = self
            .worktrees
            .acquire(&self.config.base_ref)
            .await
            .map_err(|e| e.context("provision"))?;
        response.worktree_id = Some(lease.id().to_string());
        tracing::debug!(parent: span, worktree = %lease.id(), "worktree provisioned");

        let outcome = match self.apply_changes(&lease, &request.changes).await {
            Ok(()) => self.execute_validation(&lease, &request.steps, response).await,
            Err(e) => Err(e),
        };

        match lease.changes().await {
            Ok(diff) => response.diff = diff,
            Err(e) => {
                tracing::warn!(parent: span, worktree = %lease.id(), error = %e, "failed to collect diff");
            }
        }

        if let Err(e) = lease.release().await {
            tracing::warn!(parent: span, error = %e, "failed to release worktree");
        }

        outcome
    }

    /// Writes or removes each changed file in order.
    pub async fn apply_changes(&self, worktree: &Worktree, changes: &[FileChange]) -> Result<()> {
        for change in changes {
            let applied = match &change.operation {
                FileOperation::Create | FileOperation::Update => {
                    worktree
                        .write_file(&change.path, change.content.as_bytes())
                        .await
                }
                FileOperation::Delete => worktree.remove_file(&change.path).await,
                FileOperation::Unsupported(op) => Err(Error::Input(format!(
                    "unsupported operation '{}' for {}",
                    op, change.path
                ))),
            };
            applied.map_err(|e| e.context("apply"))?;
        }
        Ok(())
    }

    /// Runs `steps` in order against one deadline, appending a result for
    /// every step that was attempted.
    pub async fn execute_validation(
        &self,
        worktree: &Worktree,
        steps: &[ValidationStep],
        response: &mut ExecutionResponse,
    ) -> Result<()> {
        let deadline = Instant::now() + self.config.timeout;

        for step in steps {
            if Instant::now() >= deadline {
                return Err(Error::Timeout(self.config.timeout).context("run_steps"));
            }

            if !self.is_command_allowed(&step.command) {
                let error = Error::CommandNotAllowed(step.command.clone());
                response.results.push(ExecutionResult {
                    command: step.command_line(),
                    output: String::new(),
                    error: Some(error.to_string()),
                    exit_code: NO_EXIT_CODE,
                    worktree_id: worktree.id().to_string(),
                    timestamp: Utc::now(),
                });
                return Err(error.context("run_steps"));
            }

            let run = self.execute_command(worktree, step, deadline).await;
            let exit_code = run.result.exit_code;
            response.results.push(run.result);

            if run.timed_out {
                return Err(Error::Timeout(self.config.timeout).context("run_steps"));
            }
            if exit_code != 0 {
                if step.required {
                    return Err(Error::StepFailed {
                        step: step.name.clone(),
                        exit_code,
                    }
                    .context("run_steps"));
                }
                tracing::info!(parent: &self.span, step = %step.name, exit_code, "optional step failed");
            }
        }

        Ok(())
    }

    /// Runs one step, racing it against `deadline`. Spawn failures are
    /// recorded with [`NO_EXIT_CODE`].
    async fn execute_command(
        &self,
        worktree: &Worktree,
        step: &ValidationStep,
        deadline: Instant,
    ) -> StepRun {
        let started = Instant::now();
        let outcome = match worktree.spawn(&step.command, &step.args) {
            Ok(running) => running.wait_until(deadline).await,
            Err(e) => Err(e),
        };

        let (output, exit_code, error, timed_out) = match outcome {
            Ok(CommandOutcome::Completed(out)) => (out.output, out.exit_code, None, false),
            Ok(CommandOutcome::TimedOut { output }) => (
                output,
                NO_EXIT_CODE,
                Some("deadline exceeded".to_string()),
                true,
            ),
            Err(e) => (String::new(), NO_EXIT_CODE, Some(e.to_string()), false),
        };

        tracing::debug!(
            parent: &self.span,
            worktree = %worktree.id(),
            step = %step.name,
            exit_code,
            timed_out,
            elapsed = ?started.elapsed(),
            "step finished"
        );

        StepRun {
            result: ExecutionResult {
                command: step.command_line(),
                output,
                error,
                exit_code,
                worktree_id: worktree.id().to_string(),
                timestamp: Utc::now(),
            },
            timed_out,
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

async fn reap_idle_worktrees(worktrees: WorktreeManager, interval: Duration, span: Span) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let reaped = worktrees.cleanup_old_worktrees(interval * 2).await;
        if reaped > 0 {
            tracing::info!(parent: &span, reaped, "reaped idle worktrees");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(allowed: &[&str], blocked: &[&str]) -> ExecutorConfig {
        ExecutorConfig {
            allowed_commands: allowed.iter().map(|c| c.to_string()).collect(),
            blocked_commands: blocked.iter().map(|c| c.to_string()).collect(),
            ..ExecutorConfig::default()
        }
    }

    #[test]
    fn commands_are_denied_by_default() {
        let config = config(&[], &[]);
        assert!(!config.is_command_allowed("cargo"));
        assert!(!config.is_command_allowed(""));
    }

    #[test]
    fn deny_list_wins_over_allow_list() {
        let config = config(&["cargo", "rm"], &["rm"]);
        assert!(config.is_command_allowed("cargo"));
        assert!(!config.is_command_allowed("rm"));
        assert!(!config.is_command_allowed("/bin/rm"));
    }

    #[test]
    fn allowed_names_do_not_admit_other_paths() {
        let config = config(&["cargo"], &[]);
        assert!(config.is_command_allowed("cargo"));
        assert!(!config.is_command_allowed("/tmp/attacker/cargo"));
        assert!(!config.is_command_allowed("../../../tmp/x/cargo"));
        assert!(!config.is_command_allowed("./cargo"));
        assert!(!config.is_command_allowed("cargo-nextest"));
    }

    #[test]
    fn allowed_paths_must_match_exactly() {
        let config = config(&["/usr/local/bin/cargo", "./gradlew"], &[]);
        assert!(config.is_command_allowed("/usr/local/bin/cargo"));
        assert!(config.is_command_allowed("./gradlew"));
        assert!(!config.is_command_allowed("cargo"));
        assert!(!config.is_command_allowed("/opt/bin/cargo"));
    }

    #[test]
    fn from_config_normalizes_and_seeds_from_project() {
        let mut sandbox = SandboxConfig::default();
        sandbox.execution.allowed_commands = vec!["/usr/bin/npm".to_string(), " ".to_string()];
        sandbox.execution.blocked_commands = vec!["sudo".to_string()];
        let project = ProjectConfig::from_yaml("languages:\n  rust:\n    test: cargo test\n").unwrap();

        let seeded = ExecutorConfig::from_config(&sandbox, Some(&project));
        assert_eq!(
            seeded.allowed_commands,
            HashSet::from(["/usr/bin/npm".to_string(), "cargo".to_string()])
        );
        assert!(seeded.is_command_allowed("/usr/bin/npm"));
        assert!(!seeded.is_command_allowed("npm"));
        assert!(seeded.is_command_allowed("cargo"));
        assert!(!seeded.is_command_allowed("sudo"));

        sandbox.execution.seed_from_project = false;
        let unseeded = ExecutorConfig::from_config(&sandbox, Some(&project));
        assert!(!unseeded.is_command_allowed("cargo"));
    }

    #[test]
    fn defaults_follow_sandbox_config() {
        let config = ExecutorConfig::default();
        assert_eq!(config.base_ref, "HEAD");
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.cleanup_interval, Duration::from_secs(600));
        assert!(config.blocked_commands.contains("rm"));
    }
}
