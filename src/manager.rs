//! Caller-facing facade over the executor, validator and worktree registry.
//!
//! Adds aggregate metrics and lifecycle events on top of [`Executor`], and
//! exposes manual, non-validated sandbox access.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Span;

use crate::config::{ProjectConfig, SandboxConfig, Validate};
use crate::error::{ErrorKind, ExecutionFailure, Result};
use crate::events::{EventManager, SandboxEvent, SandboxEventType};
use crate::executor::{Executor, ExecutorConfig};
use crate::rules::Rules;
use crate::sandbox::{GitWorkspaceProvider, WorkspaceProvider, Worktree, WorktreeManager};
use crate::types::{ExecutionRequest, ExecutionResponse, ValidationStep};
use crate::validator::Validator;

/// Point-in-time copy of the aggregate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_executions: u64,
    pub successful_runs: u64,
    /// Failed runs other than timeouts, validation failures included.
    pub failed_runs: u64,
    pub timed_out_runs: u64,
    pub validation_failures: u64,
    pub sandboxes_created: u64,
    pub sandboxes_cleaned: u64,
    /// Summed wall-clock time of finished executions.
    pub total_duration_ms: u64,
}

impl MetricsSnapshot {
    pub fn total_duration(&self) -> Duration {
        Duration::from_millis(self.total_duration_ms)
    }

    /// Adds to the summed duration, saturating at `u64::MAX` milliseconds.
    pub fn add_duration(&mut self, duration: Duration) {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.total_duration_ms = self.total_duration_ms.saturating_add(millis);
    }

    /// Mean execution time, if anything ran.
    pub fn average_duration(&self) -> Option<Duration> {
        (self.total_executions > 0)
            .then(|| Duration::from_millis(self.total_duration_ms / self.total_executions))
    }
}

/// The sandbox engine.
pub struct Manager {
    config: SandboxConfig,
    project: Option<ProjectConfig>,
    executor: Executor,
    events: Arc<EventManager>,
    metrics: RwLock<MetricsSnapshot>,
    span: Span,
}

impl Manager {
    /// Builds the engine with git worktrees from `config.workspace.repo_path`.
    pub fn from_config(config: SandboxConfig) -> Result<Self> {
        let provider = Arc::new(GitWorkspaceProvider::new(
            config.workspace.repo_path.clone(),
        ));
        Self::new(config, provider)
    }

    /// Builds the engine. Fails if the config is invalid, the project
    /// document cannot be read, or the worktree root cannot be created.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: SandboxConfig, provider: Arc<dyn WorkspaceProvider>) -> Result<Self> {
        let span = tracing::info_span!("sandbox");

        let mut validation = config.validate();
        let project = if validation.is_valid() {
            config.load_project().map_err(|e| e.context("load_project"))?
        } else {
            None
        };
        if let Some(project) = &project {
            validation.merge(project.validate());
        }
        for warning in validation.into_result()? {
            tracing::warn!(parent: &span, "config: {}", warning);
        }

        let validator = Arc::new(Validator::load_with_span(
            config.validation.rules_path.clone(),
            tracing::info_span!(parent: &span, "validator"),
        ));
        let worktrees = WorktreeManager::with_span(
            provider,
            config.workspace.temp_root(),
            config.workspace.max_worktrees,
            tracing::info_span!(parent: &span, "worktree_manager"),
        )
        .map_err(|e| e.context("create_worktree_root"))?;
        let executor = Executor::with_span(
            ExecutorConfig::from_config(&config, project.as_ref()),
            validator,
            worktrees,
            tracing::info_span!(parent: &span, "executor"),
        )?;
        let events = Arc::new(EventManager::with_span(tracing::info_span!(
            parent: &span,
            "events"
        )));

        tracing::info!(parent: &span, root = ?executor.worktrees().root(), "sandbox manager ready");

        Ok(Self {
            config,
            project,
            executor,
            events,
            metrics: RwLock::new(MetricsSnapshot::default()),
            span,
        })
    }

    /// Runs `request`, recording metrics and emitting lifecycle events.
    pub async fn execute_code(
        &self,
        request: &ExecutionRequest,
    ) -> std::result::Result<ExecutionResponse, ExecutionFailure> {
        self.events.emit(
            SandboxEvent::new(SandboxEventType::ExecutionStarted, &request.id)
                .with_data("files", request.changes.len())
                .with_data("steps", request.steps.len()),
        );

        let result = self.executor.execute_code(request).await;

        let response = match &result {
            Ok(response) => response,
            Err(failure) => failure.response.as_ref(),
        };
        let duration = response
            .duration()
            .and_then(|d| d.to_std().ok())
            .unwrap_or_default();

        self.update_metrics(|m| {
            m.total_executions += 1;
            m.add_duration(duration);
            match &result {
                Ok(_) => m.successful_runs += 1,
                Err(failure) if failure.error.is_timeout() => m.timed_out_runs += 1,
                Err(failure) => {
                    m.failed_runs += 1;
                    if failure.kind() == ErrorKind::Validation {
                        m.validation_failures += 1;
                    }
                }
            }
        });

        let event_type = match &result {
            Err(failure) if failure.kind() == ErrorKind::Validation => {
                SandboxEventType::ValidationFailed
            }
            _ => SandboxEventType::ExecutionEnded,
        };
        let mut event = SandboxEvent::new(event_type, &request.id)
            .with_data("status", format!("{:?}", response.status).to_lowercase())
            .with_data("results", response.results.len())
            .with_data("duration_ms", duration.as_millis());
        if let Some(worktree_id) = &response.worktree_id {
            event = event.with_data("worktree_id", worktree_id);
        }
        if let Err(failure) = &result {
            event = event.with_error(&failure.error);
        }
        self.events.emit(event);

        result
    }

    /// Provisions a worktree for manual use, bypassing validation. It stays
    /// until [`Manager::cleanup`] or the reaper removes it.
    pub async fn create_sandbox(&self, base_ref: Option<&str>) -> Result<Arc<Worktree>> {
        let base_ref = base_ref.unwrap_or(&self.config.workspace.base_ref);
        let worktree = self
            .executor
            .worktrees()
            .create_worktree(base_ref)
            .await
            .map_err(|e| e.context("create_sandbox"))?;

        self.update_metrics(|m| m.sandboxes_created += 1);
        self.events.emit(
            SandboxEvent::new(SandboxEventType::SandboxCreated, worktree.id())
                .with_data("path", worktree.path().display())
                .with_data("base_ref", base_ref),
        );
        Ok(worktree)
    }

    pub async fn get_sandbox(&self, id: &str) -> Result<Arc<Worktree>> {
        self.executor.worktrees().get_worktree(id).await
    }

    /// All live worktrees, including those owned by running executions.
    pub async fn list_sandboxes(&self) -> Vec<Arc<Worktree>> {
        self.executor.worktrees().list_worktrees().await
    }

    /// Removes a sandbox. Fails with NotFound for unknown IDs.
    pub async fn cleanup(&self, id: &str) -> Result<()> {
        self.executor
            .worktrees()
            .cleanup_worktree(id)
            .await
            .map_err(|e| e.context("cleanup"))?;

        self.update_metrics(|m| m.sandboxes_cleaned += 1);
        self.events
            .emit(SandboxEvent::new(SandboxEventType::SandboxCleaned, id));
        Ok(())
    }

    /// Build, test and lint steps from the project config for `language`.
    pub fn default_steps(&self, language: &str) -> Vec<ValidationStep> {
        self.project
            .as_ref()
            .map(|project| project.default_steps(language))
            .unwrap_or_default()
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn project(&self) -> Option<&ProjectConfig> {
        self.project.as_ref()
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn validator(&self) -> &Validator {
        self.executor.validator()
    }

    /// A copy of the active validation rules.
    pub fn validation_rules(&self) -> Rules {
        self.validator().rules()
    }

    /// Replaces the validation rules, persisting them if a rules path is set.
    pub fn update_validation_rules(&self, rules: Rules) -> Result<()> {
        self.validator()
            .update_rules(rules)
            .map_err(|e| e.context("update_validation_rules"))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        *self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    fn update_metrics(&self, f: impl FnOnce(&mut MetricsSnapshot)) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut metrics);
        tracing::trace!(parent: &self.span, metrics = ?*metrics, "metrics updated");
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.config)
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}
