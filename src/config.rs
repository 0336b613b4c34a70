//! Engine configuration and its validation.
//!
//! [`SandboxConfig`] is the TOML document the host loads; [`ProjectConfig`] is
//! the per-repository YAML document of build/test/lint command templates.
//! Both are checked with [`Validate`] before the engine is built, so typos in
//! command lists surface at load time rather than as denied steps later.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::logging::LogConfig;
use crate::types::ValidationStep;

/// Program names commonly used as validation steps.
pub const KNOWN_COMMANDS: &[&str] = &[
    "bash", "bun", "bundle", "cargo", "cat", "cmake", "deno", "dotnet", "echo", "eslint",
    "false", "flake8", "git", "go", "gradle", "java", "jest", "ls", "make", "mvn", "mypy",
    "node", "npm", "npx", "pip", "pnpm", "prettier", "pytest", "python", "python3", "rake",
    "rspec", "ruby", "ruff", "rustc", "rustfmt", "sh", "sleep", "test", "tox", "true", "tsc",
    "yarn", "zsh",
];

/// Programs a sandbox should never run.
pub const DEFAULT_BLOCKED_COMMANDS: &[&str] = &[
    "rm", "sudo", "su", "curl", "wget", "ssh", "scp", "dd", "mkfs", "shutdown", "reboot",
];

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Program name of a command: its final path component.
pub fn program_name(command: &str) -> &str {
    Path::new(command)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(command)
}

/// The `[workspace]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Repository worktrees are created from.
    #[serde(default = "default_repo_path")]
    pub repo_path: PathBuf,
    /// Directory worktrees live under. Defaults to `<tmp>/worktree-sandbox`.
    #[serde(default)]
    pub temp_root: Option<PathBuf>,
    /// Ref new worktrees are checked out at.
    #[serde(default = "default_base_ref")]
    pub base_ref: String,
    #[serde(default = "default_max_worktrees")]
    pub max_worktrees: usize,
}

fn default_repo_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_base_ref() -> String {
    "HEAD".to_string()
}

fn default_max_worktrees() -> usize {
    10
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            repo_path: default_repo_path(),
            temp_root: None,
            base_ref: default_base_ref(),
            max_worktrees: default_max_worktrees(),
        }
    }
}

impl WorkspaceConfig {
    /// The effective worktree root.
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("worktree-sandbox"))
    }
}

/// The `[execution]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Budget for all validation steps of one request.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Reaper tick; worktrees idle for twice this long are removed.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(default = "default_blocked_commands")]
    pub blocked_commands: Vec<String>,
    /// Add the programs named by the project config to the allow-list.
    #[serde(default = "default_true")]
    pub seed_from_project: bool,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_cleanup_interval_secs() -> u64 {
    600
}

fn default_blocked_commands() -> Vec<String> {
    DEFAULT_BLOCKED_COMMANDS
        .iter()
        .map(|c| c.to_string())
        .collect()
}

fn default_true() -> bool {
    true
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            allowed_commands: Vec::new(),
            blocked_commands: default_blocked_commands(),
            seed_from_project: true,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// The `[validation]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// YAML rules document; built-in rules are used when unset or missing.
    #[serde(default)]
    pub rules_path: Option<PathBuf>,
    /// YAML project document with per-language command templates.
    #[serde(default)]
    pub project_path: Option<PathBuf>,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

impl SandboxConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    /// Reads a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Loads the project document if one is configured and present.
    pub fn load_project(&self) -> Result<Option<ProjectConfig>> {
        match &self.validation.project_path {
            Some(path) if path.exists() => ProjectConfig::load(path).map(Some),
            _ => Ok(None),
        }
    }
}

impl Validate for SandboxConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        let execution = &self.execution;

        if self.workspace.max_worktrees == 0 {
            result.add_error("max_worktrees must be at least 1");
        }
        if self.workspace.base_ref.trim().is_empty() {
            result.add_error("base_ref cannot be empty");
        }
        if execution.timeout_secs == 0 {
            result.add_error("timeout_secs must be at least 1");
        }
        if execution.cleanup_interval_secs == 0 {
            result.add_error("cleanup_interval_secs must be at least 1");
        }

        if execution.timeout_secs > 3600 {
            result.add_warning("timeout_secs over 1 hour may indicate a misconfiguration");
        }
        if execution.allowed_commands.is_empty() && !execution.seed_from_project {
            result.add_warning("no allowed_commands and seed_from_project is off: every step will be denied");
        }

        for command in &execution.allowed_commands {
            if !KNOWN_COMMANDS.contains(&program_name(command)) {
                result.add_warning(format!("unknown command '{}' in allowed_commands", command));
            }
            if execution
                .blocked_commands
                .iter()
                .any(|blocked| program_name(blocked) == program_name(command))
            {
                result.add_warning(format!(
                    "command '{}' is both allowed and blocked; it will be denied",
                    command
                ));
            }
        }
        for command in &execution.blocked_commands {
            if command.trim().is_empty() {
                result.add_warning("empty entry in blocked_commands");
            }
        }

        result
    }
}

/// Command templates for one language. Each is a whitespace-separated
/// command line such as `cargo test --all`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageCommands {
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub test: Option<String>,
    #[serde(default)]
    pub lint: Option<String>,
}

impl LanguageCommands {
    fn templates(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("build", self.build.as_deref()),
            ("test", self.test.as_deref()),
            ("lint", self.lint.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, template)| template.map(|t| (name, t)))
    }
}

/// Per-repository project document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub languages: BTreeMap<String, LanguageCommands>,
}

impl ProjectConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("invalid project config: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    /// Commands referenced by any template, as written, deduplicated and
    /// sorted.
    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .languages
            .values()
            .flat_map(|commands| commands.templates())
            .filter_map(|(_, template)| template.split_whitespace().next())
            .map(String::from)
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Build, test and lint steps for `language`. Build and test are
    /// required, lint is optional. Empty if the language is unknown.
    pub fn default_steps(&self, language: &str) -> Vec<ValidationStep> {
        let Some(commands) = self.languages.get(language) else {
            return Vec::new();
        };
        commands
            .templates()
            .filter_map(|(name, template)| {
                let mut parts = template.split_whitespace().map(String::from);
                let command = parts.next()?;
                let step = ValidationStep::new(name, command, parts.collect::<Vec<_>>())
                    .with_description(format!("{} {}", language, name));
                Some(if name == "lint" { step.optional() } else { step })
            })
            .collect()
    }
}

impl Validate for ProjectConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        for (language, commands) in &self.languages {
            for (name, template) in commands.templates() {
                match template.split_whitespace().next() {
                    None => result.add_error(format!("{}.{} command is empty", language, name)),
                    Some(program) if !KNOWN_COMMANDS.contains(&program_name(program)) => {
                        result.add_warning(format!(
                            "unknown command '{}' in {}.{}",
                            program, language, name
                        ))
                    }
                    Some(_) => {}
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sandbox_config_has_sensible_defaults() {
        let config = SandboxConfig::default();

        assert_eq!(config.workspace.repo_path, PathBuf::from("."));
        assert_eq!(config.workspace.base_ref, "HEAD");
        assert_eq!(config.workspace.max_worktrees, 10);
        assert!(config.workspace.temp_root().ends_with("worktree-sandbox"));
        assert_eq!(config.execution.timeout(), Duration::from_secs(300));
        assert_eq!(config.execution.cleanup_interval(), Duration::from_secs(600));
        assert!(config.execution.blocked_commands.contains(&"sudo".to_string()));
        assert!(config.execution.seed_from_project);
        assert!(config.validation.rules_path.is_none());
    }

    #[test]
    fn sandbox_config_deserializes_from_toml() {
        let config = SandboxConfig::from_toml(
            r#"
            [workspace]
            repo_path = "/srv/repo"
            max_worktrees = 4

            [execution]
            timeout_secs = 30
            allowed_commands = ["cargo", "npm"]
            blocked_commands = ["rm"]

            [validation]
            rules_path = ".sandbox/rules.yaml"

            [logging]
            format = "compact"
        "#,
        )
        .unwrap();

        assert_eq!(config.workspace.repo_path, PathBuf::from("/srv/repo"));
        assert_eq!(config.workspace.max_worktrees, 4);
        assert_eq!(config.workspace.base_ref, "HEAD");
        assert_eq!(config.execution.timeout_secs, 30);
        assert_eq!(config.execution.cleanup_interval_secs, 600);
        assert_eq!(config.execution.allowed_commands, vec!["cargo", "npm"]);
        assert_eq!(config.execution.blocked_commands, vec!["rm"]);
        assert_eq!(
            config.validation.rules_path,
            Some(PathBuf::from(".sandbox/rules.yaml"))
        );
        assert_eq!(config.logging.format, crate::logging::LogFormat::Compact);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let err = SandboxConfig::from_toml("[workspace]\nmax_worktrees = \"many\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn default_config_is_valid() {
        let result = SandboxConfig::default().validate();
        assert!(result.is_valid());
    }

    #[test]
    fn zero_limits_are_errors() {
        let mut config = SandboxConfig::default();
        config.workspace.max_worktrees = 0;
        config.execution.timeout_secs = 0;
        config.execution.cleanup_interval_secs = 0;

        let result = config.validate();
        assert_eq!(result.errors.len(), 3);
        assert!(result.into_result().is_err());
    }

    #[test]
    fn unknown_and_conflicting_commands_warn() {
        let mut config = SandboxConfig::default();
        config.execution.allowed_commands =
            vec!["carg".to_string(), "/usr/bin/cargo".to_string(), "rm".to_string()];

        let result = config.validate();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("'carg'")));
        assert!(!result.warnings.iter().any(|w| w.contains("unknown command '/usr/bin/cargo'")));
        assert!(result.warnings.iter().any(|w| w.contains("both allowed and blocked")));
    }

    #[test]
    fn empty_allow_list_without_seeding_warns() {
        let mut config = SandboxConfig::default();
        config.execution.seed_from_project = false;
        let result = config.validate();
        assert!(result.warnings.iter().any(|w| w.contains("every step will be denied")));
    }

    #[test]
    fn program_name_strips_directories() {
        assert_eq!(program_name("/usr/bin/cargo"), "cargo");
        assert_eq!(program_name("npm"), "npm");
    }

    const PROJECT: &str = r#"
languages:
  rust:
    build: cargo build
    test: cargo test --all
    lint: cargo clippy -- -D warnings
  python:
    test: pytest -q
    lint: ruff check .
"#;

    #[test]
    fn project_config_seeds_command_names() {
        let project = ProjectConfig::from_yaml(PROJECT).unwrap();
        assert_eq!(project.command_names(), vec!["cargo", "pytest", "ruff"]);
    }

    #[test]
    fn project_config_default_steps() {
        let project = ProjectConfig::from_yaml(PROJECT).unwrap();

        let steps = project.default_steps("rust");
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].name, "build");
        assert_eq!(steps[0].command, "cargo");
        assert_eq!(steps[0].args, vec!["build"]);
        assert!(steps[0].required);
        assert_eq!(steps[1].args, vec!["test", "--all"]);
        assert!(steps[1].required);
        assert_eq!(steps[2].name, "lint");
        assert!(!steps[2].required);

        let python = project.default_steps("python");
        assert_eq!(python.len(), 2);
        assert_eq!(python[0].name, "test");

        assert!(project.default_steps("cobol").is_empty());
    }

    #[test]
    fn project_config_validation() {
        let project = ProjectConfig::from_yaml(
            r#"
languages:
  odd:
    build: "   "
    test: frobnicate run
"#,
        )
        .unwrap();
        let result = project.validate();
        assert!(result.errors.iter().any(|e| e.contains("odd.build")));
        assert!(result.warnings.iter().any(|w| w.contains("frobnicate")));
    }

    #[test]
    fn load_project_only_when_present() {
        let dir = TempDir::new().unwrap();
        let mut config = SandboxConfig::default();
        assert!(config.load_project().unwrap().is_none());

        let path = dir.path().join("project.yaml");
        config.validation.project_path = Some(path.clone());
        assert!(config.load_project().unwrap().is_none());

        std::fs::write(&path, PROJECT).unwrap();
        let project = config.load_project().unwrap().unwrap();
        assert!(project.languages.contains_key("rust"));
    }

    #[test]
    fn validation_result_into_result_ok_on_valid() {
        let mut result = ValidationResult::default();
        result.add_warning("just a warning");
        assert_eq!(result.into_result().unwrap(), vec!["just a warning"]);
    }

    #[test]
    fn validation_result_into_result_err_on_invalid() {
        let mut result = ValidationResult::default();
        result.add_error("fatal error");
        result.add_warning("warning");
        assert!(result.into_result().is_err());
    }
}
