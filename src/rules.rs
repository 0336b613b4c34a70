//! Declarative validation rules and their persisted YAML document.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::FileOperation;

/// Default per-file size limit (1 MiB).
pub const DEFAULT_MAX_FILE_SIZE: usize = 1024 * 1024;
/// Default total size limit (10 MiB).
pub const DEFAULT_MAX_TOTAL_SIZE: usize = 10 * 1024 * 1024;
/// Default file count limit.
pub const DEFAULT_MAX_FILES: usize = 100;

/// Gates which operations are allowed on paths matching `pattern`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRule {
    /// Glob matched against the change path.
    pub pattern: String,
    /// If non-empty, only these operations are allowed.
    #[serde(default)]
    pub allowed_operations: Vec<FileOperation>,
    #[serde(default)]
    pub blocked_operations: Vec<FileOperation>,
    #[serde(default)]
    pub description: String,
}

/// Gates file content by regex on paths matching `pattern`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRule {
    pub name: String,
    /// Glob matched against the change path.
    #[serde(default = "all_files")]
    pub pattern: String,
    /// Regexes of which at least one must match when `required` is set.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Regexes that must not match.
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

fn all_files() -> String {
    "**".to_string()
}

/// Size bounds for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeRule {
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
    #[serde(default = "default_max_total_size")]
    pub max_total_size: usize,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_max_file_size() -> usize {
    DEFAULT_MAX_FILE_SIZE
}

fn default_max_total_size() -> usize {
    DEFAULT_MAX_TOTAL_SIZE
}

fn default_max_files() -> usize {
    DEFAULT_MAX_FILES
}

impl Default for SizeRule {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            max_total_size: default_max_total_size(),
            max_files: default_max_files(),
        }
    }
}

/// Path denylists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
    /// Extensions that may not be written, with or without the leading dot.
    #[serde(default = "default_blocked_extensions")]
    pub blocked_extensions: Vec<String>,
    /// Path prefixes that may not be touched.
    #[serde(default = "default_blocked_paths")]
    pub blocked_paths: Vec<String>,
}

fn default_blocked_extensions() -> Vec<String> {
    [".exe", ".dll", ".so", ".dylib", ".bin", ".pem", ".key"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_blocked_paths() -> Vec<String> {
    [".git/", ".ssh/", ".aws/", ".gnupg/"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for SecurityRule {
    fn default() -> Self {
        Self {
            blocked_extensions: default_blocked_extensions(),
            blocked_paths: default_blocked_paths(),
        }
    }
}

fn default_file_rules() -> Vec<FileRule> {
    vec![FileRule {
        pattern: ".github/workflows/**".to_string(),
        allowed_operations: vec![],
        blocked_operations: vec![
            FileOperation::Create,
            FileOperation::Update,
            FileOperation::Delete,
        ],
        description: "CI workflows cannot be changed from a sandbox".to_string(),
    }]
}

fn default_content_rules() -> Vec<ContentRule> {
    vec![ContentRule {
        name: "credentials".to_string(),
        pattern: all_files(),
        patterns: vec![],
        blocked_patterns: vec![
            r#"(?i)\b(password|passwd|pwd|secret|api[_-]?key|access[_-]?token|auth[_-]?token)\s*[:=]\s*["'][^"']{4,}["']"#.to_string(),
            r"-----BEGIN [A-Z ]*PRIVATE KEY-----".to_string(),
            r"\bAKIA[0-9A-Z]{16}\b".to_string(),
        ],
        required: false,
        description: "hard-coded credentials".to_string(),
    }]
}

/// The complete rule set. Absent sections take their built-in defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rules {
    #[serde(default = "default_file_rules")]
    pub file_rules: Vec<FileRule>,
    #[serde(default = "default_content_rules")]
    pub content_rules: Vec<ContentRule>,
    #[serde(default)]
    pub size: SizeRule,
    #[serde(default)]
    pub security: SecurityRule,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            file_rules: default_file_rules(),
            content_rules: default_content_rules(),
            size: SizeRule::default(),
            security: SecurityRule::default(),
        }
    }
}

impl Rules {
    /// Rules with no file, content or security constraints, only size bounds.
    pub fn permissive() -> Self {
        Self {
            file_rules: vec![],
            content_rules: vec![],
            size: SizeRule::default(),
            security: SecurityRule {
                blocked_extensions: vec![],
                blocked_paths: vec![],
            },
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::Config(format!("invalid rules: {}", e)))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::Config(format!("failed to serialize rules: {}", e)))
    }

    /// Reads a rules document.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Writes the rules document, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }
}
