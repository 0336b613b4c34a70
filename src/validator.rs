//! Rule engine that vets a proposed change set before anything runs.
//!
//! Evaluation order is size, then per-file operation and content rules, then
//! the security denylists. The first violation wins.
//!
//! Rules are compiled once when loaded or updated. A rule whose glob or
//! regex does not compile is logged and skipped; a rule that compiles and
//! matches always rejects.

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use regex::Regex;
use serde::Serialize;
use tracing::Span;

use crate::error::{Result, RuleViolation, ViolationKind};
use crate::pattern::{canonical_path, normalize_path, Glob};
use crate::rules::{ContentRule, FileRule, Rules, SecurityRule};
use crate::types::{ExecutionRequest, FileChange, FileOperation};

struct CompiledFileRule {
    rule: FileRule,
    glob: Glob,
}

struct CompiledContentRule {
    rule: ContentRule,
    glob: Glob,
    required: Vec<Regex>,
    blocked: Vec<Regex>,
}

struct CompiledRules {
    rules: Rules,
    file_rules: Vec<CompiledFileRule>,
    content_rules: Vec<CompiledContentRule>,
}

impl CompiledRules {
    fn compile(rules: Rules, span: &Span) -> Self {
        let file_rules = rules
            .file_rules
            .iter()
            .filter_map(|rule| match Glob::new(&rule.pattern) {
                Ok(glob) => Some(CompiledFileRule {
                    rule: rule.clone(),
                    glob,
                }),
                Err(e) => {
                    tracing::warn!(parent: span, pattern = %rule.pattern, error = %e, "skipping malformed file rule");
                    None
                }
            })
            .collect();

        let content_rules = rules
            .content_rules
            .iter()
            .filter_map(|rule| match compile_content_rule(rule) {
                Ok(compiled) => Some(compiled),
                Err(e) => {
                    tracing::warn!(parent: span, rule = %rule.name, error = %e, "skipping malformed content rule");
                    None
                }
            })
            .collect();

        Self {
            rules,
            file_rules,
            content_rules,
        }
    }
}

fn compile_content_rule(rule: &ContentRule) -> std::result::Result<CompiledContentRule, String> {
    let glob = Glob::new(&rule.pattern).map_err(|e| e.to_string())?;
    let compile_all = |sources: &[String]| {
        sources
            .iter()
            .map(|src| Regex::new(src).map_err(|e| format!("invalid regex '{}': {}", src, e)))
            .collect::<std::result::Result<Vec<_>, _>>()
    };
    Ok(CompiledContentRule {
        rule: rule.clone(),
        glob,
        required: compile_all(rule.patterns.as_slice())?,
        blocked: compile_all(rule.blocked_patterns.as_slice())?,
    })
}

/// The rules that apply to one path.
#[derive(Debug, Clone, Serialize)]
pub struct PathRules {
    pub path: String,
    pub file_rules: Vec<FileRule>,
    pub content_rules: Vec<ContentRule>,
    /// Set if the path itself is denied by the security rule.
    pub security_violation: Option<RuleViolation>,
}

/// Validates execution requests against the active [`Rules`].
pub struct Validator {
    state: RwLock<CompiledRules>,
    rules_path: Option<PathBuf>,
    span: Span,
}

impl Validator {
    /// Creates a validator with `rules` that is not backed by a file.
    pub fn new(rules: Rules) -> Self {
        Self::with_span(rules, None, tracing::info_span!("validator"))
    }

    pub fn with_span(rules: Rules, rules_path: Option<PathBuf>, span: Span) -> Self {
        let compiled = CompiledRules::compile(rules, &span);
        Self {
            state: RwLock::new(compiled),
            rules_path,
            span,
        }
    }

    /// Loads rules from `rules_path`, falling back to the built-in defaults
    /// when the file is missing or unparsable.
    pub fn load(rules_path: Option<PathBuf>) -> Self {
        Self::load_with_span(rules_path, tracing::info_span!("validator"))
    }

    pub fn load_with_span(rules_path: Option<PathBuf>, span: Span) -> Self {
        let rules = match &rules_path {
            Some(path) if path.exists() => match Rules::load(path) {
                Ok(rules) => {
                    tracing::info!(parent: &span, path = ?path, "loaded validation rules");
                    rules
                }
                Err(e) => {
                    tracing::warn!(parent: &span, path = ?path, error = %e, "failed to load rules, using defaults");
                    Rules::default()
                }
            },
            Some(path) => {
                tracing::info!(parent: &span, path = ?path, "no rules file, using defaults");
                Rules::default()
            }
            None => Rules::default(),
        };
        Self::with_span(rules, rules_path, span)
    }

    /// A copy of the active rules.
    pub fn rules(&self) -> Rules {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rules
            .clone()
    }

    pub fn rules_path(&self) -> Option<&Path> {
        self.rules_path.as_deref()
    }

    /// Replaces the active rules and persists them, if backed by a file.
    pub fn update_rules(&self, rules: Rules) -> Result<()> {
        if let Some(path) = &self.rules_path {
            rules.save(path)?;
        }
        let compiled = CompiledRules::compile(rules, &self.span);
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = compiled;
        tracing::info!(parent: &self.span, "updated validation rules");
        Ok(())
    }

    /// Returns the rules that apply to `path`.
    pub fn rules_for_path(&self, path: &str) -> PathRules {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let matched = rule_path(path);
        PathRules {
            path: path.to_string(),
            file_rules: state
                .file_rules
                .iter()
                .filter(|r| r.glob.is_match(&matched))
                .map(|r| r.rule.clone())
                .collect(),
            content_rules: state
                .content_rules
                .iter()
                .filter(|r| r.glob.is_match(&matched))
                .map(|r| r.rule.clone())
                .collect(),
            security_violation: check_security(&state.rules.security, path).err(),
        }
    }

    /// Checks `request` against the active rules.
    pub fn validate_request(
        &self,
        request: &ExecutionRequest,
    ) -> std::result::Result<(), RuleViolation> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);

        let result = check_size(&state.rules, &request.changes)
            .and_then(|()| {
                request
                    .changes
                    .iter()
                    .try_for_each(|change| check_file(&state, change))
            })
            .and_then(|()| {
                request
                    .changes
                    .iter()
                    .try_for_each(|change| check_security(&state.rules.security, &change.path))
            });

        match &result {
            Ok(()) => {
                tracing::debug!(parent: &self.span, request_id = %request.id, files = request.changes.len(), "request passed validation");
            }
            Err(violation) => {
                tracing::warn!(parent: &self.span, request_id = %request.id, %violation, "request rejected");
            }
        }
        result
    }
}

fn check_size(rules: &Rules, changes: &[FileChange]) -> std::result::Result<(), RuleViolation> {
    let size = &rules.size;

    if changes.len() > size.max_files {
        return Err(RuleViolation::new(
            ViolationKind::TooManyFiles,
            "size.max_files",
            format!("{} files exceeds the limit of {}", changes.len(), size.max_files),
        ));
    }

    if let Some(change) = changes.iter().find(|c| c.size() > size.max_file_size) {
        return Err(RuleViolation::new(
            ViolationKind::FileTooLarge,
            "size.max_file_size",
            format!(
                "{} bytes exceeds the limit of {}",
                change.size(),
                size.max_file_size
            ),
        )
        .in_file(&change.path));
    }

    let total: usize = changes.iter().map(FileChange::size).sum();
    if total > size.max_total_size {
        return Err(RuleViolation::new(
            ViolationKind::TotalSizeExceeded,
            "size.max_total_size",
            format!(
                "{} bytes in total exceeds the limit of {}",
                total, size.max_total_size
            ),
        ));
    }

    Ok(())
}

/// The form of `path` rules are matched against. Paths that escape the root
/// keep their raw form; the security check rejects them.
fn rule_path(path: &str) -> String {
    canonical_path(path).unwrap_or_else(|| normalize_path(path))
}

fn check_file(state: &CompiledRules, change: &FileChange) -> std::result::Result<(), RuleViolation> {
    let path = rule_path(&change.path);
    for compiled in state.file_rules.iter().filter(|r| r.glob.is_match(&path)) {
        let rule = &compiled.rule;
        if rule.blocked_operations.contains(&change.operation) {
            return Err(RuleViolation::new(
                ViolationKind::OperationBlocked,
                &rule.pattern,
                format!("{} is blocked", change.operation),
            )
            .in_file(&change.path));
        }
        if !rule.allowed_operations.is_empty() && !rule.allowed_operations.contains(&change.operation)
        {
            return Err(RuleViolation::new(
                ViolationKind::OperationNotAllowed,
                &rule.pattern,
                format!("{} is not an allowed operation", change.operation),
            )
            .in_file(&change.path));
        }
    }

    if change.operation == FileOperation::Delete {
        return Ok(());
    }

    for compiled in state.content_rules.iter().filter(|r| r.glob.is_match(&path)) {
        if let Some(hit) = compiled.blocked.iter().find(|re| re.is_match(&change.content)) {
            return Err(RuleViolation::new(
                ViolationKind::BlockedContent,
                &compiled.rule.name,
                format!("content matches blocked pattern '{}'", hit.as_str()),
            )
            .in_file(&change.path));
        }
        if compiled.rule.required
            && !compiled.required.is_empty()
            && !compiled.required.iter().any(|re| re.is_match(&change.content))
        {
            return Err(RuleViolation::new(
                ViolationKind::MissingRequiredContent,
                &compiled.rule.name,
                "content is missing a required pattern",
            )
            .in_file(&change.path));
        }
    }

    Ok(())
}

fn check_security(security: &SecurityRule, path: &str) -> std::result::Result<(), RuleViolation> {
    let Some(normalized) = canonical_path(path) else {
        return Err(RuleViolation::new(
            ViolationKind::PathTraversal,
            "security.path_traversal",
            "path must stay inside the worktree",
        )
        .in_file(path));
    };
    let as_path = Path::new(&normalized);

    if let Some(ext) = as_path.extension().and_then(|e| e.to_str()) {
        let ext = ext.to_ascii_lowercase();
        if let Some(blocked) = security
            .blocked_extensions
            .iter()
            .find(|b| b.trim_start_matches('.').eq_ignore_ascii_case(&ext))
        {
            return Err(RuleViolation::new(
                ViolationKind::BlockedExtension,
                "security.blocked_extensions",
                format!("extension '{}' is not allowed", blocked),
            )
            .in_file(path));
        }
    }

    if let Some(prefix) = security.blocked_paths.iter().find(|prefix| {
        let Some(canonical) = canonical_path(prefix).filter(|p| !p.is_empty()) else {
            return false;
        };
        if prefix.ends_with('/') {
            normalized == canonical || normalized.starts_with(&format!("{}/", canonical))
        } else {
            normalized.starts_with(&canonical)
        }
    }) {
        return Err(RuleViolation::new(
            ViolationKind::BlockedPath,
            "security.blocked_paths",
            format!("paths under '{}' are not allowed", prefix),
        )
        .in_file(path));
    }

    Ok(())
}
