//! Typed unit configuration
//!
//! The result of resolving a unit's config file: every section the
//! orchestrator recognizes, with all expressions already evaluated. The HCL
//! parser itself is an external collaborator ([`hcl`]); resolution lives in
//! [`resolve`].

use crate::value::{MockMergeStrategy, OutputMap, Value};
use semver::VersionReq;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

pub mod resolve;
pub use resolve::{resolve_config, EvalSettings, OutputSource};

/// Default name of the per-unit configuration file.
pub const CONFIG_FILENAME: &str = "terrarun.hcl";

/// Engine subcommands under which mocks are permitted when the dependency
/// does not list `mock_outputs_allowed_commands` itself.
pub const DEFAULT_MOCK_COMMANDS: &[&str] = &["init", "validate", "plan", "show", "output", "refresh"];

/// A fully resolved unit configuration.
#[derive(Clone, Debug, Default)]
pub struct UnitConfig {
    pub terraform: Option<TerraformConfig>,
    pub remote_state: Option<RemoteStateConfig>,
    /// `dependency` blocks keyed by label, in declaration order of the keys.
    pub dependencies: BTreeMap<String, DependencyConfig>,
    /// `generate` blocks keyed by label. Label uniqueness is global across
    /// includes and enforced during resolution.
    pub generate: BTreeMap<String, GenerateConfig>,
    pub inputs: OutputMap,
    pub locals: BTreeMap<String, Value>,
    pub before_hooks: Vec<Hook>,
    pub after_hooks: Vec<Hook>,
    pub error_hooks: Vec<Hook>,
    pub skip: bool,
    pub prevent_destroy: bool,
    pub iam_role: Option<String>,
    pub engine_version_constraint: Option<VersionReq>,
    pub orchestrator_version_constraint: Option<VersionReq>,
}

impl UnitConfig {
    pub fn hooks_of(&self, kind: HookKind) -> &[Hook] {
        match kind {
            HookKind::Before => &self.before_hooks,
            HookKind::After => &self.after_hooks,
            HookKind::Error => &self.error_hooks,
        }
    }

    /// All `extra_arguments` blocks that apply to `command`, in declaration
    /// order.
    pub fn extra_args_for<'a>(&'a self, command: &'a str) -> impl Iterator<Item = &'a ExtraArguments> {
        self.terraform
            .iter()
            .flat_map(|t| t.extra_arguments.iter())
            .filter(move |ea| ea.applies_to(command))
    }

    pub fn source(&self) -> Option<&str> {
        self.terraform.as_ref().and_then(|t| t.source.as_deref())
    }

    /// Whether dependency outputs of this unit can be read without a full
    /// materialization: the unit only wires up remote state and has no file
    /// generation or hooks that could affect its outputs.
    pub fn is_output_optimizable(&self) -> bool {
        self.remote_state.is_some()
            && self.generate.is_empty()
            && self.before_hooks.is_empty()
            && self.after_hooks.is_empty()
            && self.source().is_none()
    }
}

/// The `terraform` block of a unit config.
#[derive(Clone, Debug, Default)]
pub struct TerraformConfig {
    /// Module source to fetch into the scratch dir (git/registry/local).
    pub source: Option<String>,
    pub extra_arguments: Vec<ExtraArguments>,
    /// Glob patterns of unit files to copy into the scratch dir.
    pub include_in_copy: Vec<String>,
    /// Glob patterns of unit files to keep out of the scratch dir.
    pub exclude_from_copy: Vec<String>,
    /// Copy the engine's dependency lock file into the scratch dir.
    pub copy_lock_file: bool,
}

/// One `extra_arguments` block.
#[derive(Clone, Debug, Default)]
pub struct ExtraArguments {
    pub name: String,
    /// Engine subcommands the block applies to.
    pub commands: Vec<String>,
    pub arguments: Vec<String>,
    pub required_var_files: Vec<PathBuf>,
    /// Var files appended only if they exist on disk.
    pub optional_var_files: Vec<PathBuf>,
    pub env_vars: BTreeMap<String, String>,
}

impl ExtraArguments {
    pub fn applies_to(&self, command: &str) -> bool {
        self.commands.iter().any(|c| c == command)
    }
}

/// One `dependency` block: a directed edge from this unit (consumer) to the
/// producer at `config_path`.
#[derive(Clone, Debug)]
pub struct DependencyConfig {
    pub name: String,
    /// Producer path, relative to the unit directory as written in config.
    pub config_path: PathBuf,
    pub mock_outputs: Option<OutputMap>,
    pub mock_merge_strategy: MockMergeStrategy,
    /// Engine subcommands under which mocks may substitute for applied
    /// outputs. `None` falls back to [`DEFAULT_MOCK_COMMANDS`].
    pub mock_allowed_commands: Option<Vec<String>>,
    /// Keep the edge for ordering but never read outputs.
    pub skip_outputs: bool,
}

impl DependencyConfig {
    pub fn mocks_allowed(&self, command: &str) -> bool {
        match &self.mock_allowed_commands {
            Some(commands) => commands.iter().any(|c| c == command),
            None => DEFAULT_MOCK_COMMANDS.contains(&command),
        }
    }
}

/// One `generate` block.
#[derive(Clone, Debug)]
pub struct GenerateConfig {
    pub name: String,
    /// Target filename, relative to the scratch dir.
    pub path: PathBuf,
    pub contents: String,
    pub if_exists: IfExistsPolicy,
    pub disable: bool,
    /// Suppress the signature comment on the first line.
    pub disable_signature: bool,
    pub comment_prefix: String,
}

impl GenerateConfig {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            contents: contents.into(),
            if_exists: IfExistsPolicy::default(),
            disable: false,
            disable_signature: false,
            comment_prefix: DEFAULT_COMMENT_PREFIX.to_string(),
        }
    }
}

pub const DEFAULT_COMMENT_PREFIX: &str = "# ";

/// Policy applied when a `generate` target already exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfExistsPolicy {
    /// Replace whatever is there.
    Overwrite,
    /// Replace only files carrying the generated-file signature; error on
    /// user-owned files.
    #[default]
    OverwriteTerragrunt,
    /// Leave the existing file untouched.
    Skip,
    /// Fail the unit.
    Error,
    /// Delete the file instead of writing it.
    Remove,
    /// Delete the file only if it carries the generated-file signature.
    RemoveTerragrunt,
}

impl IfExistsPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "overwrite" => Some(Self::Overwrite),
            "overwrite_terragrunt" => Some(Self::OverwriteTerragrunt),
            "skip" => Some(Self::Skip),
            "error" => Some(Self::Error),
            "remove" => Some(Self::Remove),
            "remove_terragrunt" => Some(Self::RemoveTerragrunt),
            _ => None,
        }
    }
}

/// The `remote_state` block.
#[derive(Clone, Debug, Default)]
pub struct RemoteStateConfig {
    pub backend: String,
    pub config: OutputMap,
    pub disable_init: bool,
    /// Optional codegen of the backend file into the scratch dir.
    pub generate: Option<RemoteStateGenerate>,
}

#[derive(Clone, Debug)]
pub struct RemoteStateGenerate {
    pub path: PathBuf,
    pub if_exists: IfExistsPolicy,
}

/// The three hook kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    Before,
    After,
    Error,
}

impl HookKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            HookKind::Before => "before_hook",
            HookKind::After => "after_hook",
            HookKind::Error => "error_hook",
        }
    }
}

/// A single hook declaration.
#[derive(Clone, Debug)]
pub struct Hook {
    pub name: String,
    /// Engine subcommands the hook applies to.
    pub commands: Vec<String>,
    /// Executable and its arguments.
    pub execute: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// For `after` hooks: also run when the engine failed.
    pub run_on_error: bool,
    pub suppress_stdout: bool,
    /// Evaluated `if` predicate; `None` means unconditional.
    pub condition: Option<bool>,
}

impl Hook {
    pub fn applies_to(&self, command: &str) -> bool {
        self.condition.unwrap_or(true) && self.commands.iter().any(|c| c == command)
    }
}

/// How an `include` merges the parent config into the child.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IncludeMergeStrategy {
    /// Child sections overwrite parent sections wholesale.
    #[default]
    Shallow,
    /// Maps are merged, lists concatenated, hooks and extra-args merged by
    /// name with the child winning.
    Deep,
    /// The child is taken untouched; parent locals remain visible.
    NoMerge,
    /// Like shallow, but the included file must be a root config.
    Strict,
}

impl IncludeMergeStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "shallow" => Some(Self::Shallow),
            "deep" => Some(Self::Deep),
            "no_merge" => Some(Self::NoMerge),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }
}

/// One `include` block, pre-evaluation.
#[derive(Clone, Debug)]
pub struct IncludeConfig {
    pub label: String,
    /// Path of the included file as evaluated, absolute.
    pub path: PathBuf,
    pub merge_strategy: IncludeMergeStrategy,
    /// Make the parent's locals available as `include.<label>`.
    pub expose: bool,
}

/// Diagnostic severity, mirroring what the parser reports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Error,
    Warning,
    Info,
}

impl Severity {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured parser or evaluator diagnostic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file: PathBuf,
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub byte: Option<usize>,
    pub severity: Severity,
    pub summary: String,
    pub detail: Option<String>,
    pub snippet: Option<String>,
}

impl Diagnostic {
    pub fn error(file: impl Into<PathBuf>, summary: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line: None,
            column: None,
            byte: None,
            severity: Severity::Error,
            summary: summary.into(),
            detail: None,
            snippet: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_location(mut self, line: usize, column: usize) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    /// Attaches the offending source line when the location is known.
    pub fn with_snippet_from(mut self, source: &str) -> Self {
        if let Some(line) = self.line {
            self.snippet = source.lines().nth(line.saturating_sub(1)).map(str::to_string);
        }
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file.display())?;
        if let (Some(line), Some(column)) = (self.line, self.column) {
            write!(f, ":{line}:{column}")?;
        }
        write!(f, ": {}: {}", self.severity, self.summary)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        if let Some(snippet) = &self.snippet {
            write!(f, "\n    | {snippet}")?;
        }
        Ok(())
    }
}

/// Resolves a dependency's `config_path` against the directory of the unit
/// that declares it.
pub fn dependency_dir(unit_dir: &Path, dep: &DependencyConfig) -> PathBuf {
    if dep.config_path.is_absolute() {
        crate::utils::canonicalized(&dep.config_path)
    } else {
        crate::utils::canonicalized(unit_dir.join(&dep.config_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_command_defaults() {
        let dep = DependencyConfig {
            name: "vpc".to_string(),
            config_path: "../vpc".into(),
            mock_outputs: None,
            mock_merge_strategy: MockMergeStrategy::NoMerge,
            mock_allowed_commands: None,
            skip_outputs: false,
        };
        assert!(dep.mocks_allowed("plan"));
        assert!(dep.mocks_allowed("validate"));
        assert!(!dep.mocks_allowed("apply"));

        let dep = DependencyConfig { mock_allowed_commands: Some(vec!["apply".to_string()]), ..dep };
        assert!(dep.mocks_allowed("apply"));
        assert!(!dep.mocks_allowed("plan"));
    }

    #[test]
    fn if_exists_tokens() {
        assert_eq!(IfExistsPolicy::parse("overwrite"), Some(IfExistsPolicy::Overwrite));
        assert_eq!(IfExistsPolicy::parse("remove_terragrunt"), Some(IfExistsPolicy::RemoveTerragrunt));
        assert_eq!(IfExistsPolicy::parse("clobber"), None);
    }

    #[test]
    fn diagnostic_renders_location() {
        let diag = Diagnostic::error("/ws/app/terrarun.hcl", "unexpected token")
            .with_location(3, 7)
            .with_snippet_from("a\nb\nlocals {");
        let rendered = diag.to_string();
        assert!(rendered.contains("terrarun.hcl:3:7"));
        assert!(rendered.contains("unexpected token"));
        assert!(rendered.contains("locals {"));
    }

    #[test]
    fn optimizable_predicate() {
        let mut cfg = UnitConfig { remote_state: Some(RemoteStateConfig::default()), ..Default::default() };
        assert!(cfg.is_output_optimizable());
        cfg.generate.insert("backend".into(), GenerateConfig::new("backend", "backend.tf", ""));
        assert!(!cfg.is_output_optimizable());
    }
}
