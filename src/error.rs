use crate::config::Diagnostic;
use semver::{Version, VersionReq};
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type Result<T, E = RunError> = std::result::Result<T, E>;

/// Various error types
#[derive(Debug, Error)]
pub enum RunError {
    /// Internal IO error with the path that caused it
    #[error(transparent)]
    Io(#[from] IoError),
    /// The per-unit configuration file could not be parsed
    #[error("{0}")]
    ConfigParse(Box<Diagnostic>),
    /// The configuration parsed but violates a semantic rule, e.g. duplicate
    /// `generate` labels or reading `inputs` from a dependency
    #[error("{}: {message}", .file.display())]
    ConfigSemantic { file: PathBuf, message: String },
    /// The unit graph contains a cycle
    #[error("dependency cycle detected: {}", display_cycle(.0))]
    Cycle(Vec<PathBuf>),
    /// A dependency has no applied outputs and no mocks were permitted
    #[error(
        "{} depends on {}, which has no applied outputs; apply the dependency first or configure mock outputs",
        .consumer.display(),
        .producer.display()
    )]
    DependencyNotApplied { consumer: PathBuf, producer: PathBuf },
    /// A `dependency` block points at a directory without a config file
    #[error("{} declares a dependency on {}, which does not exist", .consumer.display(), .missing.display())]
    MissingDependencyDir { consumer: PathBuf, missing: PathBuf },
    /// The engine exited non-zero
    #[error("{engine} {command} exited with code {code}")]
    EngineInvocation { engine: String, command: String, code: i32 },
    /// A configured version constraint is not met
    #[error("{subject} version {actual} does not satisfy the constraint {constraint}")]
    VersionConstraint { subject: &'static str, constraint: VersionReq, actual: Version },
    /// Failure while materializing or cleaning a unit working directory
    #[error("working directory error at {}: {message}", .path.display())]
    WorkingDir { path: PathBuf, message: String },
    /// The run was interrupted
    #[error("run cancelled")]
    Cancelled,
    /// Invariant violation inside the orchestrator itself
    #[error("internal error: {0}")]
    Internal(String),
    /// General purpose message
    #[error("{0}")]
    Message(String),
}

impl RunError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        IoError::new(err, path).into()
    }

    /// Create an error from a string
    pub fn msg(msg: impl std::fmt::Display) -> Self {
        RunError::Message(msg.to_string())
    }

    pub fn semantic(file: impl Into<PathBuf>, msg: impl std::fmt::Display) -> Self {
        RunError::ConfigSemantic { file: file.into(), message: msg.to_string() }
    }

    pub fn working_dir(path: impl Into<PathBuf>, msg: impl std::fmt::Display) -> Self {
        RunError::WorkingDir { path: path.into(), message: msg.to_string() }
    }

    /// The coarse classification used by the run summary and exit handling.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::Io(_) | RunError::WorkingDir { .. } => ErrorKind::WorkingDirIo,
            RunError::ConfigParse(_) => ErrorKind::ConfigParse,
            RunError::ConfigSemantic { .. } => ErrorKind::ConfigSemantic,
            RunError::Cycle(_) => ErrorKind::Cycle,
            RunError::DependencyNotApplied { .. } => ErrorKind::DependencyNotApplied,
            RunError::MissingDependencyDir { .. } => ErrorKind::MissingDependencyDir,
            RunError::EngineInvocation { .. } => ErrorKind::EngineInvocation,
            RunError::VersionConstraint { .. } => ErrorKind::VersionConstraint,
            RunError::Cancelled => ErrorKind::Cancelled,
            RunError::Internal(_) | RunError::Message(_) => ErrorKind::FatalInternal,
        }
    }

    /// Whether the whole run must abort instead of failing a single unit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConfigParse | ErrorKind::VersionConstraint | ErrorKind::Cycle
        )
    }
}

/// Coarse failure kinds, as reported in run summaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConfigParse,
    ConfigSemantic,
    Cycle,
    DependencyNotApplied,
    MissingDependencyDir,
    EngineInvocation,
    VersionConstraint,
    WorkingDirIo,
    Cancelled,
    FatalInternal,
}

impl ErrorKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigParse => "config-parse",
            ErrorKind::ConfigSemantic => "config-semantic",
            ErrorKind::Cycle => "cycle",
            ErrorKind::DependencyNotApplied => "dependency-not-applied",
            ErrorKind::MissingDependencyDir => "missing-dependency-dir",
            ErrorKind::EngineInvocation => "engine-invocation",
            ErrorKind::VersionConstraint => "version-constraint",
            ErrorKind::WorkingDirIo => "working-dir-io",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::FatalInternal => "fatal-internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn display_cycle(paths: &[PathBuf]) -> String {
    paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(" -> ")
}

#[derive(Debug, Error)]
#[error("\"{}\": {io}", self.path.display())]
pub struct IoError {
    io: io::Error,
    path: PathBuf,
}

impl IoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inner(&self) -> &io::Error {
        &self.io
    }
}

impl From<IoError> for io::Error {
    fn from(err: IoError) -> Self {
        err.io
    }
}
