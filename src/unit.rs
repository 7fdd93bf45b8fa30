//! The unit model
//!
//! A unit is a leaf directory containing one config file and one engine
//! working directory. Units are created at discovery, mutated only by the
//! scheduler that owns them, and dropped when the run ends.

use crate::{config::UnitConfig, engine::ExitClass};
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// Lifecycle state of a unit during a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnitState {
    #[default]
    Pending,
    /// All inbound edges are satisfied; queued for a worker.
    Ready,
    Running,
    Succeeded,
    Failed,
    /// Skipped because a transitive dependency failed.
    FailedUpstream,
    /// Removed from execution by `skip`, an exclude rule or external policy.
    Excluded,
}

impl UnitState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            UnitState::Pending => "pending",
            UnitState::Ready => "ready",
            UnitState::Running => "running",
            UnitState::Succeeded => "succeeded",
            UnitState::Failed => "failed",
            UnitState::FailedUpstream => "failed-upstream",
            UnitState::Excluded => "excluded",
        }
    }

    /// Whether the unit has reached a state it can never leave.
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitState::Succeeded | UnitState::Failed | UnitState::FailedUpstream | UnitState::Excluded
        )
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discovered unit and its resolved config.
#[derive(Clone, Debug)]
pub struct Unit {
    /// Canonical absolute path of the unit directory; the unit's identity.
    path: PathBuf,
    config: UnitConfig,
    state: UnitState,
    work_dir: Option<PathBuf>,
    exit: Option<ExitClass>,
    /// Whether the unit lives outside the workspace root.
    external: bool,
}

impl Unit {
    pub fn new(path: PathBuf, config: UnitConfig) -> Self {
        Self { path, config, state: UnitState::Pending, work_dir: None, exit: None, external: false }
    }

    pub fn external(path: PathBuf, config: UnitConfig) -> Self {
        Self { external: true, ..Self::new(path, config) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &UnitConfig {
        &self.config
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn set_state(&mut self, state: UnitState) {
        trace!(unit = %self.path.display(), from = %self.state, to = %state, "unit transition");
        self.state = state;
    }

    pub fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_deref()
    }

    pub fn set_work_dir(&mut self, dir: PathBuf) {
        self.work_dir = Some(dir);
    }

    pub fn exit(&self) -> Option<ExitClass> {
        self.exit
    }

    pub fn set_exit(&mut self, exit: ExitClass) {
        self.exit = Some(exit);
    }

    pub fn is_external(&self) -> bool {
        self.external
    }
}
