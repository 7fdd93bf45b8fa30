//! Plan artifact layout
//!
//! Plan files land at `<out-dir>/<unit-rel-path>/tfplan.tfplan` and JSON
//! plans at `<json-out-dir>/<unit-rel-path>/tfplan.json`. The mapping is
//! stable: a `plan` followed by an `apply <planfile>` from the same unit
//! reads the exact same path.

use crate::{error::Result, utils};
use std::path::{Path, PathBuf};

/// File name of binary plan artifacts.
pub const PLAN_FILE: &str = "tfplan.tfplan";

/// File name of JSON plan artifacts.
pub const JSON_PLAN_FILE: &str = "tfplan.json";

/// Resolves artifact paths for a run.
#[derive(Clone, Debug, Default)]
pub struct ArtifactStore {
    workspace: PathBuf,
    out_dir: Option<PathBuf>,
    json_out_dir: Option<PathBuf>,
}

impl ArtifactStore {
    pub fn new(workspace: impl Into<PathBuf>, out_dir: Option<PathBuf>, json_out_dir: Option<PathBuf>) -> Self {
        Self { workspace: workspace.into(), out_dir, json_out_dir }
    }

    pub fn has_plan_dir(&self) -> bool {
        self.out_dir.is_some()
    }

    pub fn has_json_plan_dir(&self) -> bool {
        self.json_out_dir.is_some()
    }

    /// The binary plan path for `unit`, if an out dir is configured.
    pub fn plan_path(&self, unit: &Path) -> Option<PathBuf> {
        self.out_dir.as_ref().map(|dir| self.artifact_path(dir, unit, PLAN_FILE))
    }

    /// The JSON plan path for `unit`, if a json out dir is configured.
    pub fn json_plan_path(&self, unit: &Path) -> Option<PathBuf> {
        self.json_out_dir.as_ref().map(|dir| self.artifact_path(dir, unit, JSON_PLAN_FILE))
    }

    /// Creates the parent directory of `artifact` so the engine can write it.
    pub fn ensure_parent(&self, artifact: &Path) -> Result<()> {
        if let Some(parent) = artifact.parent() {
            utils::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// `<root>/<unit-rel-path>/<file>`, with a relative root anchored at the
    /// workspace.
    fn artifact_path(&self, root: &Path, unit: &Path, file: &str) -> PathBuf {
        let root =
            if root.is_absolute() { root.to_path_buf() } else { self.workspace.join(root) };
        let rel = utils::rebase_path(&self.workspace, unit);
        root.join(rel).join(file)
    }
}
