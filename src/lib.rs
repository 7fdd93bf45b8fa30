//! Configuration-driven orchestration of a Terraform-compatible engine.
//!
//! `terrarun` composes many invocations of an external
//! infrastructure-provisioning binary across a workspace of units. For each
//! unit it resolves an HCL config (includes, dependencies, generated files,
//! hooks), materializes a working directory, and executes the engine with
//! carefully constructed arguments while multiplexing its output. Multi-unit
//! runs walk the dependency DAG concurrently, honoring ordering, concurrency
//! limits and cancellation.

#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;

pub mod artifacts;
pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod hooks;
pub mod report;
pub mod resolver;
pub mod run;
pub mod unit;
pub mod utils;
pub mod value;
pub mod workdir;

pub use artifacts::ArtifactStore;
pub use cache::{CachedOutputs, OutputCache};
pub use config::{resolve_config, EvalSettings, UnitConfig, CONFIG_FILENAME};
pub use engine::{Engine, ExitClass};
pub use error::{ErrorKind, Result, RunError};
pub use report::{LogFormat, LogLevel, PathMode, Reporter, ReporterOptions};
pub use resolver::{ExternalPolicy, Graph, GraphOptions};
pub use run::{RunOptions, RunSummary};
pub use unit::{Unit, UnitState};
pub use value::{MockMergeStrategy, OutputMap, Value};

use crate::{
    config::OutputSource,
    run::{scheduler, UnitReport, UnitRunner},
    workdir::{DefaultFetcher, SourceFetcher},
};
use semver::VersionReq;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

/// Cooperative cancellation signal. One token reaches the coordinator, every
/// worker and their children; cancelling stops new work and drains running
/// engines within the grace deadline.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Represents a unit workspace and handles engine runs across it.
pub struct Orchestrator {
    /// Root of the workspace (or the unit directory for single-unit runs).
    pub workspace: PathBuf,
    /// Non-default config filename, [`CONFIG_FILENAME`] otherwise.
    pub config_filename: String,
    pub engine: Engine,
    pub reporter: Reporter,
    pub artifacts: ArtifactStore,
    /// External-path policy and queue excludes for graph construction.
    pub graph_opts: GraphOptions,
    /// CLI override of every unit's `terraform.source`.
    pub source_override: Option<String>,
    /// Extra env vars from the auth provider command, added to every child.
    pub auth_env: BTreeMap<String, String>,
    /// Read dependency outputs from state files instead of `output -json`.
    pub fetch_from_state: bool,
    pub no_auto_init: bool,
    /// Pass `-no-color` through to the engine.
    pub no_color: bool,
    /// Engine version constraint supplied on the command line.
    pub engine_constraint: Option<VersionReq>,
    pub cancel: CancelToken,
    pub(crate) fetcher: Box<dyn SourceFetcher>,
}

impl Orchestrator {
    /// Convenience function to call `OrchestratorBuilder::default()`.
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Runs `opts.command` on the workspace's own unit: the same pipeline as
    /// a multi-unit run, with a one-node DAG.
    pub fn run(&self, opts: &RunOptions) -> Result<RunSummary> {
        let unit = utils::canonicalize(&self.workspace)?;
        let started = Instant::now();
        let runner = UnitRunner::new(self, opts);

        let mut summary = RunSummary::default();
        match runner.execute(&unit, false) {
            Ok(exit) => {
                summary.record(UnitReport {
                    path: PathBuf::from("."),
                    state: UnitState::Succeeded,
                    reason: None,
                    duration: started.elapsed(),
                    exit: Some(exit),
                });
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                if matches!(err, RunError::Cancelled) {
                    summary.set_cancelled();
                }
                self.reporter.error(Some(&unit), format!("unit failed: {err}"));
                summary.record(UnitReport {
                    path: PathBuf::from("."),
                    state: UnitState::Failed,
                    reason: Some(format!("{} ({})", err, err.kind())),
                    duration: started.elapsed(),
                    exit: None,
                });
            }
        }
        summary.duration = started.elapsed();
        if summary.errored() {
            summary.render(&self.reporter);
        }
        Ok(summary)
    }

    /// Discovers every unit under the workspace and runs `opts.command` on
    /// all of them in dependency order.
    pub fn run_all(&self, opts: &RunOptions) -> Result<RunSummary> {
        let settings = self.shallow_settings(&opts.command);
        let mut graph = Graph::discover(&self.workspace, &settings, &self.graph_opts)?;
        debug!(units = graph.len(), "resolved unit graph");

        let summary = scheduler::execute_graph(&mut graph, self, opts)?;
        summary.render(&self.reporter);
        Ok(summary)
    }

    /// The dependency graph in dot notation, for `run --all --graph`.
    pub fn graph_dot(&self, command: &str) -> Result<String> {
        let settings = self.shallow_settings(command);
        Graph::discover(&self.workspace, &settings, &self.graph_opts).map(|graph| graph.dot())
    }

    /// Returns the memoized outputs of the producer at `producer`, computing
    /// them on first access (single-flight per process).
    pub fn fetch_outputs(&self, producer: &Path) -> Result<CachedOutputs> {
        OutputCache::global().get_or_compute(producer, || self.compute_outputs(producer))
    }

    /// Full config resolution with live dependency outputs.
    pub(crate) fn resolve_full(&self, unit_dir: &Path, command: &str) -> Result<UnitConfig> {
        let settings = EvalSettings {
            workspace: &self.workspace,
            config_filename: &self.config_filename,
            command,
            outputs: Some(self),
            engine_version: Some(&self.engine.version),
        };
        let config = config::resolve_config(unit_dir, &settings)?;
        self.check_cli_constraint()?;
        Ok(config)
    }

    /// Shallow resolution: dependency outputs come from mocks, no engine is
    /// invoked. Used during discovery and as the ignore-dependency-errors
    /// fallback.
    pub(crate) fn resolve_shallow(&self, unit_dir: &Path, command: &str) -> Result<UnitConfig> {
        let settings = self.shallow_settings(command);
        config::resolve_config(unit_dir, &settings)
    }

    fn shallow_settings<'a>(&'a self, command: &'a str) -> EvalSettings<'a> {
        EvalSettings {
            workspace: &self.workspace,
            config_filename: &self.config_filename,
            command,
            outputs: None,
            engine_version: Some(&self.engine.version),
        }
    }

    fn check_cli_constraint(&self) -> Result<()> {
        if let Some(constraint) = &self.engine_constraint {
            if !constraint.matches(&self.engine.version) {
                return Err(RunError::VersionConstraint {
                    subject: "engine",
                    constraint: constraint.clone(),
                    actual: self.engine.version.clone(),
                });
            }
        }
        Ok(())
    }

    /// Computes a producer's outputs via one of the three modes: state-read
    /// (`fetch-from-state` or an optimizable producer with local state),
    /// else a full materialization plus `output -json`.
    fn compute_outputs(&self, producer: &Path) -> Result<CachedOutputs> {
        let config = self.resolve_shallow(producer, "output")?;
        let scratch = workdir::scratch_dir(producer);

        let state_candidates =
            [scratch.join("terraform.tfstate"), producer.join("terraform.tfstate")];
        if self.fetch_from_state || config.is_output_optimizable() {
            for state in &state_candidates {
                if state.is_file() {
                    trace!(
                        producer = %producer.display(),
                        state = %state.display(),
                        "reading outputs from state"
                    );
                    return run::parse_state_outputs(state);
                }
            }
            if self.fetch_from_state {
                return Ok(CachedOutputs::NotApplied);
            }
        }

        let prepare_opts = workdir::PrepareOptions {
            source_override: self.source_override.as_deref(),
            fetcher: self.fetcher.as_ref(),
            reporter: &self.reporter,
        };
        let scratch = workdir::prepare(producer, &config, &prepare_opts)?;
        let env = engine::build_child_env(
            &config.inputs,
            &BTreeMap::new(),
            &self.auth_env,
            producer,
            "output",
            false,
        );
        run::ensure_initialized(self, &config, producer, &scratch, &env)?;
        self.engine_outputs(producer, &scratch, &env)
    }

    /// Runs `output -json` in `scratch` and parses the result. A non-zero
    /// exit is treated as not-applied: fresh units have no state to read.
    pub(crate) fn engine_outputs(
        &self,
        unit_dir: &Path,
        scratch: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<CachedOutputs> {
        let invocation = engine::Invocation {
            engine: &self.engine,
            command: "output".to_string(),
            args: vec!["-json".to_string()],
            env: env.clone(),
            cwd: scratch.to_path_buf(),
            open_stdin: false,
            detailed_exitcode: false,
            capture: engine::CaptureMode::Buffer,
            reporter: &self.reporter,
            unit: unit_dir.to_path_buf(),
            cancel: self.cancel.clone(),
        };
        let outcome = invocation.run()?;
        if !outcome.class.is_success() {
            debug!(
                unit = %unit_dir.display(),
                "output -json failed, treating producer as not applied: {}",
                outcome.stderr_tail
            );
            return Ok(CachedOutputs::NotApplied);
        }
        run::parse_output_json(&outcome.stdout)
    }
}

impl OutputSource for Orchestrator {
    fn outputs_of(&self, producer_dir: &Path) -> Result<CachedOutputs> {
        self.fetch_outputs(producer_dir)
    }
}

/// Builder for [`Orchestrator`] instances.
pub struct OrchestratorBuilder {
    workspace: Option<PathBuf>,
    config_filename: String,
    engine: Option<Engine>,
    engine_path: Option<PathBuf>,
    reporter: Option<Reporter>,
    out_dir: Option<PathBuf>,
    json_out_dir: Option<PathBuf>,
    graph_opts: GraphOptions,
    source_override: Option<String>,
    auth_env: BTreeMap<String, String>,
    fetch_from_state: bool,
    no_auto_init: bool,
    no_color: bool,
    engine_constraint: Option<VersionReq>,
    cancel: CancelToken,
    fetcher: Option<Box<dyn SourceFetcher>>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self {
            workspace: None,
            config_filename: CONFIG_FILENAME.to_string(),
            engine: None,
            engine_path: None,
            reporter: None,
            out_dir: None,
            json_out_dir: None,
            graph_opts: GraphOptions::default(),
            source_override: None,
            auth_env: BTreeMap::new(),
            fetch_from_state: false,
            no_auto_init: false,
            no_color: false,
            engine_constraint: None,
            cancel: CancelToken::new(),
            fetcher: None,
        }
    }
}

impl OrchestratorBuilder {
    #[must_use]
    pub fn workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    #[must_use]
    pub fn config_filename(mut self, filename: impl Into<String>) -> Self {
        self.config_filename = filename.into();
        self
    }

    /// Use an already-probed engine, skipping [`Engine::locate`].
    #[must_use]
    pub fn engine(mut self, engine: Engine) -> Self {
        self.engine = Some(engine);
        self
    }

    #[must_use]
    pub fn engine_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.engine_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    #[must_use]
    pub fn out_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.out_dir = dir;
        self
    }

    #[must_use]
    pub fn json_out_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.json_out_dir = dir;
        self
    }

    #[must_use]
    pub fn graph_opts(mut self, opts: GraphOptions) -> Self {
        self.graph_opts = opts;
        self
    }

    #[must_use]
    pub fn source_override(mut self, source: Option<String>) -> Self {
        self.source_override = source;
        self
    }

    #[must_use]
    pub fn auth_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.auth_env = env;
        self
    }

    #[must_use]
    pub fn fetch_from_state(mut self, enabled: bool) -> Self {
        self.fetch_from_state = enabled;
        self
    }

    #[must_use]
    pub fn no_auto_init(mut self, disabled: bool) -> Self {
        self.no_auto_init = disabled;
        self
    }

    #[must_use]
    pub fn no_color(mut self, disabled: bool) -> Self {
        self.no_color = disabled;
        self
    }

    #[must_use]
    pub fn engine_constraint(mut self, constraint: Option<VersionReq>) -> Self {
        self.engine_constraint = constraint;
        self
    }

    #[must_use]
    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Replace the source fetcher, used by tests.
    #[must_use]
    pub fn fetcher(mut self, fetcher: Box<dyn SourceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let workspace = match self.workspace {
            Some(workspace) => utils::canonicalize(workspace)?,
            None => utils::current_dir()?,
        };
        let engine = match self.engine {
            Some(engine) => engine,
            None => Engine::locate(self.engine_path.as_deref())?,
        };
        let reporter = self.reporter.unwrap_or_else(|| {
            Reporter::new(ReporterOptions { workspace: workspace.clone(), ..Default::default() })
        });
        let artifacts = ArtifactStore::new(workspace.clone(), self.out_dir, self.json_out_dir);

        Ok(Orchestrator {
            workspace,
            config_filename: self.config_filename,
            engine,
            reporter,
            artifacts,
            graph_opts: self.graph_opts,
            source_override: self.source_override,
            auth_env: self.auth_env,
            fetch_from_state: self.fetch_from_state,
            no_auto_init: self.no_auto_init,
            no_color: self.no_color,
            engine_constraint: self.engine_constraint,
            cancel: self.cancel,
            fetcher: self.fetcher.unwrap_or_else(|| Box::new(DefaultFetcher)),
        })
    }
}

/// Runs the auth provider command and parses its stdout as a JSON map of
/// environment variables to inject into every child.
pub fn auth_provider_env(command: &Path) -> Result<BTreeMap<String, String>> {
    let output = std::process::Command::new(command)
        .stdin(std::process::Stdio::null())
        .output()
        .map_err(|err| RunError::io(err, command))?;
    if !output.status.success() {
        return Err(RunError::msg(format!(
            "auth provider command {} exited with {}",
            command.display(),
            output.status
        )));
    }
    let parsed: BTreeMap<String, serde_json::Value> = serde_json::from_slice(&output.stdout)
        .map_err(|err| {
            RunError::msg(format!("auth provider command produced invalid JSON: {err}"))
        })?;
    Ok(parsed
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}
