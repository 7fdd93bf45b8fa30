//! Execution of units
//!
//! A unit runs through a fixed pipeline: materialize the scratch dir,
//! auto-init, before hooks, the engine invocation itself, after/error hooks,
//! then publishing outputs for consumers. The pipeline is the same for a
//! single unit and for every node of a multi-unit run; ordering across units
//! is the scheduler's business.

use crate::{
    cache::{CachedOutputs, OutputCache},
    config::{HookKind, UnitConfig},
    engine::{self, CaptureMode, ExitClass, Invocation},
    error::{Result, RunError},
    hooks::{self, HookContext},
    utils,
    value::{OutputMap, Value},
    workdir::{self, PrepareOptions},
    Orchestrator,
};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

pub mod scheduler;
pub mod summary;
pub use summary::{RunSummary, UnitReport};

const ENGINE_ATTEMPTS: usize = 3;
const ENGINE_BACKOFF: Duration = Duration::from_secs(3);

/// Options of one run, shared by every unit it executes.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// The engine subcommand.
    pub command: String,
    /// Caller-provided trailing engine args (everything after `--`).
    pub args: Vec<String>,
    pub parallelism: usize,
    /// Keep running consumers of failed or unapplied dependencies, resolving
    /// their outputs from mocks where possible.
    pub ignore_dependency_errors: bool,
    pub no_auto_init: bool,
    /// Attach the orchestrator's stdin to the engine, for interactive
    /// subcommands.
    pub open_stdin: bool,
}

impl RunOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            parallelism: num_cpus::get(),
            ignore_dependency_errors: false,
            no_auto_init: false,
            open_stdin: false,
        }
    }

    #[must_use]
    pub fn args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args = args.into_iter().collect();
        self
    }

    #[must_use]
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        assert!(parallelism > 0);
        self.parallelism = parallelism;
        self
    }

    /// Whether the DAG must be walked dependents-first.
    pub fn is_destructive(&self) -> bool {
        self.command == "destroy"
    }
}

/// Executes single units through the full pipeline.
pub(crate) struct UnitRunner<'a> {
    orch: &'a Orchestrator,
    opts: &'a RunOptions,
}

impl<'a> UnitRunner<'a> {
    pub(crate) fn new(orch: &'a Orchestrator, opts: &'a RunOptions) -> Self {
        Self { orch, opts }
    }

    /// Runs the pipeline for the unit at `unit_dir`. `has_consumers` enables
    /// publishing outputs back to the cache after a successful apply.
    pub(crate) fn execute(&self, unit_dir: &Path, has_consumers: bool) -> Result<ExitClass> {
        let orch = self.orch;
        let command = self.opts.command.as_str();

        let config = match orch.resolve_full(unit_dir, command) {
            Err(err @ RunError::DependencyNotApplied { .. })
                if self.opts.ignore_dependency_errors =>
            {
                orch.reporter.warn(
                    Some(unit_dir),
                    format!("ignoring dependency error per run options: {err}"),
                );
                orch.resolve_shallow(unit_dir, command)?
            }
            other => other?,
        };

        if config.skip {
            orch.reporter.info(Some(unit_dir), "skipping unit (skip = true)");
            return Ok(ExitClass::Success);
        }
        if self.opts.is_destructive() && config.prevent_destroy {
            orch.reporter
                .warn(Some(unit_dir), "prevent_destroy is set, refusing to destroy this unit");
            return Ok(ExitClass::Success);
        }

        let prepare_opts = PrepareOptions {
            source_override: orch.source_override.as_deref(),
            fetcher: orch.fetcher.as_ref(),
            reporter: &orch.reporter,
        };
        let scratch = workdir::prepare(unit_dir, &config, &prepare_opts)?;

        let (mut args, extra_env) = engine::build_args(
            &config,
            command,
            &self.opts.args,
            unit_dir,
            orch.no_color,
            self.opts.open_stdin,
        );

        // Plan artifact wiring: plan writes the file apply later reads.
        let planfile = self.planfile(unit_dir);
        if command == "plan" {
            if let Some(plan) = &planfile {
                if !args.iter().any(|a| a.starts_with("-out")) {
                    orch.artifacts.ensure_parent(plan)?;
                    args.push(format!("-out={}", plan.display()));
                }
            }
        }
        if command == "apply" {
            if let Some(plan) = orch.artifacts.plan_path(unit_dir) {
                let has_positional = self.opts.args.iter().any(|a| !a.starts_with('-'));
                if plan.is_file() && !has_positional {
                    // apply from the recorded plan, skipping a fresh plan
                    args.push(plan.display().to_string());
                }
            }
        }

        let detailed = engine::wants_detailed_exitcode(command, &args);
        let env = engine::build_child_env(
            &config.inputs,
            &extra_env,
            &orch.auth_env,
            unit_dir,
            command,
            self.opts.open_stdin,
        );

        self.auto_init(&config, unit_dir, &scratch, &env)?;

        let hook_ctx = HookContext {
            command,
            unit: unit_dir,
            work_dir: &scratch,
            env: &env,
            reporter: &orch.reporter,
        };
        hooks::run_hooks(HookKind::Before, &config.before_hooks, &hook_ctx, false)?;

        let invocation = Invocation {
            engine: &orch.engine,
            command: command.to_string(),
            args,
            env: env.clone(),
            cwd: scratch.clone(),
            open_stdin: self.opts.open_stdin,
            detailed_exitcode: detailed,
            capture: CaptureMode::Stream,
            reporter: &orch.reporter,
            unit: unit_dir.to_path_buf(),
            cancel: orch.cancel.clone(),
        };
        let result = invocation.run_with_retry(ENGINE_ATTEMPTS, ENGINE_BACKOFF);

        let engine_failed = !matches!(&result, Ok(outcome) if outcome.class.is_success());
        hooks::run_hooks(HookKind::After, &config.after_hooks, &hook_ctx, engine_failed)?;
        hooks::run_hooks(HookKind::Error, &config.error_hooks, &hook_ctx, engine_failed)?;

        let outcome = result?.into_result(&orch.engine, command)?;

        if command == "plan" {
            self.export_json_plan(unit_dir, &scratch, planfile.as_deref(), &env)?;
        }
        if command == "apply" && has_consumers {
            self.publish_outputs(unit_dir, &scratch, &env);
        }

        Ok(outcome.class)
    }

    /// The plan artifact this run reads or writes, if any. With only a JSON
    /// out dir configured, the binary plan lands in the scratch dir.
    fn planfile(&self, unit_dir: &Path) -> Option<PathBuf> {
        if let Some(plan) = self.orch.artifacts.plan_path(unit_dir) {
            return Some(plan);
        }
        self.orch
            .artifacts
            .has_json_plan_dir()
            .then(|| workdir::scratch_dir(unit_dir).join(crate::artifacts::PLAN_FILE))
    }

    /// Runs `engine init` once per fresh scratch dir for commands that need
    /// an initialized working directory.
    fn auto_init(
        &self,
        config: &UnitConfig,
        unit_dir: &Path,
        scratch: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        if self.opts.no_auto_init
            || !engine::INIT_REQUIRED_COMMANDS.contains(&self.opts.command.as_str())
        {
            return Ok(());
        }
        ensure_initialized(self.orch, config, unit_dir, scratch, env)
    }

    /// Converts the written planfile into a JSON plan artifact via
    /// `show -json`, captured atomically.
    fn export_json_plan(
        &self,
        unit_dir: &Path,
        scratch: &Path,
        planfile: Option<&Path>,
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        let Some(json_path) = self.orch.artifacts.json_plan_path(unit_dir) else {
            return Ok(());
        };
        let Some(planfile) = planfile else { return Ok(()) };
        if !planfile.is_file() {
            return Ok(());
        }

        let invocation = Invocation {
            engine: &self.orch.engine,
            command: "show".to_string(),
            args: vec!["-json".to_string(), planfile.display().to_string()],
            env: env.clone(),
            cwd: scratch.to_path_buf(),
            open_stdin: false,
            detailed_exitcode: false,
            capture: CaptureMode::Buffer,
            reporter: &self.orch.reporter,
            unit: unit_dir.to_path_buf(),
            cancel: self.orch.cancel.clone(),
        };
        let outcome = invocation.run()?.into_result(&self.orch.engine, "show")?;
        self.orch.artifacts.ensure_parent(&json_path)?;
        utils::write(&json_path, &outcome.stdout)?;
        Ok(())
    }

    /// Seeds the output cache after a successful apply so consumers scheduled
    /// next read the fresh outputs without re-invoking the producer.
    fn publish_outputs(
        &self,
        unit_dir: &Path,
        scratch: &Path,
        env: &BTreeMap<String, String>,
    ) {
        match self.orch.engine_outputs(unit_dir, scratch, env) {
            Ok(outputs) => OutputCache::global().seed(unit_dir, outputs),
            Err(err) => {
                debug!(unit = %unit_dir.display(), "could not publish outputs: {err}");
            }
        }
    }
}

/// Runs `engine init` in `scratch` unless it is already initialized or the
/// unit's `remote_state` block disables init.
pub(crate) fn ensure_initialized(
    orch: &Orchestrator,
    config: &UnitConfig,
    unit_dir: &Path,
    scratch: &Path,
    env: &BTreeMap<String, String>,
) -> Result<()> {
    if config.remote_state.as_ref().map(|rs| rs.disable_init).unwrap_or(false) {
        debug!(unit = %unit_dir.display(), "auto-init disabled by remote_state");
        return Ok(());
    }
    if scratch.join(".terraform").is_dir() {
        return Ok(());
    }

    let mut args = vec!["-input=false".to_string()];
    if orch.no_color {
        args.push("-no-color".to_string());
    }
    let invocation = Invocation {
        engine: &orch.engine,
        command: "init".to_string(),
        args,
        env: env.clone(),
        cwd: scratch.to_path_buf(),
        open_stdin: false,
        detailed_exitcode: false,
        capture: CaptureMode::Stream,
        reporter: &orch.reporter,
        unit: unit_dir.to_path_buf(),
        cancel: orch.cancel.clone(),
    };
    invocation
        .run_with_retry(ENGINE_ATTEMPTS, ENGINE_BACKOFF)?
        .into_result(&orch.engine, "init")?;
    Ok(())
}

/// Parses `engine output -json` stdout: a map from output name to
/// `{value, type, sensitive}`. An empty map means the producer has no
/// applied outputs.
pub(crate) fn parse_output_json(stdout: &[u8]) -> Result<CachedOutputs> {
    let parsed: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(stdout)
        .map_err(|err| RunError::msg(format!("invalid engine output JSON: {err}")))?;
    if parsed.is_empty() {
        return Ok(CachedOutputs::NotApplied);
    }
    let mut outputs = OutputMap::new();
    for (name, entry) in parsed {
        let value = entry.get("value").cloned().unwrap_or(serde_json::Value::Null);
        outputs.insert(name, Value::from_json(value));
    }
    Ok(CachedOutputs::applied(outputs))
}

/// Reads outputs directly from a state file, the `fetch-from-state` path.
pub(crate) fn parse_state_outputs(state_file: &Path) -> Result<CachedOutputs> {
    if !state_file.is_file() {
        return Ok(CachedOutputs::NotApplied);
    }
    let content = utils::read_to_string(state_file)?;
    let parsed: serde_json::Value = serde_json::from_str(&content)
        .map_err(|err| RunError::msg(format!("invalid state file {}: {err}", state_file.display())))?;
    let Some(entries) = parsed.get("outputs").and_then(|o| o.as_object()) else {
        return Ok(CachedOutputs::NotApplied);
    };
    if entries.is_empty() {
        return Ok(CachedOutputs::NotApplied);
    }
    let mut outputs = OutputMap::new();
    for (name, entry) in entries {
        let value = entry.get("value").cloned().unwrap_or(serde_json::Value::Null);
        outputs.insert(name.clone(), Value::from_json(value));
    }
    Ok(CachedOutputs::applied(outputs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_json_parses_values() {
        let stdout = br#"{"vpc_id": {"sensitive": false, "type": "string", "value": "vpc-123"}}"#;
        let outputs = parse_output_json(stdout).unwrap();
        match outputs {
            CachedOutputs::Applied(map) => {
                assert_eq!(map.get("vpc_id"), Some(&Value::String("vpc-123".into())));
            }
            CachedOutputs::NotApplied => panic!("expected applied outputs"),
        }
    }

    #[test]
    fn empty_output_json_is_not_applied() {
        assert!(!parse_output_json(b"{}").unwrap().is_applied());
    }

    #[test]
    fn state_outputs_read_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let state = tmp.path().join("terraform.tfstate");
        std::fs::write(
            &state,
            r#"{"version": 4, "outputs": {"truth": {"value": "The answer is 0", "type": "string"}}}"#,
        )
        .unwrap();
        let outputs = parse_state_outputs(&state).unwrap();
        match outputs {
            CachedOutputs::Applied(map) => {
                assert_eq!(map.get("truth"), Some(&Value::String("The answer is 0".into())));
            }
            CachedOutputs::NotApplied => panic!("expected applied outputs"),
        }
    }

    #[test]
    fn missing_state_file_is_not_applied() {
        let tmp = tempfile::tempdir().unwrap();
        let outputs = parse_state_outputs(&tmp.path().join("terraform.tfstate")).unwrap();
        assert!(!outputs.is_applied());
    }
}
