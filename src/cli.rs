//! Command line surface of the `terrarun` binary
//!
//! Two invocation shapes:
//!
//! - `terrarun <subcommand> [engine-args…]` runs the subcommand on the
//!   current working directory's unit;
//! - `terrarun run --all [flags] -- <subcommand> [engine-args…]` walks the
//!   whole dependency graph.

use crate::{
    auth_provider_env, report::CustomFormat, CancelToken, ExternalPolicy, GraphOptions,
    LogFormat, LogLevel, Orchestrator, PathMode, Reporter, ReporterOptions, Result, RunError,
    RunOptions,
};
use clap::{Args, Parser, Subcommand};
use semver::VersionReq;
use std::path::PathBuf;

/// CLI options
#[derive(Debug, Parser)]
#[command(name = "terrarun", version, author)]
#[command(about = "Configuration-driven orchestrator for Terraform-compatible binaries")]
pub struct Opts {
    /// Sets the unit or unit-root path.
    #[arg(long, global = true, value_name = "PATH")]
    pub working_dir: Option<PathBuf>,
    /// Non-default config filename.
    #[arg(long, global = true, value_name = "NAME")]
    pub config: Option<String>,
    /// Never prompt; refusals become errors.
    #[arg(long, global = true)]
    pub non_interactive: bool,
    /// Minimum emitted log level.
    #[arg(long, global = true, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,
    /// Log encoder: pretty, key-value, json or bare.
    #[arg(long, global = true, value_name = "FORMAT", default_value = "pretty")]
    pub log_format: String,
    /// Placeholder template overriding the log format.
    #[arg(long, global = true, value_name = "TEMPLATE")]
    pub log_custom_format: Option<String>,
    /// How unit paths are rendered in log lines.
    #[arg(long, global = true, value_name = "MODE", default_value = "short-relative")]
    pub log_path_mode: String,
    /// Disable ANSI styling; also passed through to the engine.
    #[arg(long, global = true)]
    pub no_color: bool,
    /// Mirror engine stdout to the orchestrator's stdout.
    #[arg(long, global = true)]
    pub tf_forward_stdout: bool,
    /// Override the engine binary.
    #[arg(long, global = true, value_name = "PATH")]
    pub tf_path: Option<PathBuf>,
    /// Root directory for plan artifacts.
    #[arg(long, global = true, value_name = "PATH")]
    pub out_dir: Option<PathBuf>,
    /// Root directory for JSON plan artifacts.
    #[arg(long, global = true, value_name = "PATH")]
    pub json_out_dir: Option<PathBuf>,
    /// Override every unit's terraform source.
    #[arg(long, global = true, value_name = "URL")]
    pub source: Option<String>,
    /// External program yielding env vars as a JSON map.
    #[arg(long, global = true, value_name = "PATH")]
    pub auth_provider_cmd: Option<PathBuf>,
    /// Refuse to create missing state backends.
    #[arg(long, global = true)]
    pub fail_on_state_bucket_creation: bool,
    /// Read dependency outputs from state files instead of `output -json`.
    #[arg(long, global = true)]
    pub fetch_outputs_from_state: bool,
    /// Skip the automatic `init` before commands that need it.
    #[arg(long, global = true)]
    pub no_auto_init: bool,
    /// Attach stdin to the engine, for interactive subcommands.
    #[arg(long, global = true)]
    pub attach_stdin: bool,
    /// Require the engine version to match this constraint.
    #[arg(long, global = true, value_name = "CONSTRAINT")]
    pub engine_version_constraint: Option<String>,
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Run an engine subcommand across many units.
    Run(RunArgs),
    /// Any other subcommand is executed on the current unit.
    #[command(external_subcommand)]
    Engine(Vec<String>),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Act on every unit below the working directory.
    #[arg(long)]
    pub all: bool,
    /// Print the dependency graph in dot notation and exit.
    #[arg(long)]
    pub graph: bool,
    /// Schedule external dependencies as first-class units.
    #[arg(long, conflicts_with = "queue_exclude_external")]
    pub queue_include_external: bool,
    /// Keep external edges for ordering but never run external units.
    #[arg(long)]
    pub queue_exclude_external: bool,
    /// File listing additional units to exclude, one path glob per line.
    #[arg(long, value_name = "PATH")]
    pub queue_excludes_file: Option<PathBuf>,
    /// Keep running consumers of failed dependencies, using mocks.
    #[arg(long, alias = "ignore-dependency-errors")]
    pub queue_ignore_dag_order: bool,
    /// Maximum number of concurrently running units.
    #[arg(long, value_name = "N")]
    pub parallelism: Option<usize>,
    /// The engine subcommand and its arguments.
    #[arg(last = true, required = true, value_name = "SUBCOMMAND [ARGS]")]
    pub engine_args: Vec<String>,
}

/// Parses the CLI surface into an [`Orchestrator`] plus [`RunOptions`] and
/// executes. Returns the process exit code.
pub fn execute(opts: Opts) -> Result<i32> {
    let workspace = match &opts.working_dir {
        Some(dir) => crate::utils::canonicalize(dir)?,
        None => crate::utils::current_dir()?,
    };

    let level: LogLevel = opts.log_level.parse()?;
    let format: LogFormat = opts.log_format.parse()?;
    let path_mode: PathMode = opts.log_path_mode.parse()?;
    // Template validation fails fast, before anything runs.
    let custom = opts.log_custom_format.as_deref().map(CustomFormat::parse).transpose()?;

    let reporter = Reporter::new(ReporterOptions {
        format,
        custom,
        level,
        color: !opts.no_color,
        path_mode,
        workspace: workspace.clone(),
        forward_stdout: opts.tf_forward_stdout,
    });

    let auth_env = match &opts.auth_provider_cmd {
        Some(cmd) => auth_provider_env(cmd)?,
        None => Default::default(),
    };
    let engine_constraint = opts
        .engine_version_constraint
        .as_deref()
        .map(|raw| {
            VersionReq::parse(raw)
                .map_err(|err| RunError::msg(format!("invalid engine version constraint {raw:?}: {err}")))
        })
        .transpose()?;

    if opts.fail_on_state_bucket_creation {
        debug!("state backend provisioning is disabled for this run");
    }

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel())
            .map_err(|err| RunError::Internal(format!("could not install signal handler: {err}")))?;
    }

    let mut builder = Orchestrator::builder()
        .workspace(workspace)
        .reporter(reporter)
        .out_dir(opts.out_dir.clone())
        .json_out_dir(opts.json_out_dir.clone())
        .source_override(opts.source.clone())
        .auth_env(auth_env)
        .fetch_from_state(opts.fetch_outputs_from_state)
        .no_auto_init(opts.no_auto_init)
        .no_color(opts.no_color)
        .engine_constraint(engine_constraint)
        .cancel(cancel);
    if let Some(filename) = &opts.config {
        builder = builder.config_filename(filename.clone());
    }
    if let Some(path) = &opts.tf_path {
        builder = builder.engine_path(path);
    }

    match &opts.command {
        CliCommand::Run(run_args) => {
            let external = if run_args.queue_include_external {
                ExternalPolicy::Include
            } else if run_args.queue_exclude_external {
                ExternalPolicy::Exclude
            } else {
                ExternalPolicy::Prompt
            };
            let orch = builder
                .graph_opts(GraphOptions {
                    external,
                    excludes_file: run_args.queue_excludes_file.clone(),
                    non_interactive: opts.non_interactive,
                })
                .build()?;

            let (command, trailing) = run_args
                .engine_args
                .split_first()
                .ok_or_else(|| RunError::msg("run requires an engine subcommand after --"))?;

            if run_args.graph {
                let dot = orch.graph_dot(command)?;
                print!("{dot}");
                return Ok(0);
            }

            let mut run_opts = RunOptions::new(command.clone()).args(trailing.to_vec());
            if let Some(parallelism) = run_args.parallelism {
                run_opts = run_opts.parallelism(parallelism);
            }
            run_opts.ignore_dependency_errors = run_args.queue_ignore_dag_order;
            run_opts.no_auto_init = opts.no_auto_init;
            run_opts.open_stdin = opts.attach_stdin;

            let summary =
                if run_args.all { orch.run_all(&run_opts)? } else { orch.run(&run_opts)? };
            Ok(summary.exit_code())
        }
        CliCommand::Engine(argv) => {
            let orch = builder
                .graph_opts(GraphOptions {
                    non_interactive: opts.non_interactive,
                    ..Default::default()
                })
                .build()?;
            let (command, trailing) = argv
                .split_first()
                .ok_or_else(|| RunError::msg("missing engine subcommand"))?;

            let mut run_opts = RunOptions::new(command.clone()).args(trailing.to_vec());
            run_opts.no_auto_init = opts.no_auto_init;
            run_opts.open_stdin = opts.attach_stdin;

            let summary = orch.run(&run_opts)?;
            Ok(summary.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Opts::command().debug_assert();
    }

    #[test]
    fn parses_single_unit_shape() {
        let opts = Opts::parse_from(["terrarun", "plan", "-detailed-exitcode"]);
        match opts.command {
            CliCommand::Engine(argv) => {
                assert_eq!(argv, ["plan", "-detailed-exitcode"]);
            }
            other => panic!("expected engine passthrough, got {other:?}"),
        }
    }

    #[test]
    fn parses_run_all_shape() {
        let opts = Opts::parse_from([
            "terrarun",
            "--non-interactive",
            "run",
            "--all",
            "--parallelism",
            "4",
            "--queue-exclude-external",
            "--",
            "apply",
            "-auto-approve",
        ]);
        assert!(opts.non_interactive);
        match opts.command {
            CliCommand::Run(args) => {
                assert!(args.all);
                assert_eq!(args.parallelism, Some(4));
                assert!(args.queue_exclude_external);
                assert_eq!(args.engine_args, ["apply", "-auto-approve"]);
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn include_and_exclude_external_conflict() {
        let result = Opts::try_parse_from([
            "terrarun",
            "run",
            "--all",
            "--queue-include-external",
            "--queue-exclude-external",
            "--",
            "plan",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn global_flags_apply_to_both_shapes() {
        let opts = Opts::parse_from([
            "terrarun",
            "--log-format",
            "json",
            "--tf-forward-stdout",
            "output",
            "-json",
        ]);
        assert_eq!(opts.log_format, "json");
        assert!(opts.tf_forward_stdout);
    }
}
