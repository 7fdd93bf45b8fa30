//! Abstraction over the engine command line binary
//!
//! The engine is a black-box child process. This module owns argv and env
//! construction, spawning, stdio draining and exit classification. Stdio is
//! always captured into the structured log channel; forwarding is an
//! additional tee handled by the reporter, never a replacement for capture.

use crate::{
    error::{Result, RunError},
    report::{Reporter, StreamKind},
    utils, CancelToken,
};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use semver::Version;
use std::{
    collections::{BTreeMap, HashMap},
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// The name of the default engine binary on the system.
pub const DEFAULT_ENGINE: &str = "terraform";

/// Environment variable overriding the engine binary path.
pub const ENGINE_PATH_ENV: &str = "TERRARUN_TF_PATH";

/// Orchestrator-internal variables that are never passed to children.
pub const ENV_BLOCKLIST: &[&str] = &[
    "TERRARUN_TF_PATH",
    "TERRARUN_LOG_LEVEL",
    "TERRARUN_LOG_FORMAT",
    "TERRARUN_NON_INTERACTIVE",
];

/// Subcommands that get `-input=false` and `-no-color` defaults injected.
pub const DEFAULT_ARG_COMMANDS: &[&str] = &["init", "plan", "apply", "destroy", "refresh", "import"];

/// Subcommands that need an initialized working directory first.
pub const INIT_REQUIRED_COMMANDS: &[&str] =
    &["plan", "apply", "destroy", "refresh", "validate", "output", "show", "state"];

/// Subcommands honoring the `-detailed-exitcode` convention.
pub const PLAN_FAMILY: &[&str] = &["plan"];

/// How long a child gets to drain after a cancellation before it is killed.
pub const CANCEL_GRACE: Duration = Duration::from_secs(10);

static RE_ENGINE_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:Terraform|OpenTofu)\s+v?(\d+\.\d+\.\d+)").unwrap());

/// `engine --version` probes, memoized per binary path for the process.
static VERSIONS: Lazy<Mutex<HashMap<PathBuf, Version>>> = Lazy::new(Default::default);

/// A located engine binary and its probed version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Engine {
    /// Path to the engine executable.
    pub path: PathBuf,
    pub version: Version,
}

impl Engine {
    /// A new instance pointing at `path`. Invokes `--version` once per path
    /// and process to determine the version.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let version = Self::version(&path)?;
        Ok(Self { path, version })
    }

    /// Locates the engine: explicit override, then [`ENGINE_PATH_ENV`], then
    /// [`DEFAULT_ENGINE`] on `PATH`.
    pub fn locate(overridden: Option<&Path>) -> Result<Self> {
        if let Some(path) = overridden {
            return Self::new(path);
        }
        if let Ok(path) = std::env::var(ENGINE_PATH_ENV) {
            return Self::new(path);
        }
        Self::new(DEFAULT_ENGINE)
    }

    /// Invokes `--version` and parses the output as a SemVer [`Version`].
    pub fn version(path: &Path) -> Result<Version> {
        if let Some(version) = VERSIONS.lock().expect("version probes poisoned").get(path) {
            return Ok(version.clone());
        }
        let mut cmd = Command::new(path);
        cmd.arg("--version").stdin(Stdio::null()).stderr(Stdio::piped()).stdout(Stdio::piped());
        debug!(?cmd, "probing engine version");
        let output = cmd.output().map_err(|err| RunError::io(err, path))?;
        if !output.status.success() {
            return Err(RunError::msg(format!(
                "{} --version exited with {}",
                path.display(),
                output.status
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = RE_ENGINE_VERSION
            .captures(&stdout)
            .and_then(|caps| Version::parse(&caps[1]).ok())
            .ok_or_else(|| {
                RunError::msg(format!("could not parse engine version from {stdout:?}"))
            })?;
        VERSIONS.lock().expect("version probes poisoned").insert(path.to_path_buf(), version.clone());
        Ok(version)
    }
}

impl AsRef<Path> for Engine {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Classification of an engine exit status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    /// Detailed exit code 2: the plan has changes and succeeded.
    SuccessWithChanges,
    Error(i32),
}

impl ExitClass {
    pub const fn is_success(&self) -> bool {
        !matches!(self, ExitClass::Error(_))
    }

    pub const fn code(&self) -> i32 {
        match self {
            ExitClass::Success => 0,
            ExitClass::SuccessWithChanges => 2,
            ExitClass::Error(code) => *code,
        }
    }
}

/// Maps a raw exit code to its class. With `detailed`, the plan-family
/// convention applies: 2 is success-with-changes, anything else non-zero is
/// an error.
pub fn classify_exit(code: i32, detailed: bool) -> ExitClass {
    match code {
        0 => ExitClass::Success,
        2 if detailed => ExitClass::SuccessWithChanges,
        other => ExitClass::Error(other),
    }
}

/// Whether the caller asked for the detailed exit code convention.
pub fn wants_detailed_exitcode(command: &str, args: &[String]) -> bool {
    PLAN_FAMILY.contains(&command)
        && args.iter().any(|a| a == "-detailed-exitcode" || a == "--detailed-exitcode")
}

/// How captured stdio is surfaced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CaptureMode {
    /// Lines stream through the reporter in near real time.
    #[default]
    Stream,
    /// Emission is deferred until after process exit and stdout is returned
    /// as raw bytes, for commands whose output must be captured atomically.
    Buffer,
}

/// A single prepared engine invocation.
pub struct Invocation<'a> {
    pub engine: &'a Engine,
    pub command: String,
    /// Arguments after the subcommand, fully built by the caller.
    pub args: Vec<String>,
    /// The child's complete environment; a private copy per child.
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    /// Attach the orchestrator's stdin. Off unless the user opted in.
    pub open_stdin: bool,
    pub detailed_exitcode: bool,
    pub capture: CaptureMode,
    pub reporter: &'a Reporter,
    /// Unit path used as the log prefix.
    pub unit: PathBuf,
    pub cancel: CancelToken,
}

/// Result of one engine invocation.
#[derive(Debug)]
pub struct EngineOutcome {
    pub class: ExitClass,
    /// Raw stdout bytes, only populated in [`CaptureMode::Buffer`].
    pub stdout: Vec<u8>,
    /// Tail of stderr, kept for failure reasons and retry classification.
    pub stderr_tail: String,
}

impl EngineOutcome {
    /// Turns an engine failure into the corresponding error, passing
    /// successful classes through.
    pub fn into_result(self, engine: &Engine, command: &str) -> Result<Self> {
        match self.class {
            ExitClass::Error(code) => Err(RunError::EngineInvocation {
                engine: engine.path.display().to_string(),
                command: command.to_string(),
                code,
            }),
            _ => Ok(self),
        }
    }
}

impl Invocation<'_> {
    /// Spawns the engine and drains its stdio on dedicated reader threads.
    ///
    /// Returns `Ok` for every exit the engine produced itself, including
    /// non-zero ones; see [`EngineOutcome::into_result`]. `Err` is reserved
    /// for spawn failures and cancellation.
    pub fn run(&self) -> Result<EngineOutcome> {
        let mut cmd = Command::new(&self.engine.path);
        cmd.arg(&self.command)
            .args(&self.args)
            .env_clear()
            .envs(&self.env)
            .current_dir(&self.cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if self.open_stdin {
            cmd.stdin(Stdio::inherit());
        } else {
            cmd.stdin(Stdio::null());
        }
        debug!(
            unit = %self.unit.display(),
            command = %self.command,
            args = %self.args.iter().join(" "),
            "spawning engine"
        );

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|err| RunError::io(err, &self.engine.path))?;

        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");

        let buffered: Arc<Mutex<Vec<(StreamKind, String)>>> = Arc::default();
        let stdout_bytes: Arc<Mutex<Vec<u8>>> = Arc::default();
        let stderr_tail: Arc<Mutex<Vec<String>>> = Arc::default();

        let stdout_handle = {
            let ctx = ReaderCtx {
                reporter: self.reporter.clone(),
                unit: self.unit.clone(),
                engine_path: self.engine.path.display().to_string(),
                command: self.command.clone(),
                capture: self.capture,
                buffered: buffered.clone(),
                tail: None,
            };
            let bytes = (self.capture == CaptureMode::Buffer).then(|| stdout_bytes.clone());
            std::thread::spawn(move || drain_stream(stdout, StreamKind::Stdout, ctx, bytes))
        };
        let stderr_handle = {
            let ctx = ReaderCtx {
                reporter: self.reporter.clone(),
                unit: self.unit.clone(),
                engine_path: self.engine.path.display().to_string(),
                command: self.command.clone(),
                capture: self.capture,
                buffered: buffered.clone(),
                tail: Some(stderr_tail.clone()),
            };
            std::thread::spawn(move || drain_stream(stderr, StreamKind::Stderr, ctx, None))
        };

        // Wait for exit, watching for cancellation. On cancel the child gets
        // the grace deadline to drain, then a hard kill.
        let status = loop {
            match child.try_wait().map_err(|err| RunError::io(err, &self.engine.path))? {
                Some(status) => break status,
                None => {
                    if self.cancel.is_cancelled() {
                        warn!(unit = %self.unit.display(), "cancellation requested, draining engine");
                        let deadline = Instant::now() + CANCEL_GRACE;
                        let status = loop {
                            if let Some(status) = child
                                .try_wait()
                                .map_err(|err| RunError::io(err, &self.engine.path))?
                            {
                                break Some(status);
                            }
                            if Instant::now() >= deadline {
                                break None;
                            }
                            std::thread::sleep(Duration::from_millis(50));
                        };
                        if status.is_none() {
                            child.kill().ok();
                            child.wait().ok();
                        }
                        let _ = stdout_handle.join();
                        let _ = stderr_handle.join();
                        return Err(RunError::Cancelled);
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
            }
        };

        let _ = stdout_handle.join();
        let _ = stderr_handle.join();

        if self.capture == CaptureMode::Buffer {
            // Deferred emission, in capture order.
            let lines = std::mem::take(&mut *buffered.lock().expect("buffer poisoned"));
            for (stream, line) in lines {
                self.reporter.engine_line(
                    &self.unit,
                    &self.engine.path.display().to_string(),
                    &self.command,
                    stream,
                    &line,
                );
            }
        }

        let code = status.code().unwrap_or(-1);
        let class = classify_exit(code, self.detailed_exitcode);
        trace!(
            unit = %self.unit.display(),
            command = %self.command,
            code,
            elapsed = ?start.elapsed(),
            "engine exited"
        );

        let stdout = std::mem::take(&mut *stdout_bytes.lock().expect("stdout buffer poisoned"));
        let tail = stderr_tail.lock().expect("stderr tail poisoned").join("\n");
        Ok(EngineOutcome { class, stdout, stderr_tail: tail })
    }

    /// Runs the invocation, retrying on transient failures with linear
    /// backoff. Non-transient failures are returned as-is.
    pub fn run_with_retry(&self, attempts: usize, base_delay: Duration) -> Result<EngineOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self.run()?;
            match outcome.class {
                ExitClass::Error(_)
                    if attempt < attempts && utils::is_transient(&outcome.stderr_tail) =>
                {
                    warn!(
                        unit = %self.unit.display(),
                        attempt,
                        "transient engine failure, retrying"
                    );
                    std::thread::sleep(base_delay * attempt as u32);
                }
                _ => return Ok(outcome),
            }
        }
    }
}

struct ReaderCtx {
    reporter: Reporter,
    unit: PathBuf,
    engine_path: String,
    command: String,
    capture: CaptureMode,
    buffered: Arc<Mutex<Vec<(StreamKind, String)>>>,
    tail: Option<Arc<Mutex<Vec<String>>>>,
}

const STDERR_TAIL_LINES: usize = 40;

fn drain_stream(
    stream: impl Read,
    kind: StreamKind,
    ctx: ReaderCtx,
    bytes: Option<Arc<Mutex<Vec<u8>>>>,
) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if let Some(bytes) = &bytes {
            let mut bytes = bytes.lock().expect("stdout buffer poisoned");
            bytes.extend_from_slice(line.as_bytes());
            bytes.push(b'\n');
        }
        if let Some(tail) = &ctx.tail {
            let mut tail = tail.lock().expect("stderr tail poisoned");
            if tail.len() == STDERR_TAIL_LINES {
                tail.remove(0);
            }
            tail.push(line.clone());
        }
        match ctx.capture {
            CaptureMode::Stream => {
                ctx.reporter.engine_line(&ctx.unit, &ctx.engine_path, &ctx.command, kind, &line);
            }
            CaptureMode::Buffer => {
                ctx.buffered.lock().expect("buffer poisoned").push((kind, line));
            }
        }
    }
}

/// Builds the child environment: the orchestrator's environment minus the
/// blocklist, then inputs as `TF_VAR_` variables, extra-arg env vars, any
/// auth provider variables and the ambient trace variables.
pub fn build_child_env(
    inputs: &crate::value::OutputMap,
    extra_env: &BTreeMap<String, String>,
    auth_env: &BTreeMap<String, String>,
    unit: &Path,
    command: &str,
    open_stdin: bool,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = std::env::vars()
        .filter(|(key, _)| !ENV_BLOCKLIST.contains(&key.as_str()))
        .collect();
    for (key, value) in inputs {
        env.insert(format!("TF_VAR_{key}"), value.to_env_string());
    }
    for (key, value) in extra_env {
        env.insert(key.clone(), value.clone());
    }
    for (key, value) in auth_env {
        env.insert(key.clone(), value.clone());
    }
    env.insert("TF_IN_AUTOMATION".to_string(), "1".to_string());
    if !open_stdin {
        env.insert("TF_INPUT".to_string(), "0".to_string());
    }
    env.insert("TERRARUN_UNIT".to_string(), unit.display().to_string());
    env.insert("TERRARUN_COMMAND".to_string(), command.to_string());
    env
}

/// Assembles the argument vector after the subcommand, in order: extra-args
/// from matching blocks, var-file flags (missing optionals suppressed),
/// caller-provided trailing args, then injected defaults unless already set.
pub fn build_args(
    config: &crate::config::UnitConfig,
    command: &str,
    trailing: &[String],
    unit_dir: &Path,
    inject_no_color: bool,
    open_stdin: bool,
) -> (Vec<String>, BTreeMap<String, String>) {
    let mut args = Vec::new();
    let mut env = BTreeMap::new();

    for extra in config.extra_args_for(command) {
        args.extend(extra.arguments.iter().cloned());
        for file in &extra.required_var_files {
            args.push(format!("-var-file={}", resolve_var_file(unit_dir, file).display()));
        }
        for file in &extra.optional_var_files {
            let resolved = resolve_var_file(unit_dir, file);
            if resolved.is_file() {
                args.push(format!("-var-file={}", resolved.display()));
            } else {
                debug!(file = %resolved.display(), "skipping missing optional var file");
            }
        }
        for (key, value) in &extra.env_vars {
            env.insert(key.clone(), value.clone());
        }
    }

    args.extend(trailing.iter().cloned());

    if DEFAULT_ARG_COMMANDS.contains(&command) {
        if !open_stdin && !args.iter().any(|a| a.starts_with("-input=")) {
            args.push("-input=false".to_string());
        }
        if inject_no_color && !args.iter().any(|a| a == "-no-color") {
            args.push("-no-color".to_string());
        }
    }

    (args, env)
}

fn resolve_var_file(unit_dir: &Path, file: &Path) -> PathBuf {
    if file.is_absolute() {
        file.to_path_buf()
    } else {
        unit_dir.join(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExtraArguments, TerraformConfig, UnitConfig};

    #[test]
    fn classifies_detailed_exit_codes() {
        assert_eq!(classify_exit(0, true), ExitClass::Success);
        assert_eq!(classify_exit(2, true), ExitClass::SuccessWithChanges);
        assert_eq!(classify_exit(2, false), ExitClass::Error(2));
        assert_eq!(classify_exit(1, true), ExitClass::Error(1));
        assert_eq!(classify_exit(3, true), ExitClass::Error(3));
    }

    #[test]
    fn detailed_exitcode_detection() {
        let args = vec!["-detailed-exitcode".to_string()];
        assert!(wants_detailed_exitcode("plan", &args));
        assert!(!wants_detailed_exitcode("apply", &args));
        assert!(!wants_detailed_exitcode("plan", &[]));
    }

    #[test]
    fn parses_version_banner() {
        let caps = RE_ENGINE_VERSION.captures("Terraform v1.6.2\non linux_amd64").unwrap();
        assert_eq!(&caps[1], "1.6.2");
        let caps = RE_ENGINE_VERSION.captures("OpenTofu v1.7.0").unwrap();
        assert_eq!(&caps[1], "1.7.0");
    }

    #[test]
    fn arg_order_and_optional_var_files() {
        let tmp = tempfile::tempdir().unwrap();
        let unit = tmp.path();
        std::fs::write(unit.join("present.tfvars"), "").unwrap();

        let config = UnitConfig {
            terraform: Some(TerraformConfig {
                extra_arguments: vec![ExtraArguments {
                    name: "common".to_string(),
                    commands: vec!["plan".to_string()],
                    arguments: vec!["-lock-timeout=20m".to_string()],
                    required_var_files: vec!["common.tfvars".into()],
                    optional_var_files: vec!["present.tfvars".into(), "missing.tfvars".into()],
                    env_vars: BTreeMap::from([("TF_LOG".to_string(), "info".to_string())]),
                }],
                ..Default::default()
            }),
            ..Default::default()
        };

        let (args, env) =
            build_args(&config, "plan", &["-target=a".to_string()], unit, true, false);
        assert_eq!(args[0], "-lock-timeout=20m");
        assert!(args[1].ends_with("common.tfvars"));
        assert!(args[2].ends_with("present.tfvars"));
        assert!(!args.iter().any(|a| a.contains("missing.tfvars")));
        assert_eq!(args[3], "-target=a");
        assert!(args.contains(&"-input=false".to_string()));
        assert!(args.contains(&"-no-color".to_string()));
        assert_eq!(env.get("TF_LOG").map(String::as_str), Some("info"));
    }

    #[test]
    fn defaults_not_injected_twice() {
        let config = UnitConfig::default();
        let trailing = vec!["-input=true".to_string(), "-no-color".to_string()];
        let (args, _) =
            build_args(&config, "apply", &trailing, Path::new("/unit"), true, false);
        assert_eq!(args.iter().filter(|a| a.starts_with("-input=")).count(), 1);
        assert_eq!(args.iter().filter(|a| *a == "-no-color").count(), 1);
    }

    #[test]
    fn child_env_carries_inputs_and_trace_vars() {
        let mut inputs = crate::value::OutputMap::new();
        inputs.insert("region".to_string(), crate::value::Value::String("eu-west-1".into()));
        let env = build_child_env(
            &inputs,
            &BTreeMap::new(),
            &BTreeMap::new(),
            Path::new("/ws/app"),
            "plan",
            false,
        );
        assert_eq!(env.get("TF_VAR_region").map(String::as_str), Some("eu-west-1"));
        assert_eq!(env.get("TF_IN_AUTOMATION").map(String::as_str), Some("1"));
        assert_eq!(env.get("TF_INPUT").map(String::as_str), Some("0"));
        assert_eq!(env.get("TERRARUN_COMMAND").map(String::as_str), Some("plan"));
    }
}
