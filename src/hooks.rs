//! Before / after / error hooks
//!
//! Hooks from parent and child configs merge by name, child overriding, and
//! run in declaration order, stable across includes. `error` hooks fire only
//! when the engine invocation failed; `after` hooks honor `run_on_error`.
//! When the engine already failed, a failing or missing hook is reported but
//! never masks the original failure.

use crate::{
    config::{Hook, HookKind},
    error::{Result, RunError},
    report::{Reporter, StreamKind},
};
use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::Path,
    process::Command,
};

/// Everything a hook needs to run.
pub struct HookContext<'a> {
    pub command: &'a str,
    pub unit: &'a Path,
    pub work_dir: &'a Path,
    /// The child env, a private copy per hook process.
    pub env: &'a BTreeMap<String, String>,
    pub reporter: &'a Reporter,
}

/// Merges hook lists across an include: child hooks override parents with
/// the same name in place, new child hooks append in their own order.
pub fn merge_hooks(parent: &[Hook], child: &[Hook]) -> Vec<Hook> {
    let mut merged: Vec<Hook> = parent.to_vec();
    for hook in child {
        if let Some(slot) = merged.iter_mut().find(|h| h.name == hook.name) {
            *slot = hook.clone();
        } else {
            merged.push(hook.clone());
        }
    }
    merged
}

/// Runs all hooks of `kind` that apply to the active command.
pub fn run_hooks(
    kind: HookKind,
    hooks: &[Hook],
    ctx: &HookContext<'_>,
    engine_failed: bool,
) -> Result<()> {
    // Once the engine failed, hook problems are reported, not propagated.
    let report_only = engine_failed && matches!(kind, HookKind::Error | HookKind::After);

    for hook in hooks {
        if !hook.applies_to(ctx.command) {
            continue;
        }
        match kind {
            HookKind::Error if !engine_failed => continue,
            HookKind::After if engine_failed && !hook.run_on_error => continue,
            _ => {}
        }

        trace!(unit = %ctx.unit.display(), hook = %hook.name, kind = kind.as_str(), "running hook");
        match run_hook(hook, ctx) {
            Ok(()) => {}
            Err(err) if report_only => {
                ctx.reporter.error(
                    Some(ctx.unit),
                    format!("{} {:?}: {err}", kind.as_str(), hook.name),
                );
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn run_hook(hook: &Hook, ctx: &HookContext<'_>) -> Result<()> {
    let (program, args) = hook
        .execute
        .split_first()
        .ok_or_else(|| RunError::msg(format!("hook {:?} has an empty execute list", hook.name)))?;

    let work_dir = hook.working_dir.as_deref().unwrap_or(ctx.work_dir);
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(work_dir).env_clear().envs(ctx.env);

    let output = cmd.output().map_err(|err| match err.kind() {
        ErrorKind::NotFound => {
            RunError::msg(format!("hook {:?}: executable {program:?} not found", hook.name))
        }
        _ => RunError::io(err, program),
    })?;

    if !hook.suppress_stdout {
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            ctx.reporter.engine_line(ctx.unit, program, ctx.command, StreamKind::Stdout, line);
        }
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        ctx.reporter.engine_line(ctx.unit, program, ctx.command, StreamKind::Stderr, line);
    }

    if !output.status.success() {
        return Err(RunError::msg(format!(
            "hook {:?} exited with {}",
            hook.name,
            output.status.code().unwrap_or(-1)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ReporterOptions;

    fn hook(name: &str, commands: &[&str], execute: &[&str]) -> Hook {
        Hook {
            name: name.to_string(),
            commands: commands.iter().map(|s| s.to_string()).collect(),
            execute: execute.iter().map(|s| s.to_string()).collect(),
            working_dir: None,
            run_on_error: false,
            suppress_stdout: false,
            condition: None,
        }
    }

    fn ctx<'a>(
        work_dir: &'a Path,
        env: &'a BTreeMap<String, String>,
        reporter: &'a Reporter,
    ) -> HookContext<'a> {
        HookContext { command: "apply", unit: work_dir, work_dir, env, reporter }
    }

    fn reporter() -> Reporter {
        Reporter::with_sink(ReporterOptions::default(), Box::new(std::io::sink()))
    }

    /// Hook processes get a private env copy; tests keep PATH so the shell
    /// utilities resolve.
    fn env() -> BTreeMap<String, String> {
        BTreeMap::from([("PATH".to_string(), std::env::var("PATH").unwrap_or_default())])
    }

    #[test]
    fn merge_overrides_by_name_keeps_order() {
        let parent = vec![hook("fmt", &["plan"], &["true"]), hook("lint", &["plan"], &["true"])];
        let child = vec![hook("lint", &["apply"], &["false"]), hook("extra", &["plan"], &["true"])];
        let merged = merge_hooks(&parent, &child);
        let names: Vec<_> = merged.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, ["fmt", "lint", "extra"]);
        assert_eq!(merged[1].commands, ["apply"]);
    }

    #[test]
    #[cfg(unix)]
    fn before_hook_failure_propagates() {
        let tmp = tempfile::tempdir().unwrap();
        let env = env();
        let rep = reporter();
        let hooks = vec![hook("boom", &["apply"], &["false"])];
        let err = run_hooks(HookKind::Before, &hooks, &ctx(tmp.path(), &env, &rep), false)
            .unwrap_err();
        assert!(err.to_string().contains("boom"), "{err}");
    }

    #[test]
    fn missing_executable_does_not_mask_engine_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let env = env();
        let rep = reporter();
        let hooks = vec![hook("cleanup", &["apply"], &["terrarun-no-such-binary"])];
        run_hooks(HookKind::Error, &hooks, &ctx(tmp.path(), &env, &rep), true).unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn after_hook_skipped_on_error_without_run_on_error() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("ran");
        let env = env();
        let rep = reporter();
        let script = format!("touch {}", marker.display());
        let mut skipped = hook("after", &["apply"], &["sh", "-c", &script]);
        skipped.run_on_error = false;
        run_hooks(HookKind::After, &[skipped.clone()], &ctx(tmp.path(), &env, &rep), true).unwrap();
        assert!(!marker.exists());

        skipped.run_on_error = true;
        run_hooks(HookKind::After, &[skipped], &ctx(tmp.path(), &env, &rep), true).unwrap();
        assert!(marker.exists());
    }

    #[test]
    #[cfg(unix)]
    fn condition_false_disables_hook() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("ran");
        let env = env();
        let rep = reporter();
        let script = format!("touch {}", marker.display());
        let mut conditional = hook("gated", &["apply"], &["sh", "-c", &script]);
        conditional.condition = Some(false);
        run_hooks(HookKind::Before, &[conditional], &ctx(tmp.path(), &env, &rep), false).unwrap();
        assert!(!marker.exists());
    }
}
