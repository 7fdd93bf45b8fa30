//! End-to-end scenarios driving a fake engine binary through full runs.
#![cfg(unix)]

use pretty_assertions::assert_eq;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use terrarun::{
    workdir, CancelToken, ExternalPolicy, GraphOptions, Orchestrator, Reporter, ReporterOptions,
    RunError, RunOptions, UnitState,
};

const CONFIG: &str = "terrarun.hcl";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();
}

/// A shell stand-in for the engine. Every invocation appends one line per
/// event to `$TR_TEST_LOG`; O_APPEND makes the line order the event order.
const FAKE_ENGINE: &str = r##"#!/bin/sh
log() {
  if [ -n "$TR_TEST_LOG" ]; then
    echo "$1 $2 $(basename "$TERRARUN_UNIT")" >> "$TR_TEST_LOG"
  fi
}
cmd="$1"
shift
case "$cmd" in
  --version|version)
    echo "Terraform v1.6.0"
    ;;
  init)
    mkdir -p .terraform
    ;;
  plan)
    log start plan
    [ -n "$TR_TEST_SLEEP" ] && sleep "$TR_TEST_SLEEP"
    log end plan
    if [ -f changes.marker ]; then
      for a in "$@"; do
        [ "$a" = "-detailed-exitcode" ] && exit 2
      done
    fi
    ;;
  apply)
    log start apply
    if [ -n "$TF_VAR_truth" ]; then
      printf '%s' "$TF_VAR_truth" > applied-truth.txt
    fi
    unit="$(basename "$TERRARUN_UNIT")"
    echo "{\"unit\": {\"sensitive\": false, \"type\": \"string\", \"value\": \"$unit\"}}" > outputs.json
    log end apply
    ;;
  destroy)
    log start destroy
    sleep 0.1
    log end destroy
    ;;
  output)
    if [ -f outputs.json ]; then
      cat outputs.json
    else
      echo '{}'
    fi
    ;;
  show)
    echo '{"format_version": "1.0"}'
    ;;
esac
exit 0
"##;

struct TestWorkspace {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    engine: PathBuf,
    log: PathBuf,
}

impl TestWorkspace {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("ws");
        fs::create_dir_all(&root).unwrap();

        let engine = tmp.path().join("bin/fake-tf");
        fs::create_dir_all(engine.parent().unwrap()).unwrap();
        fs::write(&engine, FAKE_ENGINE).unwrap();
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&engine, fs::Permissions::from_mode(0o755)).unwrap();

        let log = tmp.path().join("events.log");
        Self { _tmp: tmp, root, engine, log }
    }

    fn add_unit(&self, name: &str, config: &str) -> PathBuf {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(CONFIG), config).unwrap();
        dir
    }

    fn orchestrator(&self, workspace: &Path, sleep: Option<&str>) -> Orchestrator {
        let mut env = BTreeMap::new();
        env.insert("TR_TEST_LOG".to_string(), self.log.display().to_string());
        if let Some(sleep) = sleep {
            env.insert("TR_TEST_SLEEP".to_string(), sleep.to_string());
        }
        Orchestrator::builder()
            .workspace(workspace)
            .engine_path(&self.engine)
            .reporter(Reporter::with_sink(ReporterOptions::default(), Box::new(std::io::sink())))
            .graph_opts(GraphOptions {
                external: ExternalPolicy::Exclude,
                non_interactive: true,
                ..Default::default()
            })
            .auth_env(env)
            .cancel(CancelToken::new())
            .build()
            .unwrap()
    }

    fn events(&self) -> Vec<(String, String, String)> {
        fs::read_to_string(&self.log)
            .unwrap_or_default()
            .lines()
            .map(|line| {
                let mut parts = line.split_whitespace().map(str::to_string);
                (
                    parts.next().unwrap_or_default(),
                    parts.next().unwrap_or_default(),
                    parts.next().unwrap_or_default(),
                )
            })
            .collect()
    }

    fn position(&self, events: &[(String, String, String)], edge: &str, command: &str, unit: &str) -> usize {
        events
            .iter()
            .position(|(e, c, u)| e == edge && c == command && u == unit)
            .unwrap_or_else(|| panic!("no `{edge} {command} {unit}` event in {events:?}"))
    }
}

fn dep(label: &str, on: &str) -> String {
    format!("dependency \"{label}\" {{\n  config_path = \"../{on}\"\n}}\n")
}

#[test]
fn cycle_is_rejected_before_any_engine_invocation() {
    let ws = TestWorkspace::new();
    ws.add_unit("a", &dep("b", "b"));
    ws.add_unit("b", &dep("a", "a"));

    let orch = ws.orchestrator(&ws.root, None);
    let err = orch.run_all(&RunOptions::new("plan")).unwrap_err();
    match err {
        RunError::Cycle(cycle) => assert!(cycle.len() >= 3, "{cycle:?}"),
        other => panic!("expected cycle error, got {other}"),
    }
    assert!(ws.events().is_empty(), "the engine must never run on a cyclic graph");
}

#[test]
fn detailed_exitcode_aggregates_changes() {
    let ws = TestWorkspace::new();
    ws.add_unit("app1", "");
    let app2 = ws.add_unit("app2", "");
    fs::write(app2.join("changes.marker"), "").unwrap();

    let orch = ws.orchestrator(&ws.root, None);
    let opts = RunOptions::new("plan").args(["-detailed-exitcode".to_string()]);
    let summary = orch.run_all(&opts).unwrap();

    assert!(!summary.errored());
    assert!(summary.has_changes());
    assert_eq!(summary.exit_code(), 2);
    assert_eq!(summary.reports.len(), 2);
    assert!(summary.reports.iter().all(|r| r.state == UnitState::Succeeded));
}

#[test]
fn mock_outputs_substitute_for_unapplied_dependency() {
    let ws = TestWorkspace::new();
    ws.add_unit("parent", "");
    let child = ws.add_unit(
        "child",
        r#"
dependency "parent" {
  config_path = "../parent"
  mock_outputs = {
    truth = "The answer is 0"
  }
  mock_outputs_allowed_commands = ["apply"]
}

inputs = {
  truth = dependency.parent.outputs.truth
}
"#,
    );

    let orch = ws.orchestrator(&child, None);
    let summary = orch.run(&RunOptions::new("apply")).unwrap();
    assert_eq!(summary.exit_code(), 0, "{:?}", summary.reports);

    let child = fs::canonicalize(&child).unwrap();
    let scratch = workdir::scratch_dir(&child);
    let truth = fs::read_to_string(scratch.join("applied-truth.txt")).unwrap();
    assert_eq!(truth, "The answer is 0");
}

#[test]
fn duplicate_generate_labels_abort_the_run() {
    let ws = TestWorkspace::new();
    fs::write(
        ws.root.join("root.hcl"),
        "generate \"backend\" {\n  path     = \"backend.tf\"\n  contents = \"\"\n}\n",
    )
    .unwrap();
    ws.add_unit(
        "app",
        r#"
include "root" {
  path = find_in_parent_folders("root.hcl")
}

generate "backend" {
  path     = "backend.tf"
  contents = ""
}
"#,
    );

    let orch = ws.orchestrator(&ws.root, None);
    let err = orch.run_all(&RunOptions::new("plan")).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("duplicate generate block"), "{message}");
    assert!(message.contains("backend"), "{message}");
}

#[test]
fn parallelism_bounds_concurrent_engines() {
    let ws = TestWorkspace::new();
    for i in 0..6 {
        ws.add_unit(&format!("unit{i}"), "");
    }

    let orch = ws.orchestrator(&ws.root, Some("0.2"));
    let opts = RunOptions::new("plan").parallelism(2);
    let summary = orch.run_all(&opts).unwrap();
    assert_eq!(summary.exit_code(), 0, "{:?}", summary.reports);

    let mut alive = 0usize;
    let mut peak = 0usize;
    for (edge, command, _) in ws.events() {
        if command != "plan" {
            continue;
        }
        match edge.as_str() {
            "start" => {
                alive += 1;
                peak = peak.max(alive);
            }
            "end" => alive -= 1,
            _ => {}
        }
    }
    assert!(peak <= 2, "at most 2 engines may be alive, saw {peak}");
    assert!(peak > 1, "independent units should actually run concurrently");
}

#[test]
fn apply_respects_dependency_order() {
    let ws = TestWorkspace::new();
    ws.add_unit("vpc", "");
    ws.add_unit("mysql", &dep("vpc", "vpc"));
    ws.add_unit("app", &dep("mysql", "mysql"));

    let orch = ws.orchestrator(&ws.root, None);
    let summary = orch.run_all(&RunOptions::new("apply")).unwrap();
    assert_eq!(summary.exit_code(), 0, "{:?}", summary.reports);

    let events = ws.events();
    let vpc_end = ws.position(&events, "end", "apply", "vpc");
    let mysql_start = ws.position(&events, "start", "apply", "mysql");
    let mysql_end = ws.position(&events, "end", "apply", "mysql");
    let app_start = ws.position(&events, "start", "apply", "app");
    assert!(vpc_end < mysql_start, "{events:?}");
    assert!(mysql_end < app_start, "{events:?}");
}

#[test]
fn destroy_walks_the_graph_in_reverse() {
    let ws = TestWorkspace::new();
    ws.add_unit("vpc", "");
    ws.add_unit("mysql", &dep("vpc", "vpc"));
    ws.add_unit("app", &dep("mysql", "mysql"));

    let orch = ws.orchestrator(&ws.root, None);
    let summary = orch.run_all(&RunOptions::new("destroy")).unwrap();
    assert_eq!(summary.exit_code(), 0, "{:?}", summary.reports);

    let events = ws.events();
    let app_end = ws.position(&events, "end", "destroy", "app");
    let mysql_start = ws.position(&events, "start", "destroy", "mysql");
    let mysql_end = ws.position(&events, "end", "destroy", "mysql");
    let vpc_start = ws.position(&events, "start", "destroy", "vpc");
    assert!(app_end < mysql_start, "{events:?}");
    assert!(mysql_end < vpc_start, "{events:?}");
}

#[test]
fn failed_unit_cascades_to_consumers_and_spares_siblings() {
    init_tracing();
    let ws = TestWorkspace::new();
    // a unit whose before hook fails
    ws.add_unit(
        "broken",
        r#"
before_hook "boom" {
  commands = ["apply"]
  execute  = ["false"]
}
"#,
    );
    ws.add_unit("consumer", &dep("broken", "broken"));
    ws.add_unit("bystander", "");

    let orch = ws.orchestrator(&ws.root, None);
    let summary = orch.run_all(&RunOptions::new("apply")).unwrap();
    assert_eq!(summary.exit_code(), 1);

    let state_of = |name: &str| {
        summary
            .reports
            .iter()
            .find(|r| r.path == Path::new(name))
            .unwrap_or_else(|| panic!("no report for {name}: {:?}", summary.reports))
            .state
    };
    assert_eq!(state_of("broken"), UnitState::Failed);
    assert_eq!(state_of("consumer"), UnitState::FailedUpstream);
    assert_eq!(state_of("bystander"), UnitState::Succeeded);
}

#[test]
fn skipped_units_leave_an_excluded_only_run_at_zero() {
    let ws = TestWorkspace::new();
    ws.add_unit("only", "skip = true\n");

    let orch = ws.orchestrator(&ws.root, None);
    let summary = orch.run_all(&RunOptions::new("plan")).unwrap();
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.reports.len(), 1);
    assert_eq!(summary.reports[0].state, UnitState::Excluded);
    assert!(ws.events().is_empty());
}

#[test]
fn plan_artifacts_land_in_the_out_dir() {
    let ws = TestWorkspace::new();
    ws.add_unit("app", "");
    let out_dir = ws.root.join("plans");

    let mut env = BTreeMap::new();
    env.insert("TR_TEST_LOG".to_string(), ws.log.display().to_string());
    let orch = Orchestrator::builder()
        .workspace(&ws.root)
        .engine_path(&ws.engine)
        .reporter(Reporter::with_sink(ReporterOptions::default(), Box::new(std::io::sink())))
        .graph_opts(GraphOptions { non_interactive: true, ..Default::default() })
        .out_dir(Some(out_dir.clone()))
        .auth_env(env)
        .build()
        .unwrap();

    let summary = orch.run_all(&RunOptions::new("plan")).unwrap();
    assert_eq!(summary.exit_code(), 0, "{:?}", summary.reports);
    // the engine was pointed at the stable artifact path
    assert!(out_dir.join("app").is_dir(), "artifact directory must exist");
}
