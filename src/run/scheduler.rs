//! Concurrent DAG walk
//!
//! A single coordinator drains completion messages from a pool of workers.
//! A unit becomes ready when all its inbound producers completed successfully
//! or are excluded; ready units run on a rayon pool sized by the run's
//! parallelism, so at most that many engine processes are alive at once. For
//! destructive commands the edge direction flips, destroying dependents
//! before their producers.

use super::{summary::UnitReport, RunOptions, RunSummary, UnitRunner};
use crate::{
    error::{Result, RunError},
    resolver::Graph,
    unit::UnitState,
    Orchestrator,
};
use std::{
    collections::VecDeque,
    sync::mpsc,
    time::{Duration, Instant},
};

struct Completion {
    index: usize,
    result: Result<crate::engine::ExitClass>,
    duration: Duration,
}

/// Walks `graph` with the configured parallelism and returns the summary.
pub(crate) fn execute_graph(
    graph: &mut Graph,
    orch: &Orchestrator,
    opts: &RunOptions,
) -> Result<RunSummary> {
    let started = Instant::now();
    let reversed = opts.is_destructive();
    let n = graph.len();

    // Layer index per node, a scheduling priority hint only; correctness
    // comes from the per-edge accounting below.
    let mut layer_of = vec![0usize; n];
    for (layer, nodes) in graph.layers(reversed).into_iter().enumerate() {
        for node in nodes {
            layer_of[node] = layer;
        }
    }

    fn upstream(graph: &Graph, reversed: bool, i: usize) -> &[usize] {
        if reversed {
            graph.edges().dependents_of(i)
        } else {
            graph.edges().deps_of(i)
        }
    }
    let downstream_of = {
        // owned copy so the coordinator can mutate the graph while walking
        let mut downstream = vec![Vec::new(); n];
        for i in 0..n {
            for &u in upstream(graph, reversed, i) {
                downstream[u].push(i);
            }
        }
        downstream
    };
    let mut pending_upstream: Vec<usize> =
        (0..n).map(|i| upstream(graph, reversed, i).len()).collect();
    // consumers in the forward orientation, for output publishing
    let has_consumers: Vec<bool> =
        (0..n).map(|i| !graph.edges().dependents_of(i).is_empty()).collect();

    let mut summary = RunSummary::default();
    let mut ready: Vec<usize> = Vec::new();

    // Excluded units are satisfied edges from the start.
    let mut initial_satisfied: VecDeque<usize> = VecDeque::new();
    for i in 0..n {
        if graph.node(i).state() == UnitState::Excluded {
            initial_satisfied.push_back(i);
            summary.record(UnitReport {
                path: graph.rel_path(i),
                state: UnitState::Excluded,
                reason: None,
                duration: Duration::ZERO,
                exit: None,
            });
        } else if pending_upstream[i] == 0 {
            ready.push(i);
        }
    }
    while let Some(i) = initial_satisfied.pop_front() {
        for &d in &downstream_of[i] {
            pending_upstream[d] -= 1;
            if pending_upstream[d] == 0 && graph.node(d).state() == UnitState::Pending {
                ready.push(d);
            }
        }
    }
    ready.sort_by_key(|&i| (layer_of[i], i));
    ready.dedup();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.parallelism)
        .thread_name(|i| format!("terrarun-worker-{i}"))
        .build()
        .map_err(|err| RunError::Internal(format!("could not build worker pool: {err}")))?;
    let (tx, rx) = mpsc::channel::<Completion>();

    let mut fatal: Option<RunError> = None;
    pool.scope(|scope| {
        // channel endpoints are not Sync, the scope closure owns them
        let tx = tx;
        let rx = rx;
        let mut active = 0usize;

        let mut spawn = |i: usize, graph: &mut Graph, active: &mut usize| {
            graph.node_mut(i).set_state(UnitState::Running);
            *active += 1;
            let tx = tx.clone();
            let path = graph.node(i).path().to_path_buf();
            let publish = has_consumers[i];
            scope.spawn(move |_| {
                let begun = Instant::now();
                let runner = UnitRunner::new(orch, opts);
                let result = runner.execute(&path, publish);
                let _ = tx.send(Completion { index: i, result, duration: begun.elapsed() });
            });
        };

        for i in std::mem::take(&mut ready) {
            if orch.cancel.is_cancelled() {
                break;
            }
            spawn(i, graph, &mut active);
        }

        while active > 0 {
            let Ok(completion) = rx.recv() else { break };
            active -= 1;
            let index = completion.index;

            match completion.result {
                Ok(exit) => {
                    graph.node_mut(index).set_exit(exit);
                    graph.node_mut(index).set_state(UnitState::Succeeded);
                    summary.record(UnitReport {
                        path: graph.rel_path(index),
                        state: UnitState::Succeeded,
                        reason: None,
                        duration: completion.duration,
                        exit: Some(exit),
                    });

                    for &d in &downstream_of[index] {
                        pending_upstream[d] -= 1;
                        if pending_upstream[d] == 0
                            && graph.node(d).state() == UnitState::Pending
                            && !orch.cancel.is_cancelled()
                        {
                            spawn(d, graph, &mut active);
                        }
                    }
                }
                Err(err) => {
                    graph.node_mut(index).set_state(UnitState::Failed);
                    summary.record(UnitReport {
                        path: graph.rel_path(index),
                        state: UnitState::Failed,
                        reason: Some(format!("{} ({})", err, err.kind())),
                        duration: completion.duration,
                        exit: None,
                    });
                    orch.reporter.error(
                        Some(graph.node(index).path()),
                        format!("unit failed: {err}"),
                    );
                    if err.is_fatal() && fatal.is_none() {
                        fatal = Some(err);
                    }

                    if opts.ignore_dependency_errors {
                        // Consumers proceed, resolving from mocks or
                        // NotApplied.
                        for &d in &downstream_of[index] {
                            pending_upstream[d] -= 1;
                            if pending_upstream[d] == 0
                                && graph.node(d).state() == UnitState::Pending
                                && !orch.cancel.is_cancelled()
                            {
                                spawn(d, graph, &mut active);
                            }
                        }
                    } else {
                        // Transitive consumers are skipped; siblings go on.
                        let failed_rel = graph.rel_path(index);
                        let mut cascade: VecDeque<usize> = downstream_of[index].iter().copied().collect();
                        while let Some(d) = cascade.pop_front() {
                            if graph.node(d).state() != UnitState::Pending {
                                continue;
                            }
                            graph.node_mut(d).set_state(UnitState::FailedUpstream);
                            summary.record(UnitReport {
                                path: graph.rel_path(d),
                                state: UnitState::FailedUpstream,
                                reason: Some(format!(
                                    "dependency {} failed",
                                    failed_rel.display()
                                )),
                                duration: Duration::ZERO,
                                exit: None,
                            });
                            cascade.extend(downstream_of[d].iter().copied());
                        }
                    }
                }
            }
        }
    });

    // Whatever is still pending was cut off by cancellation.
    if orch.cancel.is_cancelled() {
        for i in 0..n {
            if graph.node(i).state() == UnitState::Pending {
                summary.record(UnitReport {
                    path: graph.rel_path(i),
                    state: UnitState::Pending,
                    reason: Some("cancelled".to_string()),
                    duration: Duration::ZERO,
                    exit: None,
                });
            }
        }
        summary.set_cancelled();
        orch.reporter.warn(None, "run cancelled");
    }

    if let Some(err) = fatal {
        return Err(err);
    }

    summary.duration = started.elapsed();
    Ok(summary)
}
