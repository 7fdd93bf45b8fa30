//! Resolution of the unit dependency graph
//!
//! Discovery walks the workspace for config files, resolves every unit's
//! config in shallow mode (mocks substitute for real outputs, no engine is
//! ever invoked) and turns `dependency` blocks into directed edges from
//! consumer to producer. Paths outside the workspace are *external* and
//! handled per [`ExternalPolicy`]. The graph must be acyclic; a cycle is a
//! hard error reported with the full path sequence.

use crate::{
    config::{dependency_dir, resolve_config, EvalSettings},
    error::{Result, RunError},
    unit::{Unit, UnitState},
    utils,
};
use std::{
    collections::{HashMap, VecDeque},
    io::{BufRead, Write},
    path::{Path, PathBuf},
};

/// How dependency paths outside the workspace are treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExternalPolicy {
    /// Treat external units as first-class nodes and schedule them.
    Include,
    /// Keep the edges for ordering but mark the external nodes excluded;
    /// their outputs must come from on-disk state or mocks.
    Exclude,
    /// Ask once per external path. Non-interactive runs require an explicit
    /// choice instead.
    #[default]
    Prompt,
}

/// Options governing graph construction.
#[derive(Clone, Debug, Default)]
pub struct GraphOptions {
    pub external: ExternalPolicy,
    /// File listing additional units to exclude, one path glob per line.
    pub excludes_file: Option<PathBuf>,
    pub non_interactive: bool,
}

/// Edge sets of the resolved graph, index-based like the node arena.
#[derive(Clone, Debug, Default)]
pub struct GraphEdges {
    /// For every unit, the units it depends on.
    deps: Vec<Vec<usize>>,
    /// For every unit, the units that depend on it.
    dependents: Vec<Vec<usize>>,
}

impl GraphEdges {
    pub fn deps_of(&self, unit: usize) -> &[usize] {
        &self.deps[unit]
    }

    pub fn dependents_of(&self, unit: usize) -> &[usize] {
        &self.dependents[unit]
    }
}

/// The dependency DAG of discovered units.
#[derive(Debug)]
pub struct Graph {
    nodes: Vec<Unit>,
    edges: GraphEdges,
    indices: HashMap<PathBuf, usize>,
    workspace: PathBuf,
}

impl Graph {
    /// Discovers all units under `workspace` and resolves the DAG.
    pub fn discover(
        workspace: &Path,
        settings: &EvalSettings<'_>,
        opts: &GraphOptions,
    ) -> Result<Self> {
        let unit_dirs = utils::discover_unit_dirs(workspace, settings.config_filename)?;
        Self::resolve_units(workspace, unit_dirs, settings, opts)
    }

    /// Builds a graph from an explicit set of unit directories, typically a
    /// single one.
    pub fn resolve_units(
        workspace: &Path,
        unit_dirs: Vec<PathBuf>,
        settings: &EvalSettings<'_>,
        opts: &GraphOptions,
    ) -> Result<Self> {
        let workspace = utils::canonicalized(workspace);
        let excludes = load_excludes(opts.excludes_file.as_deref())?;

        let mut nodes: Vec<Unit> = Vec::new();
        let mut indices: HashMap<PathBuf, usize> = HashMap::new();
        let mut queue: VecDeque<PathBuf> = unit_dirs.into_iter().collect();

        // First pass: materialize nodes, following external edges as they
        // surface. Shallow resolution never invokes the engine.
        while let Some(dir) = queue.pop_front() {
            if indices.contains_key(&dir) {
                continue;
            }
            let external = !dir.starts_with(&workspace);
            let config = resolve_config(&dir, settings)?;
            let dep_dirs: Vec<PathBuf> =
                config.dependencies.values().map(|dep| dependency_dir(&dir, dep)).collect();

            let mut unit =
                if external { Unit::external(dir.clone(), config) } else { Unit::new(dir.clone(), config) };
            if unit.config().skip {
                debug!(unit = %dir.display(), "unit sets skip = true");
                unit.set_state(UnitState::Excluded);
            } else if !external && matches_excludes(&workspace, &dir, &excludes) {
                debug!(unit = %dir.display(), "unit matches an exclude pattern");
                unit.set_state(UnitState::Excluded);
            }
            let index = nodes.len();
            nodes.push(unit);
            indices.insert(dir.clone(), index);

            for dep_dir in dep_dirs {
                if indices.contains_key(&dep_dir) || queue.contains(&dep_dir) {
                    continue;
                }
                if !dep_dir.join(settings.config_filename).is_file() {
                    return Err(RunError::MissingDependencyDir {
                        consumer: dir.clone(),
                        missing: dep_dir,
                    });
                }
                if dep_dir.starts_with(&workspace) {
                    queue.push_back(dep_dir);
                } else {
                    match external_decision(&dep_dir, opts)? {
                        ExternalPolicy::Include => queue.push_back(dep_dir),
                        _ => {
                            let config = resolve_config(&dep_dir, settings)?;
                            let mut unit = Unit::external(dep_dir.clone(), config);
                            unit.set_state(UnitState::Excluded);
                            let index = nodes.len();
                            nodes.push(unit);
                            indices.insert(dep_dir, index);
                        }
                    }
                }
            }
        }

        // Deterministic indices: sort by path and rebuild the arena.
        let mut order: Vec<usize> = (0..nodes.len()).collect();
        order.sort_by(|&a, &b| nodes[a].path().cmp(nodes[b].path()));
        let mut sorted_nodes = Vec::with_capacity(nodes.len());
        indices.clear();
        for &old_index in &order {
            let unit = nodes[old_index].clone();
            indices.insert(unit.path().to_path_buf(), sorted_nodes.len());
            sorted_nodes.push(unit);
        }
        let nodes = sorted_nodes;

        // Second pass: edges. Excluded externals never run, and their own
        // producers were not discovered, so they contribute no edges.
        let mut edges = GraphEdges {
            deps: vec![Vec::new(); nodes.len()],
            dependents: vec![Vec::new(); nodes.len()],
        };
        for (index, unit) in nodes.iter().enumerate() {
            if unit.is_external() && unit.state() == UnitState::Excluded {
                continue;
            }
            for dep in unit.config().dependencies.values() {
                let dep_dir = dependency_dir(unit.path(), dep);
                let dep_index = *indices.get(&dep_dir).ok_or_else(|| {
                    RunError::MissingDependencyDir {
                        consumer: unit.path().to_path_buf(),
                        missing: dep_dir.clone(),
                    }
                })?;
                edges.deps[index].push(dep_index);
                edges.dependents[dep_index].push(index);
            }
        }
        for list in edges.deps.iter_mut().chain(edges.dependents.iter_mut()) {
            list.sort_unstable();
            list.dedup();
        }

        let graph = Self { nodes, edges, indices, workspace };
        graph.ensure_acyclic()?;
        Ok(graph)
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &Unit {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut Unit {
        &mut self.nodes[index]
    }

    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.nodes.iter()
    }

    pub fn index_of(&self, path: &Path) -> Option<usize> {
        self.indices.get(path).copied()
    }

    pub fn edges(&self) -> &GraphEdges {
        &self.edges
    }

    /// Unit path relative to the workspace, for display.
    pub fn rel_path(&self, index: usize) -> PathBuf {
        utils::rebase_path(&self.workspace, self.nodes[index].path())
    }

    /// Rejects cyclic graphs with a deterministic error listing the cycle in
    /// the order encountered.
    pub fn ensure_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            Unseen,
            Open,
            Closed,
        }

        let mut colors = vec![Color::Unseen; self.nodes.len()];
        let mut stack: Vec<usize> = Vec::new();

        // Iterative DFS; frames carry the next dep position to visit.
        for start in 0..self.nodes.len() {
            if colors[start] != Color::Unseen {
                continue;
            }
            let mut frames: Vec<(usize, usize)> = vec![(start, 0)];
            colors[start] = Color::Open;
            stack.push(start);

            while let Some(frame) = frames.last_mut() {
                let node = frame.0;
                let pos = frame.1;
                frame.1 += 1;
                if let Some(&dep) = self.edges.deps[node].get(pos) {
                    match colors[dep] {
                        Color::Unseen => {
                            colors[dep] = Color::Open;
                            stack.push(dep);
                            frames.push((dep, 0));
                        }
                        Color::Open => {
                            let from = stack.iter().position(|&n| n == dep).unwrap_or(0);
                            let mut cycle: Vec<PathBuf> =
                                stack[from..].iter().map(|&n| self.rel_path(n)).collect();
                            cycle.push(self.rel_path(dep));
                            return Err(RunError::Cycle(cycle));
                        }
                        Color::Closed => {}
                    }
                } else {
                    colors[node] = Color::Closed;
                    stack.pop();
                    frames.pop();
                }
            }
        }
        Ok(())
    }

    /// Topological level sets via Kahn's algorithm. The scheduler uses layers
    /// only as a priority hint; true ordering is enforced per edge at runtime.
    ///
    /// With `reversed` the edge direction flips, so that for destructive
    /// commands dependents sort before their producers.
    pub fn layers(&self, reversed: bool) -> Vec<Vec<usize>> {
        let upstream = |n: usize| {
            if reversed {
                self.edges.dependents_of(n)
            } else {
                self.edges.deps_of(n)
            }
        };
        let downstream = |n: usize| {
            if reversed {
                self.edges.deps_of(n)
            } else {
                self.edges.dependents_of(n)
            }
        };

        let mut indegree: Vec<usize> = (0..self.len()).map(|n| upstream(n).len()).collect();
        let mut current: Vec<usize> =
            (0..self.len()).filter(|&n| indegree[n] == 0).collect();
        let mut layers = Vec::new();
        while !current.is_empty() {
            current.sort_unstable();
            let mut next = Vec::new();
            for &n in &current {
                for &d in downstream(n) {
                    indegree[d] -= 1;
                    if indegree[d] == 0 {
                        next.push(d);
                    }
                }
            }
            layers.push(std::mem::take(&mut current));
            current = next;
        }
        layers
    }

    /// The graph in graphviz dot notation, edges pointing at dependencies.
    pub fn dot(&self) -> String {
        let mut out = String::from("digraph {\n");
        for index in 0..self.len() {
            let from = self.rel_path(index);
            out.push_str(&format!("  \"{}\" ;\n", from.display()));
            for &dep in self.edges.deps_of(index) {
                out.push_str(&format!(
                    "  \"{}\" -> \"{}\" ;\n",
                    from.display(),
                    self.rel_path(dep).display()
                ));
            }
        }
        out.push_str("}\n");
        out
    }
}

fn load_excludes(file: Option<&Path>) -> Result<Vec<glob::Pattern>> {
    let Some(file) = file else { return Ok(Vec::new()) };
    let content = utils::read_to_string(file)?;
    let mut patterns = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let pattern = glob::Pattern::new(line).map_err(|err| {
            RunError::semantic(file, format!("invalid exclude pattern {line:?}: {err}"))
        })?;
        patterns.push(pattern);
    }
    Ok(patterns)
}

fn matches_excludes(workspace: &Path, dir: &Path, excludes: &[glob::Pattern]) -> bool {
    if excludes.is_empty() {
        return false;
    }
    let rel = utils::rebase_path(workspace, dir);
    excludes.iter().any(|p| p.matches_path(&rel) || p.matches_path(dir))
}

/// Resolves the effective policy for one external path, prompting when
/// allowed.
fn external_decision(path: &Path, opts: &GraphOptions) -> Result<ExternalPolicy> {
    match opts.external {
        ExternalPolicy::Prompt => {
            if opts.non_interactive {
                return Err(RunError::semantic(
                    path,
                    "dependency is outside of the working directory; pass --queue-include-external or --queue-exclude-external",
                ));
            }
            let stderr = std::io::stderr();
            let mut stderr = stderr.lock();
            write!(
                stderr,
                "dependency {} is outside of the working directory, include it in the run? [y/N] ",
                path.display()
            )
            .ok();
            stderr.flush().ok();
            let mut answer = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut answer)
                .map_err(|err| RunError::io(err, "<stdin>"))?;
            if matches!(answer.trim(), "y" | "Y" | "yes") {
                Ok(ExternalPolicy::Include)
            } else {
                Ok(ExternalPolicy::Exclude)
            }
        }
        decided => Ok(decided),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONFIG_FILENAME;
    use std::fs;

    fn settings(workspace: &Path) -> EvalSettings<'_> {
        EvalSettings {
            workspace,
            config_filename: CONFIG_FILENAME,
            command: "plan",
            outputs: None,
            engine_version: None,
        }
    }

    fn write_unit(root: &Path, name: &str, contents: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(CONFIG_FILENAME), contents).unwrap();
    }

    fn dep(on: &str) -> String {
        format!("dependency \"d\" {{\n  config_path = \"../{on}\"\n}}\n")
    }

    #[test]
    fn discovers_and_orders_units() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        write_unit(root, "vpc", "inputs = {}\n");
        write_unit(root, "mysql", &dep("vpc"));
        write_unit(root, "app", &dep("mysql"));

        let graph = Graph::discover(root, &settings(root), &GraphOptions::default()).unwrap();
        assert_eq!(graph.len(), 3);

        let layers = graph.layers(false);
        assert_eq!(layers.len(), 3);
        assert_eq!(graph.rel_path(layers[0][0]), PathBuf::from("vpc"));
        assert_eq!(graph.rel_path(layers[2][0]), PathBuf::from("app"));

        let reversed = graph.layers(true);
        assert_eq!(graph.rel_path(reversed[0][0]), PathBuf::from("app"));
        assert_eq!(graph.rel_path(reversed[2][0]), PathBuf::from("vpc"));
    }

    #[test]
    fn cycle_is_a_hard_error() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        write_unit(root, "a", &dep("b"));
        write_unit(root, "b", &dep("a"));

        let err = Graph::discover(root, &settings(root), &GraphOptions::default()).unwrap_err();
        match err {
            RunError::Cycle(cycle) => {
                let names: Vec<_> =
                    cycle.iter().map(|p| p.to_string_lossy().into_owned()).collect();
                assert!(names.contains(&"a".to_string()), "{names:?}");
                assert!(names.contains(&"b".to_string()), "{names:?}");
            }
            other => panic!("expected cycle error, got {other}"),
        }
    }

    #[test]
    fn skip_marks_unit_excluded_but_keeps_edges() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        write_unit(root, "vpc", "skip = true\n");
        write_unit(root, "app", &dep("vpc"));

        let graph = Graph::discover(root, &settings(root), &GraphOptions::default()).unwrap();
        let vpc = graph.index_of(&utils::canonicalized(root.join("vpc"))).unwrap();
        let app = graph.index_of(&utils::canonicalized(root.join("app"))).unwrap();
        assert_eq!(graph.node(vpc).state(), UnitState::Excluded);
        assert_eq!(graph.edges().deps_of(app), &[vpc]);
    }

    #[test]
    fn dot_output_lists_edges() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        write_unit(root, "vpc", "inputs = {}\n");
        write_unit(root, "app", &dep("vpc"));

        let graph = Graph::discover(root, &settings(root), &GraphOptions::default()).unwrap();
        let dot = graph.dot();
        assert!(dot.starts_with("digraph {"), "{dot}");
        assert!(dot.contains("\"app\" -> \"vpc\""), "{dot}");
    }

    #[test]
    fn excludes_file_patterns_apply() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        write_unit(root, "vpc", "inputs = {}\n");
        write_unit(root, "legacy", "inputs = {}\n");
        let excludes = root.join("excludes.txt");
        fs::write(&excludes, "# excluded units\nlegacy\n").unwrap();

        let opts = GraphOptions { excludes_file: Some(excludes), ..Default::default() };
        let graph = Graph::discover(root, &settings(root), &opts).unwrap();
        let legacy = graph.index_of(&utils::canonicalized(root.join("legacy"))).unwrap();
        assert_eq!(graph.node(legacy).state(), UnitState::Excluded);
    }

    #[test]
    fn external_dependency_requires_choice_when_non_interactive() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("ws");
        write_unit(tmp.path(), "shared", "inputs = {}\n");
        fs::create_dir_all(&root).unwrap();
        write_unit(&root, "app", "dependency \"d\" {\n  config_path = \"../../shared\"\n}\n");

        let opts = GraphOptions { non_interactive: true, ..Default::default() };
        let err = Graph::discover(&root, &settings(&root), &opts).unwrap_err();
        assert!(err.to_string().contains("outside of the working directory"), "{err}");

        let opts = GraphOptions {
            external: ExternalPolicy::Exclude,
            non_interactive: true,
            ..Default::default()
        };
        let graph = Graph::discover(&root, &settings(&root), &opts).unwrap();
        assert_eq!(graph.len(), 2);
        let shared = graph.index_of(&utils::canonicalized(tmp.path().join("shared"))).unwrap();
        assert_eq!(graph.node(shared).state(), UnitState::Excluded);
        assert!(graph.node(shared).is_external());
    }
}
