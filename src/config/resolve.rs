//! Config resolution
//!
//! Resolution of a unit's config file happens in two phases. Phase one parses
//! the file (and every included parent) into an AST-level [`hcl::Body`] and
//! collects the pieces needed to set up evaluation: include targets, locals
//! and `dependency` blocks. Phase two evaluates all remaining expressions
//! against an [`hcl::eval::Context`] carrying `local.*`, `include.*` and
//! `dependency.*` variables plus a small function table, then merges parent
//! configs into the child per the include merge strategy.
//!
//! Dependency outputs are looked up through the [`OutputSource`] passed in via
//! [`EvalSettings`]. Without one (during discovery) mocks substitute for real
//! outputs, which is enough to learn the dependency edges and the skip flag.

use super::{
    dependency_dir, Diagnostic, DependencyConfig, ExtraArguments, GenerateConfig, Hook,
    IfExistsPolicy, IncludeConfig, IncludeMergeStrategy, RemoteStateConfig, RemoteStateGenerate,
    TerraformConfig, UnitConfig, DEFAULT_COMMENT_PREFIX,
};
use crate::{
    cache::CachedOutputs,
    error::{Result, RunError},
    utils,
    value::{merge_with_mocks, MockMergeStrategy, OutputMap, Value},
};
use hcl::eval::{Context, Evaluate, FuncArgs, FuncDef, ParamType};
use once_cell::sync::Lazy;
use regex::Regex;
use semver::{Version, VersionReq};
use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

/// Version of the orchestrator itself, checked against
/// `orchestrator_version_constraint`.
pub static ORCHESTRATOR_VERSION: Lazy<Version> =
    Lazy::new(|| Version::parse(env!("CARGO_PKG_VERSION")).unwrap());

static RE_DEP_INPUTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"dependency\.([A-Za-z_][A-Za-z0-9_-]*)\.inputs\b").unwrap());

static RE_DEP_OUTPUTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"dependency\.([A-Za-z_][A-Za-z0-9_-]*)\.outputs\b").unwrap());

static RE_ERROR_LOCATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"line (\d+), column (\d+)").unwrap());

/// Where dependency outputs come from during evaluation.
pub trait OutputSource {
    /// Returns the producer's outputs, or [`CachedOutputs::NotApplied`] when
    /// the producer has no applied state yet.
    fn outputs_of(&self, producer_dir: &Path) -> Result<CachedOutputs>;
}

/// Everything the resolver needs besides the unit directory itself.
pub struct EvalSettings<'a> {
    pub workspace: &'a Path,
    pub config_filename: &'a str,
    /// The active engine subcommand, used for mock permission checks.
    pub command: &'a str,
    /// `None` puts the resolver into shallow mode: dependency outputs are
    /// substituted with mocks (or null) and no producer is ever invoked.
    pub outputs: Option<&'a dyn OutputSource>,
    pub engine_version: Option<&'a Version>,
}

/// Resolves the config of the unit at `unit_dir` into a [`UnitConfig`].
pub fn resolve_config(unit_dir: &Path, settings: &EvalSettings<'_>) -> Result<UnitConfig> {
    let file = unit_dir.join(settings.config_filename);
    let source = utils::read_to_string(&file)?;
    let body = parse_body(&file, &source)?;
    trace!(file = %file.display(), "resolving unit config");

    reject_dependency_inputs(&file, &source)?;

    // Phase 1: includes and their bodies.
    let includes = collect_includes(&file, &body, unit_dir, settings)?;
    let mut parents = Vec::with_capacity(includes.len());
    for include in includes {
        let parent_source = utils::read_to_string(&include.path)?;
        let parent_body = parse_body(&include.path, &parent_source)?;
        if parent_body.blocks().any(|b| b.identifier() == "include") {
            let msg = if include.merge_strategy == IncludeMergeStrategy::Strict {
                format!("included file {} is not a root config: it contains an include block", include.path.display())
            } else {
                format!("included file {} contains a nested include, which is not supported", include.path.display())
            };
            return Err(RunError::semantic(&file, msg));
        }
        reject_dependency_inputs(&include.path, &parent_source)?;
        let locals = eval_locals(&include.path, &parent_body, settings, unit_dir, &Value::Null, &[])?;
        parents.push(Parent { include, source: parent_source, body: parent_body, locals });
    }

    let include_dirs: Vec<PathBuf> = parents
        .iter()
        .filter_map(|p| p.include.path.parent().map(Path::to_path_buf))
        .collect();

    // Exposed parents become the `include.<label>` variable.
    let include_var = build_include_var(&parents);
    let child_locals =
        eval_locals(&file, &body, settings, unit_dir, &include_var, &include_dirs)?;

    // Dependency blocks, parent-first so child labels win.
    let mut dependencies: BTreeMap<String, DependencyConfig> = BTreeMap::new();
    for parent in &parents {
        if parent.include.merge_strategy == IncludeMergeStrategy::NoMerge {
            continue;
        }
        collect_dependencies(
            &parent.include.path,
            &parent.body,
            settings,
            unit_dir,
            &parent.locals,
            &Value::Null,
            &[],
            &mut dependencies,
        )?;
    }
    collect_dependencies(
        &file,
        &body,
        settings,
        unit_dir,
        &child_locals,
        &include_var,
        &include_dirs,
        &mut dependencies,
    )?;

    // Only outputs that are actually referenced are fetched.
    let mut referenced: BTreeSet<String> = BTreeSet::new();
    for text in std::iter::once(source.as_str()).chain(parents.iter().map(|p| p.source.as_str())) {
        for cap in RE_DEP_OUTPUTS.captures_iter(text) {
            referenced.insert(cap[1].to_string());
        }
    }
    let dependency_var =
        build_dependency_var(unit_dir, &dependencies, &referenced, settings)?;

    // Phase 2: full section evaluation. Each include's strategy governs how
    // that parent merges under the child config.
    let mut generate_origins: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut parent_cfgs = Vec::new();
    for parent in &parents {
        if parent.include.merge_strategy == IncludeMergeStrategy::NoMerge {
            continue;
        }
        let parent_cfg = eval_config(
            &parent.include.path,
            &parent.body,
            settings,
            unit_dir,
            &parent.locals,
            &Value::Null,
            &dependency_var,
            &[],
        )?;
        check_generate_labels(&file, &parent.include.path, &parent_cfg, &mut generate_origins)?;
        parent_cfgs.push((parent.include.merge_strategy, parent_cfg));
    }

    let child_cfg = eval_config(
        &file,
        &body,
        settings,
        unit_dir,
        &child_locals,
        &include_var,
        &dependency_var,
        &include_dirs,
    )?;
    check_generate_labels(&file, &file, &child_cfg, &mut generate_origins)?;

    // Later includes take precedence over earlier ones; the child always
    // wins over every parent.
    let mut resolved = child_cfg;
    for (strategy, parent_cfg) in parent_cfgs.into_iter().rev() {
        resolved = merge_configs(parent_cfg, resolved, strategy);
    }
    resolved.dependencies = dependencies;
    resolved.locals = child_locals;

    check_version_constraints(&resolved, settings)?;

    Ok(resolved)
}

struct Parent {
    include: IncludeConfig,
    source: String,
    body: hcl::Body,
    locals: BTreeMap<String, Value>,
}

fn parse_body(file: &Path, source: &str) -> Result<hcl::Body> {
    hcl::parse(source).map_err(|err| {
        let message = err.to_string();
        let mut diag = Diagnostic::error(file, message.clone());
        if let Some(caps) = RE_ERROR_LOCATION.captures(&message) {
            let line = caps[1].parse().unwrap_or(0);
            let column = caps[2].parse().unwrap_or(0);
            diag = diag.with_location(line, column).with_snippet_from(source);
        }
        RunError::ConfigParse(Box::new(diag))
    })
}

/// `dependency.X.inputs.Y` has a dedicated diagnostic instead of an opaque
/// traversal failure.
fn reject_dependency_inputs(file: &Path, source: &str) -> Result<()> {
    if let Some(caps) = RE_DEP_INPUTS.captures(source) {
        return Err(RunError::semantic(
            file,
            format!(
                "reading inputs from dependency {:?} is not supported; use outputs",
                &caps[1]
            ),
        ));
    }
    Ok(())
}

fn collect_includes(
    file: &Path,
    body: &hcl::Body,
    unit_dir: &Path,
    settings: &EvalSettings<'_>,
) -> Result<Vec<IncludeConfig>> {
    let mut includes = Vec::new();
    for block in body.blocks().filter(|b| b.identifier() == "include") {
        let label = block
            .labels()
            .first()
            .map(|l| l.as_str().to_string())
            .unwrap_or_else(|| "root".to_string());

        let ctx = eval_context(&BTreeMap::new(), &Value::Null, &hcl::Value::Null);
        let _guard = FuncState::install(settings, unit_dir, &[]);

        let mut path = None;
        let mut merge_strategy = IncludeMergeStrategy::default();
        let mut expose = false;
        for attr in block.body().attributes() {
            let value = eval_attr(file, attr, &ctx)?;
            match attr.key() {
                "path" => {
                    let raw = value.as_str().ok_or_else(|| {
                        RunError::semantic(file, "include path must be a string")
                    })?;
                    let p = PathBuf::from(raw);
                    let abs = if p.is_absolute() { p } else { unit_dir.join(p) };
                    path = Some(utils::canonicalized(abs));
                }
                "merge_strategy" => {
                    let raw = value.as_str().unwrap_or_default();
                    merge_strategy = IncludeMergeStrategy::parse(raw).ok_or_else(|| {
                        RunError::semantic(
                            file,
                            format!("invalid include merge_strategy {raw:?}; expected shallow, deep, no_merge or strict"),
                        )
                    })?;
                }
                "expose" => expose = value.as_bool().unwrap_or(false),
                other => {
                    return Err(RunError::semantic(
                        file,
                        format!("unrecognized include attribute {other:?}"),
                    ))
                }
            }
        }

        let path = path.ok_or_else(|| {
            RunError::semantic(file, format!("include {label:?} is missing the path attribute"))
        })?;
        includes.push(IncludeConfig { label, path, merge_strategy, expose });
    }
    Ok(includes)
}

fn build_include_var(parents: &[Parent]) -> Value {
    let mut map = BTreeMap::new();
    for parent in parents.iter().filter(|p| p.include.expose) {
        let mut entry = BTreeMap::new();
        entry.insert(
            "path".to_string(),
            Value::String(parent.include.path.to_string_lossy().into_owned()),
        );
        entry.insert("locals".to_string(), Value::Map(parent.locals.clone()));
        map.insert(parent.include.label.clone(), Value::Map(entry));
    }
    if map.is_empty() {
        Value::Null
    } else {
        Value::Map(map)
    }
}

/// Evaluates the `locals` block of a body to a fixpoint, so locals may refer
/// to other locals. A round without progress means the remaining entries form
/// a reference cycle.
fn eval_locals(
    file: &Path,
    body: &hcl::Body,
    settings: &EvalSettings<'_>,
    unit_dir: &Path,
    include_var: &Value,
    include_dirs: &[PathBuf],
) -> Result<BTreeMap<String, Value>> {
    let mut pending: Vec<&hcl::Attribute> = body
        .blocks()
        .filter(|b| b.identifier() == "locals")
        .flat_map(|b| b.body().attributes())
        .collect();
    let mut resolved: BTreeMap<String, Value> = BTreeMap::new();

    let _guard = FuncState::install(settings, unit_dir, include_dirs);
    while !pending.is_empty() {
        let mut progressed = false;
        let mut next = Vec::new();
        for attr in pending {
            let ctx = eval_context(&resolved, include_var, &hcl::Value::Null);
            match attr.expr().evaluate(&ctx) {
                Ok(value) => {
                    resolved.insert(attr.key().to_string(), Value::from_hcl(value));
                    progressed = true;
                }
                Err(_) => next.push(attr),
            }
        }
        if !progressed {
            let names: Vec<_> = next.iter().map(|a| a.key().to_string()).collect();
            // Re-evaluate one entry for the actual error message.
            let ctx = eval_context(&resolved, include_var, &hcl::Value::Null);
            let detail = next
                .first()
                .and_then(|a| a.expr().evaluate(&ctx).err())
                .map(|e| e.to_string())
                .unwrap_or_default();
            return Err(RunError::semantic(
                file,
                format!("could not evaluate locals {}: {detail}", names.join(", ")),
            ));
        }
        pending = next;
    }
    Ok(resolved)
}

#[allow(clippy::too_many_arguments)]
fn collect_dependencies(
    file: &Path,
    body: &hcl::Body,
    settings: &EvalSettings<'_>,
    unit_dir: &Path,
    locals: &BTreeMap<String, Value>,
    include_var: &Value,
    include_dirs: &[PathBuf],
    out: &mut BTreeMap<String, DependencyConfig>,
) -> Result<()> {
    let _guard = FuncState::install(settings, unit_dir, include_dirs);
    let ctx = eval_context(locals, include_var, &hcl::Value::Null);

    for block in body.blocks().filter(|b| b.identifier() == "dependency") {
        let name = block
            .labels()
            .first()
            .map(|l| l.as_str().to_string())
            .ok_or_else(|| RunError::semantic(file, "dependency block is missing its label"))?;

        let mut config_path = None;
        let mut mock_outputs = None;
        let mut mock_merge_strategy = MockMergeStrategy::default();
        let mut mock_allowed_commands = None;
        let mut skip_outputs = false;

        for attr in block.body().attributes() {
            let value = eval_attr(file, attr, &ctx)?;
            match attr.key() {
                "config_path" => {
                    let raw = value.as_str().ok_or_else(|| {
                        RunError::semantic(file, format!("dependency {name:?}: config_path must be a string"))
                    })?;
                    config_path = Some(PathBuf::from(raw));
                }
                "mock_outputs" => {
                    let map = value.as_map().cloned().ok_or_else(|| {
                        RunError::semantic(file, format!("dependency {name:?}: mock_outputs must be a map"))
                    })?;
                    mock_outputs = Some(map);
                }
                "mock_outputs_merge_strategy" => {
                    let raw = value.as_str().unwrap_or_default();
                    mock_merge_strategy = match raw {
                        "no_merge" => MockMergeStrategy::NoMerge,
                        "shallow" | "shallow_merge" => MockMergeStrategy::ShallowMerge,
                        "deep_map_only" | "deep_merge_map_only" => MockMergeStrategy::DeepMergeMapOnly,
                        other => {
                            return Err(RunError::semantic(
                                file,
                                format!(
                                    "dependency {name:?}: invalid mock_outputs_merge_strategy {other:?}; expected no_merge, shallow or deep_map_only"
                                ),
                            ))
                        }
                    };
                }
                "mock_outputs_allowed_commands" => {
                    mock_allowed_commands = Some(string_list(file, &name, attr.key(), &value)?);
                }
                "skip_outputs" => skip_outputs = value.as_bool().unwrap_or(false),
                other => {
                    return Err(RunError::semantic(
                        file,
                        format!("dependency {name:?}: unrecognized attribute {other:?}"),
                    ))
                }
            }
        }

        let config_path = config_path.ok_or_else(|| {
            RunError::semantic(file, format!("dependency {name:?} is missing config_path"))
        })?;

        out.insert(
            name.clone(),
            DependencyConfig {
                name,
                config_path,
                mock_outputs,
                mock_merge_strategy,
                mock_allowed_commands,
                skip_outputs,
            },
        );
    }
    Ok(())
}

/// Builds the `dependency.<label>.outputs` variable, consulting the output
/// source for every referenced producer.
fn build_dependency_var(
    unit_dir: &Path,
    dependencies: &BTreeMap<String, DependencyConfig>,
    referenced: &BTreeSet<String>,
    settings: &EvalSettings<'_>,
) -> Result<hcl::Value> {
    if dependencies.is_empty() {
        return Ok(hcl::Value::Null);
    }
    let mut map = BTreeMap::new();
    for (label, dep) in dependencies {
        let producer = dependency_dir(unit_dir, dep);
        let outputs = if !referenced.contains(label) || dep.skip_outputs {
            OutputMap::new()
        } else {
            resolve_outputs(unit_dir, &producer, dep, settings)?
        };
        let mut entry = BTreeMap::new();
        entry.insert(
            "config_path".to_string(),
            Value::String(producer.to_string_lossy().into_owned()),
        );
        entry.insert("outputs".to_string(), Value::Map(outputs));
        map.insert(label.clone(), Value::Map(entry));
    }
    Ok(Value::Map(map).to_hcl())
}

fn resolve_outputs(
    unit_dir: &Path,
    producer: &Path,
    dep: &DependencyConfig,
    settings: &EvalSettings<'_>,
) -> Result<OutputMap> {
    if !producer.join(settings.config_filename).is_file() {
        return Err(RunError::MissingDependencyDir {
            consumer: unit_dir.to_path_buf(),
            missing: producer.to_path_buf(),
        });
    }

    let Some(source) = settings.outputs else {
        // Shallow mode: mocks are good enough to discover the graph.
        return Ok(dep.mock_outputs.clone().unwrap_or_default());
    };

    match source.outputs_of(producer)? {
        CachedOutputs::Applied(state) => match &dep.mock_outputs {
            Some(mocks) => Ok(merge_with_mocks(&state, mocks, dep.mock_merge_strategy)),
            None => Ok((*state).clone()),
        },
        CachedOutputs::NotApplied => {
            if let Some(mocks) = &dep.mock_outputs {
                if dep.mocks_allowed(settings.command) {
                    debug!(
                        producer = %producer.display(),
                        "substituting mock outputs for unapplied dependency"
                    );
                    return Ok(mocks.clone());
                }
            }
            Err(RunError::DependencyNotApplied {
                consumer: unit_dir.to_path_buf(),
                producer: producer.to_path_buf(),
            })
        }
    }
}

/// Evaluates every recognized section of `body` into a [`UnitConfig`].
#[allow(clippy::too_many_arguments)]
fn eval_config(
    file: &Path,
    body: &hcl::Body,
    settings: &EvalSettings<'_>,
    unit_dir: &Path,
    locals: &BTreeMap<String, Value>,
    include_var: &Value,
    dependency_var: &hcl::Value,
    include_dirs: &[PathBuf],
) -> Result<UnitConfig> {
    let _guard = FuncState::install(settings, unit_dir, include_dirs);
    let ctx = eval_context(locals, include_var, dependency_var);
    let mut cfg = UnitConfig::default();

    for attr in body.attributes() {
        let value = eval_attr(file, attr, &ctx)?;
        match attr.key() {
            "inputs" => {
                cfg.inputs = value.as_map().cloned().ok_or_else(|| {
                    RunError::semantic(file, "inputs must be a map")
                })?;
            }
            "skip" => cfg.skip = expect_bool(file, "skip", &value)?,
            "prevent_destroy" => cfg.prevent_destroy = expect_bool(file, "prevent_destroy", &value)?,
            "iam_role" => cfg.iam_role = value.as_str().map(str::to_string),
            "engine_version_constraint" => {
                cfg.engine_version_constraint = Some(parse_constraint(file, &value)?)
            }
            "orchestrator_version_constraint" => {
                cfg.orchestrator_version_constraint = Some(parse_constraint(file, &value)?)
            }
            other => {
                return Err(RunError::semantic(
                    file,
                    format!("unrecognized top-level attribute {other:?}"),
                ))
            }
        }
    }

    for block in body.blocks() {
        match block.identifier() {
            // handled in phase one
            "include" | "locals" | "dependency" => {}
            "terraform" => cfg.terraform = Some(eval_terraform_block(file, block, &ctx)?),
            "remote_state" => cfg.remote_state = Some(eval_remote_state_block(file, block, &ctx)?),
            "generate" => {
                let gen = eval_generate_block(file, block, &ctx)?;
                if cfg.generate.contains_key(&gen.name) {
                    return Err(duplicate_generate(file, file, &gen.name));
                }
                cfg.generate.insert(gen.name.clone(), gen);
            }
            "before_hook" => cfg.before_hooks.push(eval_hook_block(file, block, &ctx)?),
            "after_hook" => cfg.after_hooks.push(eval_hook_block(file, block, &ctx)?),
            "error_hook" => cfg.error_hooks.push(eval_hook_block(file, block, &ctx)?),
            other => {
                return Err(RunError::semantic(
                    file,
                    format!(
                        "unrecognized block {other:?}; expected terraform, remote_state, dependency, include, locals, generate or a hook block"
                    ),
                ))
            }
        }
    }

    Ok(cfg)
}

fn eval_terraform_block(file: &Path, block: &hcl::Block, ctx: &Context<'_>) -> Result<TerraformConfig> {
    let mut tf = TerraformConfig { copy_lock_file: true, ..Default::default() };
    for attr in block.body().attributes() {
        let value = eval_attr(file, attr, ctx)?;
        match attr.key() {
            "source" => tf.source = value.as_str().map(str::to_string),
            "include_in_copy" => tf.include_in_copy = string_list(file, "terraform", attr.key(), &value)?,
            "exclude_from_copy" => {
                tf.exclude_from_copy = string_list(file, "terraform", attr.key(), &value)?
            }
            "copy_lock_file" => tf.copy_lock_file = expect_bool(file, attr.key(), &value)?,
            other => {
                return Err(RunError::semantic(
                    file,
                    format!("unrecognized terraform attribute {other:?}"),
                ))
            }
        }
    }
    for inner in block.body().blocks() {
        match inner.identifier() {
            "extra_arguments" => {
                let name = inner
                    .labels()
                    .first()
                    .map(|l| l.as_str().to_string())
                    .ok_or_else(|| RunError::semantic(file, "extra_arguments block is missing its label"))?;
                let mut ea = ExtraArguments { name, ..Default::default() };
                for attr in inner.body().attributes() {
                    let value = eval_attr(file, attr, ctx)?;
                    match attr.key() {
                        "commands" => ea.commands = string_list(file, &ea.name, attr.key(), &value)?,
                        "arguments" => ea.arguments = string_list(file, &ea.name, attr.key(), &value)?,
                        "required_var_files" => {
                            ea.required_var_files =
                                string_list(file, &ea.name, attr.key(), &value)?.into_iter().map(PathBuf::from).collect()
                        }
                        "optional_var_files" => {
                            ea.optional_var_files =
                                string_list(file, &ea.name, attr.key(), &value)?.into_iter().map(PathBuf::from).collect()
                        }
                        "env_vars" => {
                            let map = value.as_map().ok_or_else(|| {
                                RunError::semantic(file, "env_vars must be a map of strings")
                            })?;
                            ea.env_vars = map
                                .iter()
                                .map(|(k, v)| (k.clone(), v.to_env_string()))
                                .collect();
                        }
                        other => {
                            return Err(RunError::semantic(
                                file,
                                format!("unrecognized extra_arguments attribute {other:?}"),
                            ))
                        }
                    }
                }
                tf.extra_arguments.push(ea);
            }
            other => {
                return Err(RunError::semantic(
                    file,
                    format!("unrecognized terraform sub-block {other:?}"),
                ))
            }
        }
    }
    Ok(tf)
}

fn eval_remote_state_block(
    file: &Path,
    block: &hcl::Block,
    ctx: &Context<'_>,
) -> Result<RemoteStateConfig> {
    let mut rs = RemoteStateConfig::default();
    for attr in block.body().attributes() {
        let value = eval_attr(file, attr, ctx)?;
        match attr.key() {
            "backend" => {
                rs.backend = value
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| RunError::semantic(file, "remote_state backend must be a string"))?
            }
            "config" => {
                rs.config = value
                    .as_map()
                    .cloned()
                    .ok_or_else(|| RunError::semantic(file, "remote_state config must be a map"))?
            }
            "disable_init" => rs.disable_init = expect_bool(file, attr.key(), &value)?,
            other => {
                return Err(RunError::semantic(
                    file,
                    format!("unrecognized remote_state attribute {other:?}"),
                ))
            }
        }
    }
    for inner in block.body().blocks() {
        if inner.identifier() != "generate" {
            return Err(RunError::semantic(
                file,
                format!("unrecognized remote_state sub-block {:?}", inner.identifier()),
            ));
        }
        let mut path = None;
        let mut if_exists = IfExistsPolicy::default();
        for attr in inner.body().attributes() {
            let value = eval_attr(file, attr, ctx)?;
            match attr.key() {
                "path" => path = value.as_str().map(PathBuf::from),
                "if_exists" => if_exists = parse_if_exists(file, &value)?,
                other => {
                    return Err(RunError::semantic(
                        file,
                        format!("unrecognized remote_state generate attribute {other:?}"),
                    ))
                }
            }
        }
        let path = path
            .ok_or_else(|| RunError::semantic(file, "remote_state generate is missing path"))?;
        rs.generate = Some(RemoteStateGenerate { path, if_exists });
    }
    if rs.backend.is_empty() {
        return Err(RunError::semantic(file, "remote_state block is missing the backend name"));
    }
    Ok(rs)
}

fn eval_generate_block(file: &Path, block: &hcl::Block, ctx: &Context<'_>) -> Result<GenerateConfig> {
    let name = block
        .labels()
        .first()
        .map(|l| l.as_str().to_string())
        .ok_or_else(|| RunError::semantic(file, "generate block is missing its label"))?;

    let mut gen = GenerateConfig::new(name, PathBuf::new(), String::new());
    let mut saw_path = false;
    for attr in block.body().attributes() {
        let value = eval_attr(file, attr, ctx)?;
        match attr.key() {
            "path" => {
                gen.path = PathBuf::from(value.as_str().ok_or_else(|| {
                    RunError::semantic(file, format!("generate {:?}: path must be a string", gen.name))
                })?);
                saw_path = true;
            }
            "contents" => {
                gen.contents = value.as_str().map(str::to_string).ok_or_else(|| {
                    RunError::semantic(file, format!("generate {:?}: contents must be a string", gen.name))
                })?;
            }
            "if_exists" => gen.if_exists = parse_if_exists(file, &value)?,
            "disable" => gen.disable = expect_bool(file, attr.key(), &value)?,
            "disable_signature" => gen.disable_signature = expect_bool(file, attr.key(), &value)?,
            "comment_prefix" => {
                gen.comment_prefix =
                    value.as_str().unwrap_or(DEFAULT_COMMENT_PREFIX).to_string()
            }
            other => {
                return Err(RunError::semantic(
                    file,
                    format!("unrecognized generate attribute {other:?}"),
                ))
            }
        }
    }
    if !saw_path {
        return Err(RunError::semantic(file, format!("generate {:?} is missing path", gen.name)));
    }
    Ok(gen)
}

fn eval_hook_block(file: &Path, block: &hcl::Block, ctx: &Context<'_>) -> Result<Hook> {
    let kind = block.identifier();
    let name = block
        .labels()
        .first()
        .map(|l| l.as_str().to_string())
        .ok_or_else(|| RunError::semantic(file, format!("{kind} block is missing its label")))?;

    let mut hook = Hook {
        name,
        commands: Vec::new(),
        execute: Vec::new(),
        working_dir: None,
        run_on_error: false,
        suppress_stdout: false,
        condition: None,
    };
    for attr in block.body().attributes() {
        let value = eval_attr(file, attr, ctx)?;
        match attr.key() {
            "commands" => hook.commands = string_list(file, &hook.name, attr.key(), &value)?,
            "execute" => hook.execute = string_list(file, &hook.name, attr.key(), &value)?,
            "working_dir" => hook.working_dir = value.as_str().map(PathBuf::from),
            "run_on_error" => hook.run_on_error = expect_bool(file, attr.key(), &value)?,
            "suppress_stdout" => hook.suppress_stdout = expect_bool(file, attr.key(), &value)?,
            "if" => hook.condition = Some(expect_bool(file, attr.key(), &value)?),
            other => {
                return Err(RunError::semantic(
                    file,
                    format!("unrecognized {kind} attribute {other:?}"),
                ))
            }
        }
    }
    if hook.execute.is_empty() {
        return Err(RunError::semantic(
            file,
            format!("{kind} {:?} is missing the execute list", hook.name),
        ));
    }
    Ok(hook)
}

/// Merges `child` over `parent` per the include merge strategy, returning the
/// effective config.
fn merge_configs(parent: UnitConfig, child: UnitConfig, strategy: IncludeMergeStrategy) -> UnitConfig {
    match strategy {
        IncludeMergeStrategy::NoMerge => child,
        IncludeMergeStrategy::Shallow | IncludeMergeStrategy::Strict => {
            shallow_merge(parent, child)
        }
        IncludeMergeStrategy::Deep => deep_merge(parent, child),
    }
}

fn shallow_merge(parent: UnitConfig, mut child: UnitConfig) -> UnitConfig {
    let mut inputs = parent.inputs;
    inputs.extend(child.inputs);
    child.inputs = inputs;

    if child.terraform.is_none() {
        child.terraform = parent.terraform;
    }
    if child.remote_state.is_none() {
        child.remote_state = parent.remote_state;
    }
    let mut generate = parent.generate;
    generate.extend(child.generate);
    child.generate = generate;

    child.before_hooks = crate::hooks::merge_hooks(&parent.before_hooks, &child.before_hooks);
    child.after_hooks = crate::hooks::merge_hooks(&parent.after_hooks, &child.after_hooks);
    child.error_hooks = crate::hooks::merge_hooks(&parent.error_hooks, &child.error_hooks);

    child.skip |= parent.skip;
    child.prevent_destroy |= parent.prevent_destroy;
    child.iam_role = child.iam_role.or(parent.iam_role);
    child.engine_version_constraint =
        child.engine_version_constraint.or(parent.engine_version_constraint);
    child.orchestrator_version_constraint =
        child.orchestrator_version_constraint.or(parent.orchestrator_version_constraint);
    child
}

fn deep_merge(parent: UnitConfig, mut child: UnitConfig) -> UnitConfig {
    let mut inputs = parent.inputs.clone();
    for (key, cv) in std::mem::take(&mut child.inputs) {
        let merged = match inputs.remove(&key) {
            Some(pv) => deep_merge_values(pv, cv),
            None => cv,
        };
        inputs.insert(key, merged);
    }
    child.inputs = inputs;

    child.terraform = match (parent.terraform, child.terraform) {
        (Some(p), Some(mut c)) => {
            c.source = c.source.or(p.source);
            c.include_in_copy = [p.include_in_copy, c.include_in_copy].concat();
            c.exclude_from_copy = [p.exclude_from_copy, c.exclude_from_copy].concat();
            let mut extra = p.extra_arguments;
            for cea in c.extra_arguments {
                if let Some(slot) = extra.iter_mut().find(|pea| pea.name == cea.name) {
                    *slot = cea;
                } else {
                    extra.push(cea);
                }
            }
            c.extra_arguments = extra;
            Some(c)
        }
        (p, c) => c.or(p),
    };

    let parent_rest = UnitConfig {
        remote_state: parent.remote_state,
        generate: parent.generate,
        before_hooks: parent.before_hooks,
        after_hooks: parent.after_hooks,
        error_hooks: parent.error_hooks,
        skip: parent.skip,
        prevent_destroy: parent.prevent_destroy,
        iam_role: parent.iam_role,
        engine_version_constraint: parent.engine_version_constraint,
        orchestrator_version_constraint: parent.orchestrator_version_constraint,
        ..Default::default()
    };
    let merged_rest = shallow_merge(parent_rest, UnitConfig {
        remote_state: child.remote_state.take(),
        generate: std::mem::take(&mut child.generate),
        before_hooks: std::mem::take(&mut child.before_hooks),
        after_hooks: std::mem::take(&mut child.after_hooks),
        error_hooks: std::mem::take(&mut child.error_hooks),
        skip: child.skip,
        prevent_destroy: child.prevent_destroy,
        iam_role: child.iam_role.take(),
        engine_version_constraint: child.engine_version_constraint.take(),
        orchestrator_version_constraint: child.orchestrator_version_constraint.take(),
        ..Default::default()
    });

    child.remote_state = merged_rest.remote_state;
    child.generate = merged_rest.generate;
    child.before_hooks = merged_rest.before_hooks;
    child.after_hooks = merged_rest.after_hooks;
    child.error_hooks = merged_rest.error_hooks;
    child.skip = merged_rest.skip;
    child.prevent_destroy = merged_rest.prevent_destroy;
    child.iam_role = merged_rest.iam_role;
    child.engine_version_constraint = merged_rest.engine_version_constraint;
    child.orchestrator_version_constraint = merged_rest.orchestrator_version_constraint;
    child
}

fn deep_merge_values(parent: Value, child: Value) -> Value {
    match (parent, child) {
        (Value::Map(p), Value::Map(c)) => {
            let mut merged = p;
            for (k, cv) in c {
                let entry = match merged.remove(&k) {
                    Some(pv) => deep_merge_values(pv, cv),
                    None => cv,
                };
                merged.insert(k, entry);
            }
            Value::Map(merged)
        }
        (Value::List(p), Value::List(c)) => Value::List([p, c].concat()),
        (_, child) => child,
    }
}

fn check_generate_labels(
    unit_file: &Path,
    origin: &Path,
    cfg: &UnitConfig,
    seen: &mut BTreeMap<String, PathBuf>,
) -> Result<()> {
    for label in cfg.generate.keys() {
        if let Some(previous) = seen.get(label) {
            return Err(duplicate_generate(unit_file, previous, label));
        }
        seen.insert(label.clone(), origin.to_path_buf());
    }
    Ok(())
}

fn duplicate_generate(file: &Path, previous: &Path, label: &str) -> RunError {
    RunError::semantic(
        file,
        format!(
            "duplicate generate block {label:?}; labels must be unique across includes (first defined in {})",
            previous.display()
        ),
    )
}

fn check_version_constraints(cfg: &UnitConfig, settings: &EvalSettings<'_>) -> Result<()> {
    if let (Some(constraint), Some(version)) =
        (&cfg.engine_version_constraint, settings.engine_version)
    {
        if !constraint.matches(version) {
            return Err(RunError::VersionConstraint {
                subject: "engine",
                constraint: constraint.clone(),
                actual: version.clone(),
            });
        }
    }
    if let Some(constraint) = &cfg.orchestrator_version_constraint {
        if !constraint.matches(&ORCHESTRATOR_VERSION) {
            return Err(RunError::VersionConstraint {
                subject: "orchestrator",
                constraint: constraint.clone(),
                actual: ORCHESTRATOR_VERSION.clone(),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------- evaluation

fn eval_attr(file: &Path, attr: &hcl::Attribute, ctx: &Context<'_>) -> Result<Value> {
    attr.expr().evaluate(ctx).map(Value::from_hcl).map_err(|err| {
        RunError::ConfigParse(Box::new(
            Diagnostic::error(file, format!("could not evaluate {:?}", attr.key()))
                .with_detail(err.to_string()),
        ))
    })
}

fn expect_bool(file: &Path, key: &str, value: &Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| RunError::semantic(file, format!("{key} must be a bool")))
}

fn parse_constraint(file: &Path, value: &Value) -> Result<VersionReq> {
    let raw = value
        .as_str()
        .ok_or_else(|| RunError::semantic(file, "version constraint must be a string"))?;
    VersionReq::parse(raw)
        .map_err(|err| RunError::semantic(file, format!("invalid version constraint {raw:?}: {err}")))
}

fn parse_if_exists(file: &Path, value: &Value) -> Result<IfExistsPolicy> {
    let raw = value.as_str().unwrap_or_default();
    IfExistsPolicy::parse(raw).ok_or_else(|| {
        RunError::semantic(
            file,
            format!(
                "invalid if_exists {raw:?}; expected overwrite, overwrite_terragrunt, skip, error, remove or remove_terragrunt"
            ),
        )
    })
}

fn string_list(file: &Path, owner: &str, key: &str, value: &Value) -> Result<Vec<String>> {
    match value {
        Value::List(items) => items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    RunError::semantic(file, format!("{owner}: {key} must be a list of strings"))
                })
            })
            .collect(),
        _ => Err(RunError::semantic(file, format!("{owner}: {key} must be a list of strings"))),
    }
}

fn eval_context(
    locals: &BTreeMap<String, Value>,
    include_var: &Value,
    dependency_var: &hcl::Value,
) -> Context<'static> {
    let mut ctx = Context::new();
    ctx.declare_var(
        hcl::Identifier::sanitized("local"),
        Value::Map(locals.clone()).to_hcl(),
    );
    if !include_var.is_null() {
        ctx.declare_var(hcl::Identifier::sanitized("include"), include_var.to_hcl());
    }
    if !matches!(dependency_var, hcl::Value::Null) {
        ctx.declare_var(hcl::Identifier::sanitized("dependency"), dependency_var.clone());
    }
    declare_functions(&mut ctx);
    ctx
}

// Config functions are plain function pointers, so per-evaluation context
// travels through a thread local installed for the duration of a resolve.
thread_local! {
    static FUNC_STATE: RefCell<Option<FuncStateData>> = const { RefCell::new(None) };
}

#[derive(Clone)]
struct FuncStateData {
    unit_dir: PathBuf,
    workspace: PathBuf,
    config_filename: String,
    command: String,
    include_dirs: Vec<PathBuf>,
}

struct FuncState;

impl FuncState {
    fn install(settings: &EvalSettings<'_>, unit_dir: &Path, include_dirs: &[PathBuf]) -> Self {
        FUNC_STATE.with(|slot| {
            *slot.borrow_mut() = Some(FuncStateData {
                unit_dir: unit_dir.to_path_buf(),
                workspace: settings.workspace.to_path_buf(),
                config_filename: settings.config_filename.to_string(),
                command: settings.command.to_string(),
                include_dirs: include_dirs.to_vec(),
            });
        });
        FuncState
    }
}

impl Drop for FuncState {
    fn drop(&mut self) {
        FUNC_STATE.with(|slot| slot.borrow_mut().take());
    }
}

fn with_func_state<T>(f: impl FnOnce(&FuncStateData) -> Result<T, String>) -> Result<T, String> {
    FUNC_STATE.with(|slot| {
        let borrowed = slot.borrow();
        let state = borrowed.as_ref().ok_or_else(|| "no evaluation in progress".to_string())?;
        f(state)
    })
}

fn declare_functions(ctx: &mut Context<'_>) {
    ctx.declare_func(
        hcl::Identifier::sanitized("find_in_parent_folders"),
        FuncDef::builder().variadic_param(ParamType::String).build(fn_find_in_parent_folders),
    );
    ctx.declare_func(
        hcl::Identifier::sanitized("path_relative_to_include"),
        FuncDef::builder().build(fn_path_relative_to_include),
    );
    ctx.declare_func(
        hcl::Identifier::sanitized("get_env"),
        FuncDef::builder().variadic_param(ParamType::String).build(fn_get_env),
    );
    ctx.declare_func(
        hcl::Identifier::sanitized("get_engine_command"),
        FuncDef::builder().build(fn_get_engine_command),
    );
    ctx.declare_func(
        hcl::Identifier::sanitized("get_workspace_dir"),
        FuncDef::builder().build(fn_get_workspace_dir),
    );
    ctx.declare_func(
        hcl::Identifier::sanitized("get_unit_dir"),
        FuncDef::builder().build(fn_get_unit_dir),
    );
}

fn arg_str(args: &FuncArgs, index: usize) -> Option<String> {
    if index < args.len() {
        args[index].as_str().map(str::to_string)
    } else {
        None
    }
}

fn fn_find_in_parent_folders(args: FuncArgs) -> Result<hcl::Value, String> {
    with_func_state(|st| {
        let name = arg_str(&args, 0).unwrap_or_else(|| st.config_filename.clone());
        utils::find_in_parent_folders(&st.unit_dir, &name)
            .map(|p| hcl::Value::String(p.to_string_lossy().into_owned()))
            .ok_or_else(|| {
                format!("{name} not found in any parent folder of {}", st.unit_dir.display())
            })
    })
}

fn fn_path_relative_to_include(_args: FuncArgs) -> Result<hcl::Value, String> {
    with_func_state(|st| {
        let base = st.include_dirs.first().cloned().unwrap_or_else(|| st.unit_dir.clone());
        let rel = utils::rebase_path(&base, &st.unit_dir);
        Ok(hcl::Value::String(rel.to_string_lossy().into_owned()))
    })
}

fn fn_get_env(args: FuncArgs) -> Result<hcl::Value, String> {
    let name =
        arg_str(&args, 0).ok_or_else(|| "get_env requires a variable name".to_string())?;
    match std::env::var(&name) {
        Ok(v) => Ok(hcl::Value::String(v)),
        Err(_) => match arg_str(&args, 1) {
            Some(default) => Ok(hcl::Value::String(default)),
            None => Err(format!("environment variable {name} is not set")),
        },
    }
}

fn fn_get_engine_command(_args: FuncArgs) -> Result<hcl::Value, String> {
    with_func_state(|st| Ok(hcl::Value::String(st.command.clone())))
}

fn fn_get_workspace_dir(_args: FuncArgs) -> Result<hcl::Value, String> {
    with_func_state(|st| Ok(hcl::Value::String(st.workspace.to_string_lossy().into_owned())))
}

fn fn_get_unit_dir(_args: FuncArgs) -> Result<hcl::Value, String> {
    with_func_state(|st| Ok(hcl::Value::String(st.unit_dir.to_string_lossy().into_owned())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn settings<'a>(workspace: &'a Path) -> EvalSettings<'a> {
        EvalSettings {
            workspace,
            config_filename: super::super::CONFIG_FILENAME,
            command: "plan",
            outputs: None,
            engine_version: None,
        }
    }

    fn write_config(dir: &Path, contents: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(super::super::CONFIG_FILENAME), contents).unwrap();
    }

    #[test]
    fn resolves_inputs_and_locals() {
        let tmp = tempfile::tempdir().unwrap();
        let unit = tmp.path().join("app");
        write_config(
            &unit,
            r#"
locals {
  region = "eu-west-1"
  name   = "app-${local.region}"
}

inputs = {
  name   = local.name
  region = local.region
}
"#,
        );
        let cfg = resolve_config(&unit, &settings(tmp.path())).unwrap();
        assert_eq!(cfg.inputs.get("name"), Some(&Value::String("app-eu-west-1".into())));
    }

    #[test]
    fn locals_cycle_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let unit = tmp.path().join("app");
        write_config(
            &unit,
            r#"
locals {
  a = local.b
  b = local.a
}
"#,
        );
        let err = resolve_config(&unit, &settings(tmp.path())).unwrap_err();
        assert!(err.to_string().contains("could not evaluate locals"));
    }

    #[test]
    fn include_shallow_merges_inputs() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::write(
            root.join("root.hcl"),
            r#"
inputs = {
  region = "eu-west-1"
  env    = "dev"
}
"#,
        )
        .unwrap();
        let unit = root.join("app");
        write_config(
            &unit,
            r#"
include "root" {
  path = find_in_parent_folders("root.hcl")
}

inputs = {
  env = "prod"
}
"#,
        );
        let cfg = resolve_config(&unit, &settings(root)).unwrap();
        assert_eq!(cfg.inputs.get("region"), Some(&Value::String("eu-west-1".into())));
        assert_eq!(cfg.inputs.get("env"), Some(&Value::String("prod".into())));
    }

    #[test]
    fn duplicate_generate_label_across_includes_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::write(
            root.join("root.hcl"),
            r#"
generate "backend" {
  path     = "backend.tf"
  contents = "terraform {}"
}
"#,
        )
        .unwrap();
        let unit = root.join("app");
        write_config(
            &unit,
            r#"
include "root" {
  path = find_in_parent_folders("root.hcl")
}

generate "backend" {
  path     = "backend.tf"
  contents = "terraform {}"
}
"#,
        );
        let err = resolve_config(&unit, &settings(root)).unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("duplicate generate block"), "{rendered}");
        assert!(rendered.contains("backend"), "{rendered}");
    }

    #[test]
    fn dependency_inputs_reference_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let unit = tmp.path().join("app");
        write_config(
            &unit,
            r#"
dependency "vpc" {
  config_path = "../vpc"
}

inputs = {
  cidr = dependency.vpc.inputs.cidr
}
"#,
        );
        let err = resolve_config(&unit, &settings(tmp.path())).unwrap_err();
        assert!(err.to_string().contains("use outputs"));
    }

    #[test]
    fn shallow_mode_uses_mocks_for_outputs() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        write_config(&root.join("vpc"), "inputs = {}\n");
        let unit = root.join("app");
        write_config(
            &unit,
            r#"
dependency "vpc" {
  config_path = "../vpc"
  mock_outputs = {
    vpc_id = "vpc-mock"
  }
}

inputs = {
  vpc_id = dependency.vpc.outputs.vpc_id
}
"#,
        );
        let cfg = resolve_config(&unit, &settings(root)).unwrap();
        assert_eq!(cfg.inputs.get("vpc_id"), Some(&Value::String("vpc-mock".into())));
        assert_eq!(cfg.dependencies.len(), 1);
    }

    #[test]
    fn missing_dependency_dir_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let unit = tmp.path().join("app");
        write_config(
            &unit,
            r#"
dependency "vpc" {
  config_path = "../vpc"
}

inputs = {
  vpc_id = dependency.vpc.outputs.vpc_id
}
"#,
        );
        let err = resolve_config(&unit, &settings(tmp.path())).unwrap_err();
        assert!(matches!(err, RunError::MissingDependencyDir { .. }), "{err}");
    }

    #[test]
    fn version_constraint_mismatch_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let unit = tmp.path().join("app");
        write_config(&unit, "engine_version_constraint = \">= 99.0.0\"\n");
        let version = Version::new(1, 6, 0);
        let mut s = settings(tmp.path());
        s.engine_version = Some(&version);
        let err = resolve_config(&unit, &s).unwrap_err();
        assert!(matches!(err, RunError::VersionConstraint { .. }), "{err}");
        assert!(err.is_fatal());
    }

    #[test]
    fn unknown_block_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let unit = tmp.path().join("app");
        write_config(&unit, "mystery {\n}\n");
        let err = resolve_config(&unit, &settings(tmp.path())).unwrap_err();
        assert!(err.to_string().contains("unrecognized block"));
    }
}
