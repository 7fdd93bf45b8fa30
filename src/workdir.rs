//! Per-unit working directories
//!
//! Every unit executes in a scratch directory whose name derives
//! deterministically from the canonical unit path, so repeated runs reuse it
//! and engine state (providers, local state) survives between runs. A failing
//! preparation step leaves the directory in a state where a retry with
//! identical inputs is safe: every write is a deterministic overwrite.

use crate::{
    config::{GenerateConfig, IfExistsPolicy, RemoteStateConfig, UnitConfig},
    error::{Result, RunError},
    report::Reporter,
    utils,
    value::Value,
};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use walkdir::WalkDir;

/// Name of the scratch directory nested in each unit directory.
pub const SCRATCH_DIR: &str = ".terrarun-cache";

/// The engine's dependency lock file.
pub const LOCK_FILE: &str = ".terraform.lock.hcl";

/// Marker carried by the signature line of generated files.
pub const SIGNATURE_MARKER: &str = "Generated by terrarun";

/// Marker file recording which source was fetched into a scratch dir.
const SOURCE_MARKER: &str = ".terrarun-source";

const FETCH_ATTEMPTS: usize = 3;
const FETCH_BACKOFF: Duration = Duration::from_secs(2);

/// A parsed `terraform.source` value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceSpec {
    pub url: String,
    /// Git ref from a `?ref=` query.
    pub reference: Option<String>,
    /// Subdirectory selected with the `//` separator.
    pub subdir: Option<PathBuf>,
}

impl SourceSpec {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.strip_prefix("git::").unwrap_or(raw);
        let (raw, reference) = match raw.split_once("?ref=") {
            Some((base, reference)) => (base, Some(reference.to_string())),
            None => (raw, None),
        };
        // `//` after the scheme separates the repository from a subdirectory
        let scheme_end = raw.find("://").map(|i| i + 3).unwrap_or(0);
        let (url, subdir) = match raw[scheme_end..].find("//") {
            Some(offset) => {
                let split = scheme_end + offset;
                (raw[..split].to_string(), Some(PathBuf::from(&raw[split + 2..])))
            }
            None => (raw.to_string(), None),
        };
        Self { url, reference, subdir }
    }

    /// Local paths are everything that is not a URL or an scp-style git
    /// address.
    pub fn is_local(&self) -> bool {
        !self.url.contains("://") && !self.url.starts_with("git@")
    }
}

/// External collaborator fetching module sources into scratch dirs.
pub trait SourceFetcher: Send + Sync {
    fn fetch(&self, spec: &SourceSpec, dest: &Path) -> Result<()>;
}

/// Fetches local paths by copy and git URLs via the `git` binary.
#[derive(Debug, Default)]
pub struct DefaultFetcher;

impl SourceFetcher for DefaultFetcher {
    fn fetch(&self, spec: &SourceSpec, dest: &Path) -> Result<()> {
        if spec.is_local() {
            return Err(RunError::working_dir(
                dest,
                format!("local source {} must be copied, not fetched", spec.url),
            ));
        }
        let checkout = dest.join(".terrarun-src");
        if checkout.exists() {
            std::fs::remove_dir_all(&checkout).map_err(|err| RunError::io(err, &checkout))?;
        }
        let mut cmd = std::process::Command::new("git");
        cmd.arg("clone").arg("--depth").arg("1");
        if let Some(reference) = &spec.reference {
            cmd.arg("--branch").arg(reference);
        }
        cmd.arg(&spec.url).arg(&checkout);
        debug!(?cmd, "fetching source");
        let output = cmd.output().map_err(|err| RunError::io(err, "git"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RunError::working_dir(
                dest,
                format!("git clone of {} failed: {}", spec.url, stderr.trim()),
            ));
        }

        let from = match &spec.subdir {
            Some(subdir) => checkout.join(subdir),
            None => checkout.clone(),
        };
        if !from.is_dir() {
            return Err(RunError::working_dir(
                dest,
                format!("source subdirectory {} does not exist", from.display()),
            ));
        }
        copy_dir_contents(&from, dest)?;
        std::fs::remove_dir_all(&checkout).map_err(|err| RunError::io(err, &checkout))?;
        Ok(())
    }
}

/// Options for preparing one unit's scratch dir.
pub struct PrepareOptions<'a> {
    /// CLI override of `terraform.source`.
    pub source_override: Option<&'a str>,
    pub fetcher: &'a dyn SourceFetcher,
    pub reporter: &'a Reporter,
}

/// Materializes the scratch dir for `unit_dir`: source fetch, unit file
/// copy, generate blocks and the lock file. Returns the scratch path.
pub fn prepare(unit_dir: &Path, config: &UnitConfig, opts: &PrepareOptions<'_>) -> Result<PathBuf> {
    let scratch = scratch_dir(unit_dir);
    utils::create_dir_all(&scratch)?;

    let source = opts.source_override.or(config.source());
    if let Some(source) = source {
        let spec = SourceSpec::parse(source);
        if spec.is_local() {
            let from = if Path::new(&spec.url).is_absolute() {
                PathBuf::from(&spec.url)
            } else {
                unit_dir.join(&spec.url)
            };
            let from = utils::canonicalize(&from)?;
            trace!(unit = %unit_dir.display(), source = %from.display(), "copying local source");
            copy_dir_contents(&from, &scratch)?;
        } else {
            // The marker keeps repeated runs from re-fetching the same source.
            let marker = scratch.join(SOURCE_MARKER);
            let recorded = std::fs::read_to_string(&marker).unwrap_or_default();
            if recorded.trim() != source {
                opts.reporter.info(Some(unit_dir), format!("fetching source {source}"));
                utils::retry_transient(FETCH_ATTEMPTS, FETCH_BACKOFF, || {
                    opts.fetcher.fetch(&spec, &scratch)
                })?;
                utils::write(&marker, source)?;
            }
        }
    }

    copy_unit_files(unit_dir, &scratch, config)?;

    for gen in config.generate.values() {
        apply_generate(&scratch, gen)?;
    }
    if let Some(remote_state) = &config.remote_state {
        if let Some(gen) = remote_state_generate(remote_state) {
            apply_generate(&scratch, &gen)?;
        }
    }

    let lock = unit_dir.join(LOCK_FILE);
    let copy_lock = config.terraform.as_ref().map(|t| t.copy_lock_file).unwrap_or(true);
    if copy_lock && lock.is_file() {
        std::fs::copy(&lock, scratch.join(LOCK_FILE)).map_err(|err| RunError::io(err, &lock))?;
    }

    Ok(scratch)
}

/// Deterministic scratch path for a unit.
pub fn scratch_dir(unit_dir: &Path) -> PathBuf {
    let canonical = utils::canonicalized(unit_dir);
    unit_dir.join(SCRATCH_DIR).join(utils::path_digest(&canonical))
}

/// Copies the unit's own files into the scratch dir, honoring the copy
/// filters. Dotfiles are skipped unless `include_in_copy` matches them.
fn copy_unit_files(unit_dir: &Path, scratch: &Path, config: &UnitConfig) -> Result<()> {
    let includes = compile_globs(unit_dir, config.terraform.as_ref().map(|t| t.include_in_copy.as_slice()))?;
    let excludes = compile_globs(unit_dir, config.terraform.as_ref().map(|t| t.exclude_from_copy.as_slice()))?;

    for entry in WalkDir::new(unit_dir).min_depth(1).into_iter().filter_entry(|e| {
        !e.file_name().to_str().map(|s| utils::IGNORED_DIRS.contains(&s)).unwrap_or(false)
    }) {
        let entry =
            entry.map_err(|err| RunError::working_dir(unit_dir, format!("walking unit: {err}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = utils::rebase_path(unit_dir, entry.path());
        let included = includes.iter().any(|p| p.matches_path(&rel));
        if excludes.iter().any(|p| p.matches_path(&rel)) && !included {
            continue;
        }
        let hidden = rel
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .any(|c| c.starts_with('.'));
        if hidden && !included {
            continue;
        }
        let dest = scratch.join(&rel);
        if let Some(parent) = dest.parent() {
            utils::create_dir_all(parent)?;
        }
        std::fs::copy(entry.path(), &dest).map_err(|err| RunError::io(err, entry.path()))?;
    }
    Ok(())
}

fn compile_globs(unit_dir: &Path, patterns: Option<&[String]>) -> Result<Vec<glob::Pattern>> {
    patterns
        .unwrap_or_default()
        .iter()
        .map(|raw| {
            glob::Pattern::new(raw).map_err(|err| {
                RunError::working_dir(unit_dir, format!("invalid copy pattern {raw:?}: {err}"))
            })
        })
        .collect()
}

fn copy_dir_contents(from: &Path, to: &Path) -> Result<()> {
    let options = fs_extra::dir::CopyOptions::new().overwrite(true).content_only(true);
    fs_extra::dir::copy(from, to, &options)
        .map_err(|err| RunError::working_dir(to, format!("copying {}: {err}", from.display())))?;
    Ok(())
}

/// The deterministic signature line written at the top of generated files.
pub fn signature_line(gen: &GenerateConfig) -> String {
    let digest = utils::path_digest(Path::new(&format!("{}:{}", gen.name, gen.path.display())));
    format!("{}{SIGNATURE_MARKER}. Sig: {digest}", gen.comment_prefix)
}

fn is_generated(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| content.lines().next().map(|l| l.contains(SIGNATURE_MARKER)))
        .unwrap_or(false)
}

/// Applies one `generate` block to the scratch dir per its if-exists policy.
pub fn apply_generate(scratch: &Path, gen: &GenerateConfig) -> Result<()> {
    let target = scratch.join(&gen.path);
    let exists = target.exists();

    if gen.disable {
        // A disabled block cleans up the file it generated earlier.
        if exists && is_generated(&target) {
            trace!(file = %target.display(), "removing generated file of disabled block");
            utils::remove_file(&target)?;
        }
        return Ok(());
    }

    match gen.if_exists {
        IfExistsPolicy::Overwrite => {}
        IfExistsPolicy::OverwriteTerragrunt => {
            if exists && !is_generated(&target) {
                return Err(RunError::working_dir(
                    &target,
                    format!(
                        "generate {:?} refuses to overwrite a file it did not generate",
                        gen.name
                    ),
                ));
            }
        }
        IfExistsPolicy::Skip => {
            if exists {
                return Ok(());
            }
        }
        IfExistsPolicy::Error => {
            if exists {
                return Err(RunError::working_dir(
                    &target,
                    format!("generate {:?}: target already exists", gen.name),
                ));
            }
        }
        IfExistsPolicy::Remove => {
            if exists {
                utils::remove_file(&target)?;
            }
            return Ok(());
        }
        IfExistsPolicy::RemoveTerragrunt => {
            if exists {
                if !is_generated(&target) {
                    return Err(RunError::working_dir(
                        &target,
                        format!(
                            "generate {:?} refuses to remove a file it did not generate",
                            gen.name
                        ),
                    ));
                }
                utils::remove_file(&target)?;
            }
            return Ok(());
        }
    }

    let mut contents = String::new();
    if !gen.disable_signature {
        contents.push_str(&signature_line(gen));
        contents.push('\n');
    }
    contents.push_str(&gen.contents);
    utils::write(&target, contents)
}

/// Synthesizes the backend file of a `remote_state` block with a `generate`
/// section.
fn remote_state_generate(remote_state: &RemoteStateConfig) -> Option<GenerateConfig> {
    let target = remote_state.generate.as_ref()?;
    let mut body = String::new();
    body.push_str("terraform {\n");
    body.push_str(&format!("  backend \"{}\" {{\n", remote_state.backend));
    for (key, value) in &remote_state.config {
        body.push_str(&format!("    {key} = {}\n", render_hcl_value(value)));
    }
    body.push_str("  }\n}\n");

    let mut gen = GenerateConfig::new("remote_state", target.path.clone(), body);
    gen.if_exists = target.if_exists;
    Some(gen)
}

/// Renders a value as an HCL expression literal.
fn render_hcl_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_else(|_| format!("{s:?}")),
        Value::List(items) => {
            let rendered: Vec<_> = items.iter().map(render_hcl_value).collect();
            format!("[{}]", rendered.join(", "))
        }
        Value::Map(map) => {
            let rendered: Vec<_> = map
                .iter()
                .map(|(k, v)| format!("{k} = {}", render_hcl_value(v)))
                .collect();
            format!("{{ {} }}", rendered.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{Reporter, ReporterOptions};
    use pretty_assertions::assert_eq;
    use std::fs;

    fn reporter() -> Reporter {
        Reporter::with_sink(ReporterOptions::default(), Box::new(std::io::sink()))
    }

    fn gen(name: &str, path: &str, contents: &str) -> GenerateConfig {
        GenerateConfig::new(name, path, contents)
    }

    #[test]
    fn parses_source_specs() {
        let spec = SourceSpec::parse("git::https://example.com/modules.git//vpc?ref=v1.2.0");
        assert_eq!(spec.url, "https://example.com/modules.git");
        assert_eq!(spec.reference.as_deref(), Some("v1.2.0"));
        assert_eq!(spec.subdir, Some(PathBuf::from("vpc")));
        assert!(!spec.is_local());

        let spec = SourceSpec::parse("../modules/vpc");
        assert_eq!(spec.url, "../modules/vpc");
        assert!(spec.is_local());
    }

    #[test]
    fn scratch_dir_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let unit = tmp.path().join("app");
        fs::create_dir_all(&unit).unwrap();
        assert_eq!(scratch_dir(&unit), scratch_dir(&unit));
        assert!(scratch_dir(&unit).starts_with(unit.join(SCRATCH_DIR)));
    }

    #[test]
    fn generate_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let block = gen("backend", "backend.tf", "terraform {}\n");
        apply_generate(tmp.path(), &block).unwrap();
        let first = fs::read(tmp.path().join("backend.tf")).unwrap();
        apply_generate(tmp.path(), &block).unwrap();
        let second = fs::read(tmp.path().join("backend.tf")).unwrap();
        assert_eq!(first, second);
        let content = String::from_utf8(first).unwrap();
        assert!(content.starts_with(&signature_line(&block)));
    }

    #[test]
    fn overwrite_terragrunt_refuses_user_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("backend.tf"), "user content\n").unwrap();
        let block = gen("backend", "backend.tf", "terraform {}\n");
        let err = apply_generate(tmp.path(), &block).unwrap_err();
        assert!(err.to_string().contains("did not generate"), "{err}");
    }

    #[test]
    fn skip_keeps_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("backend.tf"), "keep me\n").unwrap();
        let mut block = gen("backend", "backend.tf", "terraform {}\n");
        block.if_exists = IfExistsPolicy::Skip;
        apply_generate(tmp.path(), &block).unwrap();
        assert_eq!(fs::read_to_string(tmp.path().join("backend.tf")).unwrap(), "keep me\n");
    }

    #[test]
    fn error_policy_rejects_existing_target() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("backend.tf"), "existing\n").unwrap();
        let mut block = gen("backend", "backend.tf", "terraform {}\n");
        block.if_exists = IfExistsPolicy::Error;
        assert!(apply_generate(tmp.path(), &block).is_err());
    }

    #[test]
    fn disabled_block_removes_its_own_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut block = gen("backend", "backend.tf", "terraform {}\n");
        apply_generate(tmp.path(), &block).unwrap();
        assert!(tmp.path().join("backend.tf").exists());

        block.disable = true;
        apply_generate(tmp.path(), &block).unwrap();
        assert!(!tmp.path().join("backend.tf").exists());
    }

    #[test]
    fn disabled_block_keeps_user_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("backend.tf"), "user content\n").unwrap();
        let mut block = gen("backend", "backend.tf", "terraform {}\n");
        block.disable = true;
        apply_generate(tmp.path(), &block).unwrap();
        assert!(tmp.path().join("backend.tf").exists());
    }

    #[test]
    fn prepare_copies_unit_files_with_filters() {
        let tmp = tempfile::tempdir().unwrap();
        let unit = tmp.path().join("app");
        fs::create_dir_all(&unit).unwrap();
        fs::write(unit.join("main.tf"), "resource {}\n").unwrap();
        fs::write(unit.join("notes.md"), "ignore\n").unwrap();
        fs::write(unit.join(".hidden.tfvars"), "x = 1\n").unwrap();

        let config = UnitConfig {
            terraform: Some(crate::config::TerraformConfig {
                include_in_copy: vec![".hidden.tfvars".to_string()],
                exclude_from_copy: vec!["*.md".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        };
        let rep = reporter();
        let opts =
            PrepareOptions { source_override: None, fetcher: &DefaultFetcher, reporter: &rep };
        let scratch = prepare(&unit, &config, &opts).unwrap();

        assert!(scratch.join("main.tf").is_file());
        assert!(scratch.join(".hidden.tfvars").is_file());
        assert!(!scratch.join("notes.md").exists());
    }

    #[test]
    fn prepare_copies_local_source_and_lock_file() {
        let tmp = tempfile::tempdir().unwrap();
        let module = tmp.path().join("modules/vpc");
        fs::create_dir_all(&module).unwrap();
        fs::write(module.join("main.tf"), "module content\n").unwrap();

        let unit = tmp.path().join("app");
        fs::create_dir_all(&unit).unwrap();
        fs::write(unit.join(LOCK_FILE), "lock\n").unwrap();

        let config = UnitConfig {
            terraform: Some(crate::config::TerraformConfig {
                source: Some("../modules/vpc".to_string()),
                copy_lock_file: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let rep = reporter();
        let opts =
            PrepareOptions { source_override: None, fetcher: &DefaultFetcher, reporter: &rep };
        let scratch = prepare(&unit, &config, &opts).unwrap();

        assert_eq!(fs::read_to_string(scratch.join("main.tf")).unwrap(), "module content\n");
        assert_eq!(fs::read_to_string(scratch.join(LOCK_FILE)).unwrap(), "lock\n");
    }

    #[test]
    fn remote_state_generate_writes_backend_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config_map = crate::value::OutputMap::new();
        config_map.insert("bucket".to_string(), Value::String("state-bucket".into()));
        let remote_state = RemoteStateConfig {
            backend: "s3".to_string(),
            config: config_map,
            disable_init: false,
            generate: Some(crate::config::RemoteStateGenerate {
                path: "backend.tf".into(),
                if_exists: IfExistsPolicy::OverwriteTerragrunt,
            }),
        };
        let block = remote_state_generate(&remote_state).unwrap();
        apply_generate(tmp.path(), &block).unwrap();
        let content = fs::read_to_string(tmp.path().join("backend.tf")).unwrap();
        assert!(content.contains("backend \"s3\""), "{content}");
        assert!(content.contains("bucket"), "{content}");
    }
}
