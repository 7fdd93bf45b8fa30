//! Utility functions

use crate::error::{Result, RunError};
use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    fs,
    path::{Component, Path, PathBuf},
    time::Duration,
};
use walkdir::WalkDir;

/// Directory names that are never part of a unit's own sources.
pub const IGNORED_DIRS: &[&str] = &[".git", ".terraform", crate::workdir::SCRATCH_DIR];

/// A regex matching error messages that are worth retrying, typically produced
/// by source fetches and remote state backends under network pressure.
pub static RE_TRANSIENT_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(connection reset|connection refused|timeout|timed out|temporarily unavailable|could not download|could not resolve|tls handshake|429 too many requests|rate limit)",
    )
    .unwrap()
});

/// Returns the path to the current directory.
pub fn current_dir() -> Result<PathBuf> {
    std::env::current_dir().map_err(|err| RunError::io(err, "<current dir>"))
}

/// Canonicalize the path, platform-agnostic.
///
/// On windows this will ensure the path is a valid windows path and does not
/// carry the extended length prefix, same as the engine expects.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    dunce::canonicalize(path).map_err(|err| RunError::io(err, path))
}

/// Canonicalize the path, returning it unchanged if canonicalization fails,
/// e.g. when the path does not exist yet.
pub fn canonicalized(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    canonicalize(&path).unwrap_or(path)
}

pub fn read_to_string(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path).map_err(|err| RunError::io(err, path))
}

pub fn write(path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    fs::write(path, contents).map_err(|err| RunError::io(err, path))
}

pub fn create_dir_all(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    fs::create_dir_all(path).map_err(|err| RunError::io(err, path))
}

pub fn remove_file(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    fs::remove_file(path).map_err(|err| RunError::io(err, path))
}

/// Rebases `path` onto `base` lexically, yielding a relative path.
///
/// `rebase_path("/ws", "/ws/app/main.tf")` returns `app/main.tf`;
/// paths outside of `base` are reached through `..` components.
pub fn rebase_path(base: impl AsRef<Path>, path: impl AsRef<Path>) -> PathBuf {
    let mut base_components = base.as_ref().components();
    let mut path_components = path.as_ref().components();

    let mut new_path = PathBuf::new();

    while let Some(path_component) = path_components.next() {
        let base_component = base_components.next();

        if Some(path_component) != base_component {
            if base_component.is_some() {
                new_path.extend(
                    std::iter::repeat(Component::ParentDir).take(base_components.count() + 1),
                );
            }

            new_path.push(path_component);
            new_path.extend(path_components);

            break;
        }
    }

    new_path
}

/// Hex digest of the canonical unit path, used to derive deterministic
/// scratch directory names so repeated runs reuse the same directory.
pub fn path_digest(path: &Path) -> String {
    let mut hasher = Md5::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Walks up from `start`, returning the first ancestor directory containing
/// `filename`, excluding `start` itself.
pub fn find_in_parent_folders(start: &Path, filename: &str) -> Option<PathBuf> {
    let mut dir = start.parent();
    while let Some(d) = dir {
        let candidate = d.join(filename);
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = d.parent();
    }
    None
}

/// Returns all directories under `root` that contain a config file named
/// `config_filename`, in sorted order. Scratch and VCS directories are skipped.
pub fn discover_unit_dirs(root: &Path, config_filename: &str) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            !e.file_name().to_str().map(|s| IGNORED_DIRS.contains(&s)).unwrap_or(false)
        })
    {
        let entry = entry.map_err(|err| RunError::msg(format!("walking {}: {err}", root.display())))?;
        if entry.file_type().is_file() && entry.file_name() == config_filename {
            if let Some(parent) = entry.path().parent() {
                dirs.push(canonicalized(parent));
            }
        }
    }
    dirs.sort();
    dirs.dedup();
    Ok(dirs)
}

/// Whether an error message looks like a transient failure worth retrying.
pub fn is_transient(message: &str) -> bool {
    RE_TRANSIENT_ERROR.is_match(message)
}

/// Retries `f` up to `attempts` times on transient errors, backing off
/// linearly from `base_delay`.
pub fn retry_transient<T>(
    attempts: usize,
    base_delay: Duration,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f() {
            Ok(v) => return Ok(v),
            Err(err) if attempt < attempts && is_transient(&err.to_string()) => {
                warn!("transient failure (attempt {attempt}/{attempts}): {err}");
                std::thread::sleep(base_delay * attempt as u32);
            }
            Err(err) => return Err(err),
        }
    }
}
