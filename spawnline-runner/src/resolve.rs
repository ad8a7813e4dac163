use spawnline_core::{Result, SpawnlineError};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Locate the executable named by `target`.
///
/// A path that exists as given (absolute, or relative to `cwd`) wins. Otherwise
/// each directory of `search_path` (the `PATH` variable when `None`) is searched
/// in order, first by executable name and then for any file whose stem matches.
pub fn resolve_target(target: &str, search_path: Option<&OsStr>, cwd: &Path) -> Result<PathBuf> {
    if target.is_empty() {
        return Err(SpawnlineError::InvalidConfiguration(
            "target path must not be empty".to_string(),
        ));
    }

    let literal = cwd.join(target);
    if literal.is_file() {
        return Ok(literal);
    }

    let search_path: Option<OsString> = search_path
        .map(OsStr::to_os_string)
        .or_else(|| std::env::var_os("PATH"));

    let Some(search_path) = search_path else {
        return Err(not_found(target));
    };

    if let Ok(found) = which::which_in(target, Some(&search_path), cwd) {
        debug!(target = %target, resolved = %found.display(), "Resolved target on search path");
        return Ok(found);
    }

    // Bare names only: a target with a directory part was already checked literally.
    if Path::new(target).components().count() == 1 {
        for dir in std::env::split_paths(&search_path) {
            if let Some(found) = find_by_stem(&dir, target) {
                debug!(target = %target, resolved = %found.display(), "Resolved target by file stem");
                return Ok(found);
            }
        }
    }

    Err(not_found(target))
}

fn find_by_stem(dir: &Path, stem: &str) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.file_stem() == Some(OsStr::new(stem)))
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

fn not_found(target: &str) -> SpawnlineError {
    SpawnlineError::FileNotFound {
        path: target.to_string(),
    }
}
