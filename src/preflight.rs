//! Pre-flight capability checks run before any stage starts.

use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::{AppError, Result};

/// Resolve `tool` against the current `PATH`.
///
/// Names containing a path separator are checked as given.
#[must_use]
pub fn find_on_path(tool: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH").unwrap_or_default();
    find_in(tool, &path)
}

/// Resolve `tool` against the `PATH`-style list `search`.
#[must_use]
pub fn find_in(tool: &str, search: &OsStr) -> Option<PathBuf> {
    if tool.contains(std::path::MAIN_SEPARATOR) {
        let candidate = PathBuf::from(tool);
        return is_executable(&candidate).then_some(candidate);
    }
    env::split_paths(search)
        .map(|dir| dir.join(tool))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

/// Fail unless every tool in `tools` resolves on `PATH`.
///
/// # Errors
///
/// Returns `AppError::RequiredToolMissing` naming every missing tool.
pub fn check_required_tools(tools: &[String]) -> Result<()> {
    let missing: Vec<&str> = tools
        .iter()
        .filter(|tool| match find_on_path(tool) {
            Some(found) => {
                debug!(tool = tool.as_str(), path = %found.display(), "tool found");
                false
            }
            None => true,
        })
        .map(String::as_str)
        .collect();

    if missing.is_empty() {
        info!(count = tools.len(), "required tools present");
        Ok(())
    } else {
        Err(AppError::RequiredToolMissing(missing.join(", ")))
    }
}
