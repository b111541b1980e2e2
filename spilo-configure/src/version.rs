//! PostgreSQL version detection

use crate::error::{ConfigureError, Result};
use crate::paths;
use common::command;
use regex::Regex;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::debug;

/// Parse `postgres --version` output into a major version.
///
/// Releases before 10 keep their minor part (`9.6`), later ones are major only.
pub fn parse_version(output: &str) -> Result<String> {
    let re = Regex::new(r"^\S+ \S+ (\d+)(?:\.(\d+))?")
        .map_err(|e| ConfigureError::Version(e.to_string()))?;
    let captures = re
        .captures(output.trim())
        .ok_or_else(|| ConfigureError::Version(format!("unexpected version output {:?}", output)))?;

    let major = &captures[1];
    let old_style = major.parse::<u32>().map(|m| m < 10).unwrap_or(false);
    match (old_style, captures.get(2)) {
        (true, Some(minor)) => Ok(format!("{}.{}", major, minor.as_str())),
        (true, None) => Err(ConfigureError::Version(format!(
            "version {} has no minor part",
            major
        ))),
        (false, _) => Ok(major.to_string()),
    }
}

/// Whether `<lib_dir>/<version>/bin/postgres` is an executable file.
pub fn is_installed(lib_dir: &str, version: &str) -> bool {
    if version.is_empty() || version.contains('/') {
        return false;
    }
    is_executable(&Path::new(&paths::bin_dir(lib_dir, version)).join("postgres"))
}

/// Ask `postgres --version` in `bin_dir`, or the one on `PATH` when `None`.
pub async fn binary_version(bin_dir: Option<&str>) -> Result<String> {
    let binary = match bin_dir.filter(|d| !d.is_empty()) {
        Some(dir) => paths::join(dir, &["postgres"]),
        None => "postgres".to_string(),
    };
    let output = command::run_checked(&binary, &["--version"])
        .await
        .map_err(|e| ConfigureError::Version(format!("{:#}", e)))?;
    let version = parse_version(&output)?;
    debug!(binary = %binary, version = %version, "Detected PostgreSQL version");
    Ok(version)
}

fn is_executable(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No postgres binary");
            false
        }
    }
}

/// Version string as a number for extension range checks.
pub fn numeric(version: &str) -> Result<f64> {
    version
        .parse()
        .map_err(|_| ConfigureError::Version(format!("{} is not numeric", version)))
}
