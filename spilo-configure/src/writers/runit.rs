//! runit service links

use crate::paths;
use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;
use tracing::{debug, info};

/// Enable service `name` by linking its definition into `$RW_DIR/service`.
///
/// Also creates `$RW_DIR/supervise/<name>`. An existing link is left alone.
pub fn link_service(rw_dir: &str, name: &str) -> Result<()> {
    let service_root = Path::new(rw_dir).join("service");
    let service_dir = service_root.join(name);
    if fs::symlink_metadata(&service_dir).is_ok() {
        debug!(service = name, "Service already linked");
        return Ok(());
    }

    fs::create_dir_all(&service_root)
        .with_context(|| format!("Failed to create {}", service_root.display()))?;
    let source = Path::new(paths::RUNIT_SERVICE_SOURCE).join(name);
    symlink(&source, &service_dir)
        .with_context(|| format!("Failed to link {} to {}", service_dir.display(), source.display()))?;

    let supervise = Path::new(rw_dir).join("supervise").join(name);
    fs::create_dir_all(&supervise)
        .with_context(|| format!("Failed to create {}", supervise.display()))?;

    info!(service = name, "Linked runit service");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_link_service_once() {
        let dir = TempDir::new().unwrap();
        let rw_dir = dir.path().to_str().unwrap();

        link_service(rw_dir, "patroni").unwrap();
        let link = dir.path().join("service").join("patroni");
        assert_eq!(
            fs::read_link(&link).unwrap(),
            Path::new("/etc/runit/runsvdir/default/patroni")
        );
        assert!(dir.path().join("supervise").join("patroni").is_dir());

        link_service(rw_dir, "patroni").unwrap();
    }
}
