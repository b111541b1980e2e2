//! File output policy and ownership

use anyhow::{Context, Result};
use nix::unistd::{chown, Gid, Uid, User};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{info, warn};

/// Account that owns generated files.
pub const POSTGRES_USER: &str = "postgres";

/// Numeric owner applied to generated files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: Uid,
    pub gid: Gid,
}

/// Writes files under the `--force` policy and hands them to the owner.
#[derive(Debug, Clone)]
pub struct FileWriter {
    force: bool,
    owner: Option<Owner>,
}

impl FileWriter {
    /// Writer owning files as the `postgres` user.
    ///
    /// Without such a user ownership changes are skipped.
    pub fn for_postgres(force: bool) -> Result<Self> {
        let owner = User::from_name(POSTGRES_USER)
            .with_context(|| format!("Failed to look up user {}", POSTGRES_USER))?
            .map(|user| Owner {
                uid: user.uid,
                gid: user.gid,
            });
        if owner.is_none() {
            warn!(user = POSTGRES_USER, "User not found, file ownership will not be changed");
        }
        Ok(Self { force, owner })
    }

    /// Writer that never changes ownership.
    pub fn unowned(force: bool) -> Self {
        Self { force, owner: None }
    }

    pub fn force(&self) -> bool {
        self.force
    }

    /// Write `content` unless the file exists and `--force` is absent.
    ///
    /// Returns whether the file was written.
    pub fn write(&self, content: &str, path: &Path) -> Result<bool> {
        if !self.force && path.exists() {
            warn!(
                path = %path.display(),
                "File already exists, not overwriting. (Use option --force if necessary)"
            );
            return Ok(false);
        }
        self.write_always(content, path)?;
        Ok(true)
    }

    /// Write `content`, replacing any existing file.
    pub fn write_always(&self, content: &str, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        info!(path = %path.display(), "Writing to file");
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Hand `path` to the owner, keeping its group.
    pub fn chown(&self, path: &Path) -> Result<()> {
        self.change_owner(path, false)
    }

    /// Hand `path` to the owner and the owner's group.
    pub fn chown_with_group(&self, path: &Path) -> Result<()> {
        self.change_owner(path, true)
    }

    fn change_owner(&self, path: &Path, with_group: bool) -> Result<()> {
        let Some(owner) = self.owner else {
            return Ok(());
        };
        let group = with_group.then_some(owner.gid);
        chown(path, Some(owner.uid), group)
            .with_context(|| format!("Failed to change owner of {}", path.display()))
    }
}

/// Restrict `path` to its owner.
pub fn make_private(path: &Path) -> Result<()> {
    set_mode(path, 0o600)
}

pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set mode {:o} on {}", mode, path.display()))
}

/// Create `path` with `mode` when it does not exist yet.
///
/// Returns whether the directory was created.
pub fn create_dir_with_mode(path: &Path, mode: u32) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory {}", path.display()))?;
    set_mode(path, mode)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_existing_file_needs_force() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("file");

        assert!(FileWriter::unowned(false).write("one", &path).unwrap());
        assert!(!FileWriter::unowned(false).write("two", &path).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "one");

        assert!(FileWriter::unowned(true).write("three", &path).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "three");
    }

    #[test]
    fn test_write_always_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("TMPDIR");
        let writer = FileWriter::unowned(false);
        writer.write_always("a", &path).unwrap();
        writer.write_always("b", &path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "b");
    }

    #[test]
    fn test_create_dir_with_sticky_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tmp");
        assert!(create_dir_with_mode(&path, 0o1777).unwrap());
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o1777);
        assert!(!create_dir_with_mode(&path, 0o700).unwrap());
    }

    #[test]
    fn test_unowned_chown_is_noop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, "x").unwrap();
        FileWriter::unowned(false).chown(&path).unwrap();
        make_private(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);
    }
}
