//! Well-known filesystem locations
//!
//! Provides consistent path resolution for the runtime-writable directory,
//! the Patroni configuration file and PostgreSQL installations.

use common::Environment;
use std::path::{Component, Path, PathBuf};

/// Default runtime-writable directory
pub const DEFAULT_RW_DIR: &str = "/run";

/// Root of installed PostgreSQL versions
pub const LIB_DIR: &str = "/usr/lib/postgresql";

/// Source directory of runit service definitions
pub const RUNIT_SERVICE_SOURCE: &str = "/etc/runit/runsvdir/default";

/// Unix socket directory used by PostgreSQL
pub const PG_SOCKET_DIR: &str = "/run/postgresql";

/// PAM configuration written for the oauth2 module
pub const PAM_POSTGRESQL: &str = "/etc/pam.d/postgresql";

/// Default PATH used in generated crontabs
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Get the runtime-writable directory from environment or default
pub fn rw_dir(env: &Environment) -> String {
    env.get_or("RW_DIR", DEFAULT_RW_DIR).to_string()
}

/// Get the Patroni configuration file path
pub fn patroni_config_file(rw_dir: &str) -> PathBuf {
    Path::new(rw_dir).join("postgres.yml")
}

/// Binary directory of a PostgreSQL major version under `lib_dir`
pub fn bin_dir(lib_dir: &str, version: &str) -> String {
    format!("{}/{}/bin", lib_dir.trim_end_matches('/'), version)
}

/// Join path segments onto a base, returning a `String`.
pub fn join(base: &str, parts: &[&str]) -> String {
    let mut path = PathBuf::from(base);
    for part in parts {
        path.push(part);
    }
    path.to_string_lossy().into_owned()
}

/// Lexically normalize a path, resolving `.` and `..` without touching disk.
pub fn normalize(path: &str) -> String {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push("..");
                }
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_resolves_parent() {
        assert_eq!(normalize("/home/postgres/pgroot/../tmp"), "/home/postgres/tmp");
        assert_eq!(normalize("/a/./b/"), "/a/b");
        assert_eq!(normalize("/.."), "/");
    }

    #[test]
    fn test_rw_dir_defaults() {
        assert_eq!(rw_dir(&Environment::default()), "/run");
        let env = Environment::from_pairs([("RW_DIR", "/tmp/rw")]);
        assert_eq!(patroni_config_file(&rw_dir(&env)), PathBuf::from("/tmp/rw/postgres.yml"));
    }

    #[test]
    fn test_bin_dir() {
        assert_eq!(bin_dir(LIB_DIR, "15"), "/usr/lib/postgresql/15/bin");
        assert_eq!(bin_dir("/opt/pg/", "9.6"), "/opt/pg/9.6/bin");
    }

    #[test]
    fn test_join_segments() {
        assert_eq!(join("/run", &["etc", "wal-e.d", "env"]), "/run/etc/wal-e.d/env");
    }
}
