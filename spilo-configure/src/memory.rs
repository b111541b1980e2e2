//! Memory based connection sizing
//!
//! The usable memory is the smaller of the container limit (cgroup v1 or v2)
//! and the physical memory reported by the kernel.

use std::fs;
use std::path::Path;
use tracing::debug;

const CGROUP_V1_LIMIT: &str = "sys/fs/cgroup/memory/memory.limit_in_bytes";
const CGROUP_V2_LIMIT: &str = "sys/fs/cgroup/memory.max";
const MEMINFO: &str = "proc/meminfo";

/// Value used for a cgroup v2 limit of `max`.
const CGROUP_V2_UNBOUNDED_MB: u64 = 0x7FF_FFFF_FFFF;

const MIN_CONNECTIONS: u64 = 100;
const MAX_CONNECTIONS: u64 = 1000;
const MB_PER_CONNECTION: u64 = 30;

const BYTES_PER_MB: u64 = 1_048_576;

/// Usable memory in MB, reading the cgroup and meminfo files below `root`.
pub fn usable_memory_mb(root: &Path) -> u64 {
    let limit = container_limit_mb(root);
    let physical = physical_memory_mb(root);
    debug!(?limit, ?physical, "Memory limits");

    match (limit, physical) {
        (Some(l), Some(p)) => l.min(p),
        (Some(l), None) => l,
        (None, Some(p)) => p,
        (None, None) => u64::MAX,
    }
}

/// 1 connection per 30 MB, at least 100, at most 1000.
pub fn max_connections(memory_mb: u64) -> u64 {
    (memory_mb / MB_PER_CONNECTION).clamp(MIN_CONNECTIONS, MAX_CONNECTIONS)
}

fn container_limit_mb(root: &Path) -> Option<u64> {
    let v1 = root.join(CGROUP_V1_LIMIT);
    if v1.exists() {
        return fs::read_to_string(v1)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|bytes| bytes / BYTES_PER_MB);
    }

    let v2 = root.join(CGROUP_V2_LIMIT);
    if v2.exists() {
        let content = fs::read_to_string(v2).ok()?;
        return Some(
            content
                .trim()
                .parse::<u64>()
                .map(|bytes| bytes / BYTES_PER_MB)
                .unwrap_or(CGROUP_V2_UNBOUNDED_MB),
        );
    }

    None
}

fn physical_memory_mb(root: &Path) -> Option<u64> {
    let content = fs::read_to_string(root.join(MEMINFO)).ok()?;
    content
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_max_connections_clamps() {
        assert_eq!(max_connections(3000), 100);
        assert_eq!(max_connections(9000), 300);
        assert_eq!(max_connections(45000), 1000);
    }

    #[test]
    fn test_cgroup_v1_limit_below_physical() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), CGROUP_V1_LIMIT, "2147483648\n");
        write(dir.path(), MEMINFO, "MemTotal:       16384000 kB\nMemFree: 1 kB\n");
        assert_eq!(usable_memory_mb(dir.path()), 2048);
    }

    #[test]
    fn test_cgroup_v2_max_uses_physical() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), CGROUP_V2_LIMIT, "max\n");
        write(dir.path(), MEMINFO, "MemTotal:        9216000 kB\n");
        assert_eq!(usable_memory_mb(dir.path()), 9000);
        assert_eq!(max_connections(usable_memory_mb(dir.path())), 300);
    }

    #[test]
    fn test_no_limits_is_unbounded() {
        let dir = TempDir::new().unwrap();
        assert_eq!(usable_memory_mb(dir.path()), u64::MAX);
        assert_eq!(max_connections(u64::MAX), 1000);
    }
}
