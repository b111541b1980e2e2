//! Storage backend identification and backup tool selection
//!
//! A storage backend is identified per namespace prefix (primary, `CLONE_`,
//! `STANDBY_`) by probing a fixed set of variables for each family in a
//! fixed order. The first family with enough information wins.

use super::{PlaceholderValue, Placeholders};
use crate::paths;
use std::fmt;

/// Variables whose presence enables restores with the new backup tool.
pub const AUTO_ENABLE_WALG_RESTORE: &[&str] = &[
    "WAL_S3_BUCKET",
    "WALE_S3_PREFIX",
    "WALG_S3_PREFIX",
    "WALG_AZ_PREFIX",
    "WALG_SSH_PREFIX",
];

/// Variables that all must be set for SSH based backups.
pub const WALG_SSH_NAMES: &[&str] = &[
    "WALG_SSH_PREFIX",
    "SSH_PRIVATE_KEY_PATH",
    "SSH_USERNAME",
    "SSH_PORT",
];

/// Google Cloud Storage variables that also mark the new tool as usable.
const WALG_GS_NAMES: &[&str] = &["WAL_GS_BUCKET", "WALE_GS_PREFIX", "WALG_GS_PREFIX"];

/// Namespace prefix for storage variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoragePrefix {
    Primary,
    Clone,
    Standby,
}

impl StoragePrefix {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "",
            Self::Clone => "CLONE_",
            Self::Standby => "STANDBY_",
        }
    }

    /// Prefixed variable name.
    pub fn key(self, name: &str) -> String {
        format!("{}{}", self.as_str(), name)
    }

    /// Name of the envdir directory for this prefix (`env`, `env-clone-<scope>`).
    pub fn env_dir_name(self, scope: Option<&str>) -> String {
        let mut name = String::from("env");
        if let Some(tag) = self.as_str().strip_suffix('_') {
            name.push('-');
            name.push_str(&tag.to_lowercase());
        }
        if let Some(scope) = scope.filter(|s| !s.is_empty()) {
            name.push('-');
            name.push_str(scope);
        }
        name
    }
}

/// Object storage families supported for WAL archiving and base backups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    S3,
    Gcs,
    Azure,
    Swift,
    Ssh,
}

/// Variables describing one storage family.
#[derive(Debug)]
pub struct BackendSchema {
    /// Prefix variable written to the envdir
    pub prefix_var: &'static str,
    /// Alternate spellings copied into `prefix_var` when it is empty
    pub alias_prefix_vars: &'static [&'static str],
    /// Prefix variable read by the new backup tool
    pub new_tool_prefix_var: Option<&'static str>,
    pub bucket_vars: &'static [&'static str],
    pub scheme: &'static str,
}

const S3_SCHEMA: BackendSchema = BackendSchema {
    prefix_var: "WALE_S3_PREFIX",
    alias_prefix_vars: &[],
    new_tool_prefix_var: Some("WALG_S3_PREFIX"),
    bucket_vars: &["WAL_S3_BUCKET"],
    scheme: "s3",
};

const GCS_SCHEMA: BackendSchema = BackendSchema {
    prefix_var: "WALE_GS_PREFIX",
    alias_prefix_vars: &["WALE_GCS_PREFIX"],
    new_tool_prefix_var: Some("WALG_GS_PREFIX"),
    bucket_vars: &["WAL_GS_BUCKET", "WAL_GCS_BUCKET"],
    scheme: "gs",
};

const AZURE_SCHEMA: BackendSchema = BackendSchema {
    prefix_var: "WALG_AZ_PREFIX",
    alias_prefix_vars: &["WALE_AZ_PREFIX"],
    new_tool_prefix_var: None,
    bucket_vars: &["WAL_AZ_BUCKET"],
    scheme: "azure",
};

const SWIFT_SCHEMA: BackendSchema = BackendSchema {
    prefix_var: "WALE_SWIFT_PREFIX",
    alias_prefix_vars: &[],
    new_tool_prefix_var: None,
    bucket_vars: &["WAL_SWIFT_BUCKET"],
    scheme: "swift",
};

const SSH_SCHEMA: BackendSchema = BackendSchema {
    prefix_var: "WALG_SSH_PREFIX",
    alias_prefix_vars: &[],
    new_tool_prefix_var: None,
    bucket_vars: &[],
    scheme: "ssh",
};

impl StorageBackend {
    /// Fixed probing order; first match wins.
    pub const PROBE_ORDER: [StorageBackend; 5] =
        [Self::S3, Self::Gcs, Self::Azure, Self::Swift, Self::Ssh];

    pub fn schema(self) -> &'static BackendSchema {
        match self {
            Self::S3 => &S3_SCHEMA,
            Self::Gcs => &GCS_SCHEMA,
            Self::Azure => &AZURE_SCHEMA,
            Self::Swift => &SWIFT_SCHEMA,
            Self::Ssh => &SSH_SCHEMA,
        }
    }

    /// Every prefix variable that identifies this family on its own.
    pub fn identifying_vars(self) -> impl Iterator<Item = &'static str> {
        let schema = self.schema();
        std::iter::once(schema.prefix_var)
            .chain(schema.alias_prefix_vars.iter().copied())
            .chain(schema.new_tool_prefix_var)
    }

    /// Identify the active family.
    ///
    /// `is_set` answers whether an unprefixed variable name holds a value.
    /// Bucket variables only count together with a scope.
    pub fn identify<F>(is_set: F, has_scope: bool) -> Option<Self>
    where
        F: Fn(&str) -> bool,
    {
        Self::PROBE_ORDER.into_iter().find(|backend| {
            backend.identifying_vars().any(&is_set)
                || has_scope && backend.schema().bucket_vars.iter().any(|v| is_set(v))
        })
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::S3 => "S3",
            Self::Gcs => "GCS",
            Self::Azure => "Azure",
            Self::Swift => "Swift",
            Self::Ssh => "SSH",
        };
        f.write_str(name)
    }
}

/// Identify the storage backend for `prefix` and record where its envdir lives.
///
/// On a match `<prefix>WALE_ENV_DIR` and `<prefix>WITH_WALE` are set.
pub fn identify_storage(placeholders: &mut Placeholders, prefix: StoragePrefix) -> Option<StorageBackend> {
    let scope_key = prefix.key("SCOPE");
    let backend = StorageBackend::identify(
        |name| placeholders.truthy(&prefix.key(name)),
        placeholders.truthy(&scope_key),
    )?;

    let scope = placeholders.non_empty(&scope_key).map(|s| s.into_owned());
    let rw_dir = placeholders.text_or_empty("RW_DIR");
    let env_dir = paths::join(
        &rw_dir,
        &["etc", "wal-e.d", &prefix.env_dir_name(scope.as_deref())],
    );
    placeholders.set(prefix.key("WALE_ENV_DIR"), env_dir);
    placeholders.set(prefix.key("WITH_WALE"), true);
    Some(backend)
}

/// Decide between the new and the legacy backup tool for `prefix`.
///
/// `USE_WALG_BACKUP` and `USE_WALG_RESTORE` resolve independently from an
/// explicit per-direction value or the shared `USE_WALG` default. Either is
/// only enabled when a storage variable the new tool understands is present;
/// disabled directions are stored as `false`.
pub fn select_backup_tool(placeholders: &mut Placeholders, prefix: StoragePrefix) {
    let supported = AUTO_ENABLE_WALG_RESTORE
        .iter()
        .chain(WALG_GS_NAMES)
        .any(|name| placeholders.truthy(&prefix.key(name)));

    let default = placeholders
        .get("USE_WALG")
        .cloned()
        .unwrap_or(PlaceholderValue::Bool(false));
    placeholders.set_default(prefix.key("USE_WALG"), default);

    let shared = placeholders.text_or_empty(&prefix.key("USE_WALG"));
    for name in ["USE_WALG_BACKUP", "USE_WALG_RESTORE"] {
        let key = prefix.key(name);
        let requested = placeholders
            .text(&key)
            .map(|v| v.to_lowercase())
            .unwrap_or_else(|| shared.to_lowercase());
        if requested == "true" && supported {
            placeholders.set(key, "true");
        } else {
            placeholders.set(key, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Environment;

    fn placeholders(pairs: &[(&str, &str)]) -> Placeholders {
        let mut p = Placeholders::from_env(&Environment::from_pairs(pairs.iter().copied()));
        p.set_default("RW_DIR", "/run");
        p
    }

    #[test]
    fn test_bucket_requires_scope() {
        let mut p = placeholders(&[("CLONE_WAL_S3_BUCKET", "bucket")]);
        assert_eq!(identify_storage(&mut p, StoragePrefix::Clone), None);
        assert!(!p.contains("CLONE_WITH_WALE"));

        let mut p = placeholders(&[("CLONE_WAL_S3_BUCKET", "bucket"), ("CLONE_SCOPE", "src")]);
        assert_eq!(identify_storage(&mut p, StoragePrefix::Clone), Some(StorageBackend::S3));
        assert!(p.truthy("CLONE_WITH_WALE"));
        assert_eq!(
            p.str("CLONE_WALE_ENV_DIR").unwrap(),
            "/run/etc/wal-e.d/env-clone-src"
        );
    }

    #[test]
    fn test_prefix_variable_identifies_without_scope() {
        let mut p = placeholders(&[("STANDBY_WALG_AZ_PREFIX", "azure://c/p")]);
        assert_eq!(
            identify_storage(&mut p, StoragePrefix::Standby),
            Some(StorageBackend::Azure)
        );
        assert_eq!(
            p.str("STANDBY_WALE_ENV_DIR").unwrap(),
            "/run/etc/wal-e.d/env-standby"
        );
    }

    #[test]
    fn test_probe_order_prefers_s3_over_gcs() {
        let is_set = |name: &str| matches!(name, "WALE_GS_PREFIX" | "WALG_S3_PREFIX");
        assert_eq!(StorageBackend::identify(is_set, false), Some(StorageBackend::S3));

        let is_set = |name: &str| matches!(name, "WAL_GCS_BUCKET" | "WAL_SWIFT_BUCKET");
        assert_eq!(StorageBackend::identify(is_set, true), Some(StorageBackend::Gcs));

        let is_set = |name: &str| matches!(name, "WALE_SWIFT_PREFIX" | "WALG_SSH_PREFIX");
        assert_eq!(StorageBackend::identify(is_set, false), Some(StorageBackend::Swift));
    }

    #[test]
    fn test_env_dir_names() {
        assert_eq!(StoragePrefix::Primary.env_dir_name(None), "env");
        assert_eq!(StoragePrefix::Clone.env_dir_name(Some("")), "env-clone");
        assert_eq!(
            StoragePrefix::Standby.env_dir_name(Some("main")),
            "env-standby-main"
        );
    }

    #[test]
    fn test_backup_tool_needs_supported_storage() {
        let mut p = placeholders(&[("USE_WALG", "true"), ("WAL_SWIFT_BUCKET", "b")]);
        select_backup_tool(&mut p, StoragePrefix::Primary);
        assert_eq!(p.get("USE_WALG_BACKUP"), Some(&PlaceholderValue::Bool(false)));
        assert_eq!(p.get("USE_WALG_RESTORE"), Some(&PlaceholderValue::Bool(false)));
    }

    #[test]
    fn test_backup_tool_directions_resolve_independently() {
        let mut p = placeholders(&[
            ("WAL_S3_BUCKET", "b"),
            ("USE_WALG_BACKUP", "TRUE"),
            ("USE_WALG_RESTORE", "false"),
        ]);
        select_backup_tool(&mut p, StoragePrefix::Primary);
        assert_eq!(p.str("USE_WALG_BACKUP").unwrap(), "true");
        assert_eq!(p.get("USE_WALG_RESTORE"), Some(&PlaceholderValue::Bool(false)));
    }

    #[test]
    fn test_backup_tool_shared_default_for_prefix() {
        let mut p = placeholders(&[("CLONE_WALG_GS_PREFIX", "gs://b/p"), ("USE_WALG", "true")]);
        select_backup_tool(&mut p, StoragePrefix::Clone);
        assert_eq!(p.str("CLONE_USE_WALG").unwrap(), "true");
        assert_eq!(p.str("CLONE_USE_WALG_BACKUP").unwrap(), "true");
        assert_eq!(p.str("CLONE_USE_WALG_RESTORE").unwrap(), "true");
    }
}
