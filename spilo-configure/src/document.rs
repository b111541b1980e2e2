//! Final configuration document assembly
//!
//! Turns the rendered template into the document written for Patroni:
//! DCS overlay, user override merge, local etcd fallback, binary directory
//! resolution, extension post-processing and the replication `pg_hba` entry.

use crate::dcs::{dcs_config, Dcs};
use crate::error::{ConfigureError, Result};
use crate::extensions::{ExtensionContext, ExtensionTable};
use crate::merge::merge;
use crate::paths;
use crate::placeholders::Placeholders;
use crate::provider::Provider;
use crate::version;
use common::Environment;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Variables holding a user supplied configuration, in precedence order.
pub const OVERRIDE_VARS: [&str; 2] = ["SPILO_CONFIGURATION", "PATRONI_CONFIGURATION"];

/// Address of the etcd started next to PostgreSQL on a local provider.
pub const LOCAL_ETCD_HOST: &str = "127.0.0.1:2379";

/// The assembled configuration plus what the run learned on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub config: Value,
    /// The local etcd runit service is required.
    pub local_etcd: bool,
    /// Major version reported by the selected binaries.
    pub pg_version: String,
}

/// Assemble the final document from the rendered template.
///
/// Sets the `PGVERSION` placeholder from the selected binaries.
pub async fn assemble(
    rendered: Value,
    placeholders: &mut Placeholders,
    env: &Environment,
    provider: Provider,
    lib_dir: &str,
) -> Result<Document> {
    let config = overlay_dcs(rendered, dcs_config(placeholders, env)?)?;
    let user = user_override(env)?;
    let mut config = merge(Value::Mapping(user.clone()), config);

    let local_etcd = apply_local_etcd(&mut config, provider);
    let bin_dir = resolve_bin_dir(&mut config, env, lib_dir).await?;

    let pg_version = version::binary_version(Some(&bin_dir)).await?;
    info!(version = %pg_version, bin_dir = %bin_dir, "Using PostgreSQL binaries");
    placeholders.set("PGVERSION", pg_version.as_str());

    let table = ExtensionTable::from_env(env);
    apply_extensions(&mut config, &user, version::numeric(&pg_version)?, &table)?;
    ensure_replication_hba(&mut config);

    Ok(Document {
        config,
        local_etcd,
        pg_version,
    })
}

/// Replace top-level keys of the rendered document with the DCS section.
pub fn overlay_dcs(rendered: Value, dcs: Mapping) -> Result<Value> {
    let Value::Mapping(mut config) = rendered else {
        return Err(ConfigureError::TypeMismatch {
            key: "rendered configuration".to_string(),
            expected: "mapping",
        });
    };
    for (key, value) in dcs {
        config.insert(key, value);
    }
    Ok(Value::Mapping(config))
}

/// The user override document.
///
/// The first non-empty variable of [`OVERRIDE_VARS`] is parsed; null or
/// absent yields an empty mapping, any other non-mapping is an error.
pub fn user_override(env: &Environment) -> Result<Mapping> {
    let Some((var, text)) = OVERRIDE_VARS
        .iter()
        .find_map(|var| env.non_empty(var).map(|text| (*var, text)))
    else {
        return Ok(Mapping::new());
    };

    let value: Value = serde_yaml::from_str(text).map_err(|source| ConfigureError::Yaml {
        what: var.to_string(),
        source,
    })?;
    match value {
        Value::Null => Ok(Mapping::new()),
        Value::Mapping(mapping) => {
            debug!(var, keys = mapping.len(), "Loaded configuration override");
            Ok(mapping)
        }
        other => Err(ConfigureError::OverrideNotMapping {
            var: var.to_string(),
            found: yaml_kind(&other),
        }),
    }
}

fn yaml_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

/// Point a local provider without any DCS at the bundled etcd.
///
/// Returns whether the etcd service is needed.
pub fn apply_local_etcd(config: &mut Value, provider: Provider) -> bool {
    if provider != Provider::Local {
        return false;
    }
    let Some(mapping) = config.as_mapping_mut() else {
        return false;
    };
    let has_dcs = mapping
        .keys()
        .filter_map(Value::as_str)
        .any(Dcs::is_section);
    if has_dcs {
        return false;
    }

    let mut etcd = Mapping::new();
    etcd.insert(Value::from("host"), Value::from(LOCAL_ETCD_HOST));
    mapping.insert(Value::from("etcd"), Value::Mapping(etcd));
    true
}

/// Pick `postgresql.bin_dir` and return it.
///
/// An installed version named by `PG_VERSION` in the data directory wins,
/// then a configured `bin_dir`, then an installed `PGVERSION`, then the
/// version of the `postgres` binary on `PATH`.
pub async fn resolve_bin_dir(config: &mut Value, env: &Environment, lib_dir: &str) -> Result<String> {
    let postgresql = section_mut(config, "postgresql")?;

    let data_dir = postgresql
        .get("data_dir")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if let Some(version) = data_dir_version(&data_dir) {
        if version::is_installed(lib_dir, &version) {
            debug!(version = %version, "Using version of existing data directory");
            postgresql.insert(Value::from("bin_dir"), Value::from(paths::bin_dir(lib_dir, &version)));
        }
    }

    if let Some(bin_dir) = postgresql
        .get("bin_dir")
        .and_then(Value::as_str)
        .filter(|dir| !dir.is_empty())
    {
        return Ok(bin_dir.to_string());
    }

    let version = match env.non_empty("PGVERSION") {
        Some(version) if version::is_installed(lib_dir, version) => version.to_string(),
        _ => version::binary_version(None).await?,
    };
    let bin_dir = paths::bin_dir(lib_dir, &version);
    postgresql.insert(Value::from("bin_dir"), Value::from(bin_dir.as_str()));
    Ok(bin_dir)
}

fn data_dir_version(data_dir: &str) -> Option<String> {
    if data_dir.is_empty() {
        return None;
    }
    let path = Path::new(data_dir).join("PG_VERSION");
    match fs::read_to_string(&path) {
        Ok(content) => Some(content.trim().to_string()),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No PG_VERSION file");
            None
        }
    }
}

/// Filter the preload and allowlist parameters for `version`.
///
/// A parameter set by the user override is left untouched.
pub fn apply_extensions(
    config: &mut Value,
    user: &Mapping,
    version: f64,
    table: &ExtensionTable,
) -> Result<()> {
    let user_parameters = user
        .get("postgresql")
        .and_then(|p| p.get("parameters"))
        .and_then(Value::as_mapping);
    let parameters = section_mut(config, "postgresql")?
        .get_mut("parameters")
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| ConfigureError::TypeMismatch {
            key: "postgresql.parameters".to_string(),
            expected: "mapping",
        })?;

    for (key, context) in [
        ("shared_preload_libraries", ExtensionContext::Preload),
        ("extwlist.extensions", ExtensionContext::Allowlist),
    ] {
        if user_parameters.is_some_and(|p| p.contains_key(key)) {
            debug!(parameter = key, "Keeping user supplied extensions");
            continue;
        }
        let current = parameters.get(key).and_then(Value::as_str).unwrap_or_default();
        let updated = table.append_extensions(current, version, context);
        parameters.insert(Value::from(key), Value::from(updated));
    }
    Ok(())
}

/// Prepend a replication rule to `bootstrap.pg_hba` when it has none.
pub fn ensure_replication_hba(config: &mut Value) {
    let username = config["postgresql"]["authentication"]["replication"]["username"]
        .as_str()
        .map(str::to_string);
    let Some(hba) = config
        .get_mut("bootstrap")
        .and_then(|b| b.get_mut("pg_hba"))
        .and_then(Value::as_sequence_mut)
    else {
        return;
    };

    let has_replication = hba
        .iter()
        .any(|entry| entry.as_str().is_some_and(|e| e.contains("replication")));
    if has_replication {
        return;
    }
    match username {
        Some(user) => hba.insert(0, Value::from(format!("hostssl replication {} all md5", user))),
        None => warn!("bootstrap.pg_hba has no replication entry and no replication user is configured"),
    }
}

fn section_mut<'a>(config: &'a mut Value, key: &str) -> Result<&'a mut Mapping> {
    config
        .get_mut(key)
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| ConfigureError::TypeMismatch {
            key: key.to_string(),
            expected: "mapping",
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    fn install(lib: &TempDir, version: &str) {
        let bin = lib.path().join(version).join("bin");
        fs::create_dir_all(&bin).unwrap();
        let binary = bin.join("postgres");
        File::create(&binary).unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_override_precedence_and_shapes() {
        assert!(user_override(&Environment::default()).unwrap().is_empty());

        let env = Environment::from_pairs([
            ("SPILO_CONFIGURATION", ""),
            ("PATRONI_CONFIGURATION", "ttl: 20"),
        ]);
        assert_eq!(user_override(&env).unwrap()["ttl"], Value::from(20));

        let env = Environment::from_pairs([("SPILO_CONFIGURATION", "~")]);
        assert!(user_override(&env).unwrap().is_empty());
    }

    #[test]
    fn test_override_must_be_a_mapping() {
        let env = Environment::from_pairs([("SPILO_CONFIGURATION", "[a, b]")]);
        match user_override(&env) {
            Err(ConfigureError::OverrideNotMapping { var, found }) => {
                assert_eq!(var, "SPILO_CONFIGURATION");
                assert_eq!(found, "sequence");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_user_values_win_over_rendered() {
        let rendered = yaml("postgresql:\n  parameters: {max_connections: 100}\n  pg_hba: [a]\nttl: 30\n");
        let env = Environment::from_pairs([(
            "SPILO_CONFIGURATION",
            "postgresql: {parameters: {max_connections: 7}, pg_hba: [b]}",
        )]);
        let user = user_override(&env).unwrap();
        let merged = merge(Value::Mapping(user), rendered);
        assert_eq!(merged["postgresql"]["parameters"]["max_connections"], Value::from(7));
        assert_eq!(merged["postgresql"]["pg_hba"], yaml("[b]"));
        assert_eq!(merged["ttl"], Value::from(30));
    }

    #[test]
    fn test_dcs_overlay_replaces_keys() {
        let rendered = yaml("scope: s\netcd: {host: old}\n");
        let dcs: Mapping = serde_yaml::from_str("etcd: {hosts: [a]}\n").unwrap();
        let config = overlay_dcs(rendered, dcs).unwrap();
        assert_eq!(config, yaml("scope: s\netcd: {hosts: [a]}\n"));
        assert!(overlay_dcs(yaml("[1]"), Mapping::new()).is_err());
    }

    #[test]
    fn test_local_etcd_only_without_dcs() {
        let mut config = yaml("scope: s\n");
        assert!(apply_local_etcd(&mut config, Provider::Local));
        assert_eq!(config["etcd"]["host"], Value::from(LOCAL_ETCD_HOST));

        let mut config = yaml("zookeeper: {hosts: [z]}\n");
        assert!(!apply_local_etcd(&mut config, Provider::Local));
        assert!(config.get("etcd").is_none());

        let mut config = yaml("scope: s\n");
        assert!(!apply_local_etcd(&mut config, Provider::Aws));
    }

    #[tokio::test]
    async fn test_data_dir_version_wins() {
        let lib = TempDir::new().unwrap();
        install(&lib, "14");
        let data = TempDir::new().unwrap();
        fs::write(data.path().join("PG_VERSION"), "14\n").unwrap();

        let lib_dir = lib.path().to_str().unwrap();
        let mut config = yaml(&format!(
            "postgresql: {{data_dir: {}, bin_dir: /custom/bin}}\n",
            data.path().display()
        ));
        let bin_dir = resolve_bin_dir(&mut config, &Environment::default(), lib_dir)
            .await
            .unwrap();
        assert_eq!(bin_dir, paths::bin_dir(lib_dir, "14"));
        assert_eq!(config["postgresql"]["bin_dir"], Value::from(bin_dir));
    }

    #[tokio::test]
    async fn test_configured_bin_dir_then_pgversion() {
        let lib = TempDir::new().unwrap();
        install(&lib, "15");
        let lib_dir = lib.path().to_str().unwrap();

        let mut config = yaml("postgresql: {data_dir: /nonexistent, bin_dir: /custom/bin}\n");
        let env = Environment::from_pairs([("PGVERSION", "15")]);
        assert_eq!(
            resolve_bin_dir(&mut config, &env, lib_dir).await.unwrap(),
            "/custom/bin"
        );

        let mut config = yaml("postgresql: {data_dir: /nonexistent}\n");
        assert_eq!(
            resolve_bin_dir(&mut config, &env, lib_dir).await.unwrap(),
            paths::bin_dir(lib_dir, "15")
        );
    }

    #[test]
    fn test_extensions_respect_user_override() {
        let mut config = yaml(
            "postgresql:\n  parameters:\n    shared_preload_libraries: 'bg_mon,pg_cron'\n    extwlist.extensions: 'citext'\n",
        );
        let user: Mapping =
            serde_yaml::from_str("postgresql: {parameters: {extwlist.extensions: mine}}").unwrap();
        apply_extensions(&mut config, &user, 14.0, &ExtensionTable::new(false)).unwrap();

        let parameters = &config["postgresql"]["parameters"];
        assert_eq!(
            parameters["shared_preload_libraries"],
            Value::from("bg_mon,pg_cron,columnar,pg_stat_kcache")
        );
        assert_eq!(parameters["extwlist.extensions"], Value::from("citext"));
    }

    #[test]
    fn test_replication_hba_is_prepended() {
        let mut config = yaml(
            "bootstrap: {pg_hba: [local all all trust]}\npostgresql: {authentication: {replication: {username: standby}}}\n",
        );
        ensure_replication_hba(&mut config);
        assert_eq!(
            config["bootstrap"]["pg_hba"],
            yaml("['hostssl replication standby all md5', local all all trust]")
        );

        let before = config.clone();
        ensure_replication_hba(&mut config);
        assert_eq!(config, before);
    }

    #[test]
    fn test_no_bootstrap_hba_is_left_alone() {
        let mut config = yaml("bootstrap: {dcs: {}}\n");
        let before = config.clone();
        ensure_replication_hba(&mut config);
        assert_eq!(config, before);
    }
}
