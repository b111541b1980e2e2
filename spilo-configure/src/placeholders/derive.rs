//! Placeholder derivation pipeline
//!
//! Derivation runs as a fixed sequence of named stages over one mapping.
//! Each stage documents what it reads; later stages depend on earlier ones
//! (namespace before bucket scopes, backend identification before tool
//! selection, tool selection before the archive command).

use super::storage::{identify_storage, select_backup_tool, StorageBackend, StoragePrefix};
use super::storage::{AUTO_ENABLE_WALG_RESTORE, WALG_SSH_NAMES};
use super::{PlaceholderValue, Placeholders};
use crate::error::{ConfigureError, Result};
use crate::memory;
use crate::metadata::InstanceMetadata;
use crate::paths;
use crate::provider::Provider;
use crate::system::{self, SystemFacts};
use common::Environment;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Labels applied to Kubernetes objects when none are configured.
pub const KUBERNETES_DEFAULT_LABELS: &str = r#"{"application": "spilo"}"#;

/// Variables that enable WAL archiving when any of them is set.
const ARCHIVE_ONLY_NAMES: &[&str] = &[
    "WAL_SWIFT_BUCKET",
    "WALE_SWIFT_PREFIX",
    "WAL_GCS_BUCKET",
    "WAL_GS_BUCKET",
    "WALE_GS_PREFIX",
    "WALG_GS_PREFIX",
];

const MAX_WALG_CONCURRENCY: usize = 10;

/// Everything derivation reads besides the mapping itself.
#[derive(Debug, Clone)]
pub struct DerivationInput<'a> {
    pub env: &'a Environment,
    pub provider: Provider,
    pub instance: InstanceMetadata,
    pub system: &'a SystemFacts,
}

impl DerivationInput<'_> {
    fn orchestrated(&self) -> bool {
        system::is_orchestrated(self.env)
    }
}

type Stage = fn(&mut Placeholders, &DerivationInput<'_>) -> Result<()>;

/// Ordered derivation stages.
const STAGES: &[(&str, Stage)] = &[
    ("defaults", apply_defaults),
    ("clone-and-standby", resolve_clone_and_standby),
    ("provider-callback", select_provider_callback),
    ("backup-tool", resolve_backup_tool),
    ("archiving", derive_archiving),
    ("connection-sizing", size_connections),
    ("instance", apply_instance_metadata),
    ("ssl-paths", derive_ssl_paths),
];

/// Build the complete placeholder mapping for one run.
pub fn derive_placeholders(input: &DerivationInput<'_>) -> Result<Placeholders> {
    let mut placeholders = Placeholders::from_env(input.env);
    for (name, stage) in STAGES {
        debug!(stage = name, "Deriving placeholders");
        stage(&mut placeholders, input)?;
    }
    Ok(placeholders)
}

/// Set-if-absent defaults for ports, paths, credentials and schedules.
///
/// Reads: environment, home directory, CPU count, orchestration mode.
fn apply_defaults(p: &mut Placeholders, input: &DerivationInput<'_>) -> Result<()> {
    p.set_default("PGHOME", input.system.home_dir.as_str());
    p.set_default("APIPORT", "8008");
    p.set_default("BACKUP_SCHEDULE", "0 1 * * *");
    p.set_default("BACKUP_NUM_TO_RETAIN", "5");
    p.set_default("CRONTAB", "[]");

    let pgroot = paths::join(&p.require_text("PGHOME")?, &["pgroot"]);
    p.set_default("PGROOT", pgroot);
    let pgroot = p.require_text("PGROOT")?;
    let tmpdir = paths::normalize(&paths::join(&pgroot, &["..", "tmp"]));
    p.set_default("WALE_TMPDIR", tmpdir.as_str());
    p.set_default("PGDATA", paths::join(&pgroot, &["pgdata"]));

    p.set_default("HUMAN_ROLE", "zalandos");
    p.set_default("PGUSER_STANDBY", "standby");
    p.set_default("PGPASSWORD_STANDBY", "standby");
    let use_admin = p.contains("PGPASSWORD_ADMIN");
    p.set_default("USE_ADMIN", use_admin);
    p.set_default("PGUSER_ADMIN", "admin");
    p.set_default("PGPASSWORD_ADMIN", "cola");
    p.set_default("PGUSER_SUPERUSER", "postgres");
    p.set_default("PGPASSWORD_SUPERUSER", "zalando");
    p.set_default("ALLOW_NOSSL", "");
    p.set_default("BGMON_LISTEN_IP", "0.0.0.0");
    p.set_default("PGPORT", "5432");
    p.set_default("SCOPE", "dummy");
    p.set_default("RW_DIR", paths::DEFAULT_RW_DIR);
    let rw_dir = p.require_text("RW_DIR")?;

    p.set_default("SSL_TEST_RELOAD", input.env.contains("SSL_PRIVATE_KEY_FILE"));
    p.set_default("SSL_CA_FILE", "");
    p.set_default("SSL_CRL_FILE", "");
    p.set_default("SSL_CERTIFICATE_FILE", paths::join(&rw_dir, &["certs", "server.crt"]));
    p.set_default("SSL_PRIVATE_KEY_FILE", paths::join(&rw_dir, &["certs", "server.key"]));
    p.set_default("SSL_RESTAPI_CA_FILE", "");
    p.set_default("SSL_RESTAPI_CERTIFICATE_FILE", "");
    p.set_default("SSL_RESTAPI_PRIVATE_KEY_FILE", "");
    p.set_default("WALE_BACKUP_THRESHOLD_MEGABYTES", 102400);
    p.set_default("WALE_BACKUP_THRESHOLD_PERCENTAGE", 30);
    p.set_default("INITDB_LOCALE", "en_US");
    p.set_default("CLONE_TARGET_TIMELINE", "latest");

    // only a Kubernetes DCS derives the namespace, other DCS keep their base path
    let namespace = if input.orchestrated() && p.truthy("DCS_ENABLE_KUBERNETES_API") {
        input.env.get_or("POD_NAMESPACE", "default").to_string()
    } else {
        String::new()
    };
    p.set_default("NAMESPACE", namespace);
    let scope_prefix = bucket_scope_prefix(&p.text_or_empty("NAMESPACE"));
    p.set_default("WAL_BUCKET_SCOPE_PREFIX", scope_prefix.as_str());
    p.set_default("WAL_BUCKET_SCOPE_SUFFIX", "");
    p.set_default("WAL_RESTORE_TIMEOUT", "0");
    p.set_default("WALE_ENV_DIR", paths::join(&rw_dir, &["etc", "wal-e.d", "env"]));
    p.set_default("USE_WALE", false);

    let concurrency = input.system.cpu_count.clamp(1, MAX_WALG_CONCURRENCY).to_string();
    p.set_default("WALG_DOWNLOAD_CONCURRENCY", concurrency.as_str());
    p.set_default("WALG_UPLOAD_CONCURRENCY", concurrency);

    p.set_default("PAM_OAUTH2", "");
    p.set_default("CALLBACK_SCRIPT", "");
    p.set_default("DCS_ENABLE_KUBERNETES_API", "");
    p.set_default("KUBERNETES_ROLE_LABEL", "spilo-role");
    p.set_default("KUBERNETES_SCOPE_LABEL", "version");
    p.set_default("KUBERNETES_LABELS", KUBERNETES_DEFAULT_LABELS);
    p.set_default("KUBERNETES_USE_CONFIGMAPS", "");
    p.set_default("KUBERNETES_BYPASS_API_SERVICE", "true");
    p.set_default("USE_PAUSE_AT_RECOVERY_TARGET", false);
    p.set_default("CLONE_METHOD", "");
    p.set_default("CLONE_WITH_WALE", "");
    p.set_default("CLONE_WITH_BASEBACKUP", "");
    p.set_default("CLONE_TARGET_TIME", "");
    p.set_default("CLONE_TARGET_INCLUSIVE", true);

    p.set_default("LOG_SHIP_SCHEDULE", "1 0 * * *");
    p.set_default("LOG_S3_BUCKET", "");
    p.set_default("LOG_TMPDIR", tmpdir);
    p.set_default("LOG_BUCKET_SCOPE_SUFFIX", "");
    p.set_default("LOG_BUCKET_SCOPE_PREFIX", scope_prefix);
    p.set_default("LOG_ENV_DIR", paths::join(&rw_dir, &["etc", "log.d", "env"]));
    p.set_default("PGLOG", paths::join(&pgroot, &["pg_log"]));
    p.set_default("PATH", paths::DEFAULT_PATH);
    Ok(())
}

/// `<namespace>-` for any namespace other than `default` or empty.
fn bucket_scope_prefix(namespace: &str) -> String {
    match namespace {
        "" | "default" => String::new(),
        ns => format!("{}-", ns),
    }
}

/// Clone method and standby cluster resolution.
///
/// Reads: `CLONE_METHOD`, `CLONE_*`/`STANDBY_*` storage variables, `PGHOME`.
/// A clone method lacking its inputs stays inactive with a warning.
fn resolve_clone_and_standby(p: &mut Placeholders, _: &DerivationInput<'_>) -> Result<()> {
    match p.text_or_empty("CLONE_METHOD").as_str() {
        "CLONE_WITH_WALE" => match identify_storage(p, StoragePrefix::Clone) {
            None => warn!(
                "Cloning with WAL-E is only possible when CLONE_WALE_*_PREFIX \
                 or CLONE_WALG_*_PREFIX or CLONE_WAL_*_BUCKET and CLONE_SCOPE are set."
            ),
            Some(StorageBackend::S3) => p.set_default("CLONE_USE_WALG", "true"),
            Some(backend) => debug!(%backend, "Cloning from archive"),
        },
        "CLONE_WITH_BASEBACKUP" => {
            let complete = ["CLONE_SCOPE", "CLONE_HOST", "CLONE_USER", "CLONE_PASSWORD"]
                .iter()
                .all(|name| p.truthy(name));
            if complete {
                let scope = p.require_text("CLONE_SCOPE")?;
                let pgpass = paths::join(&p.require_text("PGHOME")?, &[&format!(".pgpass_{}", scope)]);
                p.set("CLONE_WITH_BASEBACKUP", true);
                p.set_default("CLONE_PGPASS", pgpass);
                p.set_default("CLONE_PORT", 5432);
            } else {
                warn!(
                    "Clone method is set to basebackup, but no 'CLONE_SCOPE' \
                     or 'CLONE_HOST' or 'CLONE_USER' or 'CLONE_PASSWORD' specified"
                );
            }
        }
        _ => {
            if identify_storage(p, StoragePrefix::Standby) == Some(StorageBackend::S3) {
                p.set_default("STANDBY_USE_WALG", "true");
            }
        }
    }

    p.set_default("STANDBY_WITH_WALE", "");
    p.set_default("STANDBY_HOST", "");
    p.set_default("STANDBY_PORT", "");
    p.set_default("STANDBY_PRIMARY_SLOT_NAME", "");
    let standby = match p.get("STANDBY_WITH_WALE") {
        Some(with_wale) if with_wale.is_truthy() => with_wale.clone(),
        _ => p
            .get("STANDBY_HOST")
            .cloned()
            .unwrap_or_else(|| PlaceholderValue::from("")),
    };
    p.set_default("STANDBY_CLUSTER", standby);
    Ok(())
}

/// Instance tagging callback on AWS outside of orchestration.
///
/// Reads: provider, orchestration mode, `EIP_ALLOCATION`.
fn select_provider_callback(p: &mut Placeholders, input: &DerivationInput<'_>) -> Result<()> {
    if input.provider == Provider::Aws && !input.orchestrated() {
        let mut callback = String::from("python3 /scripts/callback_aws.py");
        if let Some(allocation) = p.non_empty("EIP_ALLOCATION") {
            callback.push(' ');
            callback.push_str(&allocation);
        }
        p.set("CALLBACK_SCRIPT", callback);
    }
    Ok(())
}

/// New or legacy backup tool for the primary prefix.
///
/// Reads: storage variables, `USE_WALG*`.
fn resolve_backup_tool(p: &mut Placeholders, _: &DerivationInput<'_>) -> Result<()> {
    if AUTO_ENABLE_WALG_RESTORE.iter().any(|name| p.truthy(name)) {
        p.set_default("USE_WALG_RESTORE", "true");
    }
    if p.truthy("WALG_AZ_PREFIX") || WALG_SSH_NAMES.iter().all(|name| p.truthy(name)) {
        p.set_default("USE_WALG_BACKUP", "true");
    }
    select_backup_tool(p, StoragePrefix::Primary);
    Ok(())
}

/// Archiving flag, archive command and role callback.
///
/// Reads: storage variables, `USE_WALG_BACKUP`, `WALE_ENV_DIR`, orchestration mode.
fn derive_archiving(p: &mut Placeholders, input: &DerivationInput<'_>) -> Result<()> {
    let use_wale = AUTO_ENABLE_WALG_RESTORE
        .iter()
        .chain(ARCHIVE_ONLY_NAMES)
        .any(|name| p.truthy(name));
    p.set("USE_WALE", use_wale);

    let from_replica = p.non_empty("WALG_BACKUP_FROM_REPLICA").map(|v| v.to_lowercase());
    if let Some(from_replica) = from_replica {
        p.set("WALG_BACKUP_FROM_REPLICA", from_replica);
    }

    // Kubernetes needs a callback to relabel the new primary
    if input.orchestrated() && !p.truthy("DCS_ENABLE_KUBERNETES_API") {
        p.set("CALLBACK_SCRIPT", "python3 /scripts/callback_role.py");
    }

    let binary = if p.text("USE_WALG_BACKUP").as_deref() == Some("true") {
        "wal-g"
    } else {
        "wal-e"
    };
    p.set("WALE_BINARY", binary);

    let archive_command = if use_wale {
        format!(
            "envdir \"{}\" {} wal-push \"%p\"",
            p.require_text("WALE_ENV_DIR")?,
            binary
        )
    } else {
        "/bin/true".to_string()
    };
    postgresql_parameters(p)?.insert("archive_command".to_string(), archive_command.into());
    Ok(())
}

/// `max_connections` from usable memory.
///
/// Reads: usable memory in MB.
fn size_connections(p: &mut Placeholders, input: &DerivationInput<'_>) -> Result<()> {
    let connections = memory::max_connections(input.system.memory_mb);
    debug!(memory_mb = input.system.memory_mb, connections, "Sized max_connections");
    postgresql_parameters(p)?.insert("max_connections".to_string(), connections.into());
    Ok(())
}

/// Instance identity and listen address.
///
/// Reads: instance metadata, wildcard listen address.
fn apply_instance_metadata(p: &mut Placeholders, input: &DerivationInput<'_>) -> Result<()> {
    let instance = &input.instance;
    let data: BTreeMap<String, PlaceholderValue> = [
        ("ip", instance.ip.as_str()),
        ("id", instance.id.as_str()),
        ("zone", instance.zone.as_str()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.into()))
    .collect();
    p.set("instance_data", data);
    p.set_default("RESTAPI_CONNECT_ADDRESS", instance.ip.as_str());
    p.set("BGMON_LISTEN_IP", input.system.listen_ip.as_str());
    Ok(())
}

/// SSL file paths forced to defaults only when the content is provided.
///
/// Reads: `SSL_*` content and path variables, `RW_DIR`.
fn derive_ssl_paths(p: &mut Placeholders, _: &DerivationInput<'_>) -> Result<()> {
    let rw_dir = p.require_text("RW_DIR")?;
    let cert = |name: &str| paths::join(&rw_dir, &["certs", name]);

    if p.contains("SSL_CA") && p.text_or_empty("SSL_CA_FILE").is_empty() {
        p.set("SSL_CA_FILE", cert("ca.crt"));
    }
    if p.contains("SSL_CRL") && p.text_or_empty("SSL_CRL_FILE").is_empty() {
        p.set("SSL_CRL_FILE", cert("server.crl"));
    }

    if p.contains("SSL_RESTAPI_CERTIFICATE") && p.contains("SSL_RESTAPI_PRIVATE_KEY") {
        if !p.truthy("SSL_RESTAPI_CERTIFICATE_FILE") {
            p.set("SSL_RESTAPI_CERTIFICATE_FILE", cert("rest-api-server.crt"));
        }
        if !p.truthy("SSL_RESTAPI_PRIVATE_KEY_FILE") {
            p.set("SSL_RESTAPI_PRIVATE_KEY_FILE", cert("restapi-api-server.key"));
        }
    }
    if p.truthy("SSL_RESTAPI_CA") && !p.truthy("SSL_RESTAPI_CA_FILE") {
        p.set("SSL_RESTAPI_CA_FILE", cert("rest-api-ca.crt"));
    }
    Ok(())
}

fn postgresql_parameters(p: &mut Placeholders) -> Result<&mut BTreeMap<String, PlaceholderValue>> {
    let postgresql = p.map_mut("postgresql")?;
    match postgresql
        .entry("parameters".to_string())
        .or_insert_with(|| PlaceholderValue::Map(BTreeMap::new()))
    {
        PlaceholderValue::Map(parameters) => Ok(parameters),
        _ => Err(ConfigureError::TypeMismatch {
            key: "postgresql.parameters".to_string(),
            expected: "mapping",
        }),
    }
}
