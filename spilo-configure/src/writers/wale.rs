//! Backup tool environment directory
//!
//! wal-e and wal-g read their settings from an envdir: one file per
//! variable. The contents are built as a plain value first and written
//! afterwards.

use super::files::{create_dir_with_mode, FileWriter};
use crate::placeholders::{
    PlaceholderValue, Placeholders, StorageBackend, StoragePrefix, WALG_SSH_NAMES,
};
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

const S3_NAMES: &[&str] = &[
    "WALE_S3_PREFIX",
    "WALG_S3_PREFIX",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "WALE_S3_ENDPOINT",
    "AWS_ENDPOINT",
    "AWS_REGION",
    "AWS_INSTANCE_PROFILE",
    "WALE_DISABLE_S3_SSE",
    "WALG_S3_SSE_KMS_ID",
    "WALG_S3_SSE",
    "WALG_DISABLE_S3_SSE",
    "AWS_S3_FORCE_PATH_STYLE",
    "AWS_ROLE_ARN",
    "AWS_WEB_IDENTITY_TOKEN_FILE",
    "AWS_STS_REGIONAL_ENDPOINTS",
];

const AZURE_NAMES: &[&str] = &[
    "WALG_AZ_PREFIX",
    "AZURE_STORAGE_ACCOUNT",
    "WALG_AZURE_BUFFER_SIZE",
    "WALG_AZURE_MAX_BUFFERS",
    "AZURE_ENVIRONMENT_NAME",
];

/// Azure authentication options in precedence order.
const AZURE_AUTH_OPTIONS: &[&[&str]] = &[
    &["AZURE_STORAGE_ACCESS_KEY"],
    &["AZURE_STORAGE_SAS_TOKEN"],
    &["AZURE_CLIENT_ID", "AZURE_CLIENT_SECRET", "AZURE_TENANT_ID"],
];

const GS_NAMES: &[&str] = &["WALE_GS_PREFIX", "WALG_GS_PREFIX", "GOOGLE_APPLICATION_CREDENTIALS"];

const SWIFT_NAMES: &[&str] = &[
    "WALE_SWIFT_PREFIX",
    "SWIFT_AUTHURL",
    "SWIFT_TENANT",
    "SWIFT_TENANT_ID",
    "SWIFT_USER",
    "SWIFT_USER_ID",
    "SWIFT_USER_DOMAIN_NAME",
    "SWIFT_USER_DOMAIN_ID",
    "SWIFT_PASSWORD",
    "SWIFT_AUTH_VERSION",
    "SWIFT_ENDPOINT_TYPE",
    "SWIFT_REGION",
    "SWIFT_DOMAIN_NAME",
    "SWIFT_DOMAIN_ID",
    "SWIFT_PROJECT_NAME",
    "SWIFT_PROJECT_ID",
    "SWIFT_PROJECT_DOMAIN_NAME",
    "SWIFT_PROJECT_DOMAIN_ID",
];

/// Tuning shared by every family the new backup tool handles.
const WALG_NAMES: &[&str] = &[
    "WALG_DELTA_MAX_STEPS",
    "WALG_DELTA_ORIGIN",
    "WALG_DOWNLOAD_CONCURRENCY",
    "WALG_UPLOAD_CONCURRENCY",
    "WALG_UPLOAD_DISK_CONCURRENCY",
    "WALG_DISK_RATE_LIMIT",
    "WALG_NETWORK_RATE_LIMIT",
    "WALG_COMPRESSION_METHOD",
    "USE_WALG_BACKUP",
    "USE_WALG_RESTORE",
    "WALG_BACKUP_COMPRESSION_METHOD",
    "WALG_BACKUP_FROM_REPLICA",
    "WALG_SENTINEL_USER_DATA",
    "WALG_PREVENT_WAL_OVERWRITE",
    "WALG_S3_CA_CERT_FILE",
    "WALG_LIBSODIUM_KEY",
    "WALG_LIBSODIUM_KEY_PATH",
    "WALG_LIBSODIUM_KEY_TRANSFORM",
    "WALG_PGP_KEY",
    "WALG_PGP_KEY_PATH",
    "WALG_PGP_KEY_PASSPHRASE",
    "no_proxy",
    "http_proxy",
    "https_proxy",
];

const COMMON_NAMES: &[&str] = &[
    "PGVERSION",
    "PGPORT",
    "WALE_ENV_DIR",
    "SCOPE",
    "WAL_BUCKET_SCOPE_PREFIX",
    "WAL_BUCKET_SCOPE_SUFFIX",
    "BACKUP_NUM_TO_RETAIN",
    "ENABLE_WAL_PATH_COMPAT",
];

const ENDPOINT_PATTERN: &str = r"^(\w+)\+(\w+)(://.+)$";
const REGION_PATTERN: &str = r".*(\w{2}-\w+-\d)-.*";

/// Contents of one backup envdir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEnvironment {
    pub env_dir: String,
    pub backend: StorageBackend,
    /// Variable name and value, in write order; values are never empty.
    pub entries: Vec<(String, String)>,
}

impl WalEnvironment {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Prefix-stripped view over the gathered variables; absent reads as empty.
#[derive(Debug, Default)]
struct Values(BTreeMap<String, String>);

impl Values {
    fn get(&self, name: &str) -> &str {
        self.0.get(name).map(String::as_str).unwrap_or_default()
    }

    fn is_set(&self, name: &str) -> bool {
        !self.get(name).is_empty()
    }

    fn set(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_string(), value.into());
    }

    fn take(&mut self, name: &str) -> String {
        self.0.remove(name).unwrap_or_default()
    }
}

fn gather(placeholders: &Placeholders, prefix: StoragePrefix) -> Values {
    let schema_names = StorageBackend::PROBE_ORDER.into_iter().flat_map(|backend| {
        backend
            .identifying_vars()
            .chain(backend.schema().bucket_vars.iter().copied())
    });
    let names = COMMON_NAMES
        .iter()
        .chain(S3_NAMES)
        .chain(SWIFT_NAMES)
        .chain(GS_NAMES)
        .chain(WALG_NAMES)
        .chain(AZURE_NAMES)
        .chain(AZURE_AUTH_OPTIONS.iter().flat_map(|option| option.iter()))
        .chain(WALG_SSH_NAMES)
        .copied()
        .chain(schema_names);

    let mut values = Values::default();
    for name in names {
        let key = prefix.key(name);
        // A disabled flag is not written.
        let value = match placeholders.get(&key) {
            Some(PlaceholderValue::Bool(false)) => String::new(),
            _ => placeholders.text_or_empty(&key),
        };
        values.set(name, value);
    }
    values
}

/// Build the envdir contents for `prefix`, `None` without a storage backend.
pub fn wal_environment(placeholders: &Placeholders, prefix: StoragePrefix) -> Result<Option<WalEnvironment>> {
    let mut values = gather(placeholders, prefix);
    let Some(backend) = StorageBackend::identify(|name| values.is_set(name), true) else {
        return Ok(None);
    };
    let env_dir = values.get("WALE_ENV_DIR").to_string();
    if env_dir.is_empty() {
        warn!(prefix = prefix.as_str(), "No WALE_ENV_DIR for storage configuration");
        return Ok(None);
    }

    let schema = backend.schema();
    if let Some(alias) = schema.alias_prefix_vars.iter().find(|v| values.is_set(v)) {
        let prefix_value = values.get(alias).to_string();
        values.set(schema.prefix_var, prefix_value);
    } else if let Some((primary, aliases)) = schema.bucket_vars.split_first() {
        if let Some(alias) = aliases.iter().find(|v| values.is_set(v)) {
            let bucket = values.get(alias).to_string();
            values.set(primary, bucket);
        }
    }

    let names: Vec<&str> = match backend {
        StorageBackend::S3 => {
            let zone = placeholders
                .lookup("instance_data.zone")
                .and_then(|z| z.as_text())
                .map(|z| z.into_owned())
                .unwrap_or_default();
            apply_s3_settings(&mut values, &zone)?;
            S3_NAMES.iter().chain(WALG_NAMES).copied().collect()
        }
        StorageBackend::Gcs => GS_NAMES.iter().chain(WALG_NAMES).copied().collect(),
        StorageBackend::Swift => SWIFT_NAMES.to_vec(),
        StorageBackend::Azure => AZURE_NAMES
            .iter()
            .copied()
            .chain(azure_auth(&values))
            .chain(WALG_NAMES.iter().copied())
            .collect(),
        StorageBackend::Ssh => WALG_SSH_NAMES.iter().chain(WALG_NAMES).copied().collect(),
    };

    if !values.is_set(schema.prefix_var) {
        let bucket = schema
            .bucket_vars
            .first()
            .map(|v| values.get(v))
            .unwrap_or_default();
        let default_prefix = format!(
            "{}://{}/spilo/{}{}{}/wal/{}",
            schema.scheme,
            bucket,
            values.get("WAL_BUCKET_SCOPE_PREFIX"),
            values.get("SCOPE"),
            values.get("WAL_BUCKET_SCOPE_SUFFIX"),
            values.get("PGVERSION"),
        );
        debug!(backend = %backend, prefix = %default_prefix, "Using default storage prefix");
        values.set(schema.prefix_var, default_prefix);
    }
    if let Some(new_tool_var) = schema.new_tool_prefix_var {
        if !values.is_set(new_tool_var) {
            let prefix_value = values.get(schema.prefix_var).to_string();
            values.set(new_tool_var, prefix_value);
        }
    }

    values.set("WALE_LOG_DESTINATION", "stderr");
    let mut written = names;
    written.extend(["WALE_LOG_DESTINATION", "PGPORT"]);
    if prefix == StoragePrefix::Primary {
        written.push("BACKUP_NUM_TO_RETAIN");
    }

    let entries = written
        .into_iter()
        .filter(|name| values.is_set(name))
        .map(|name| (name.to_string(), values.get(name).to_string()))
        .collect();

    Ok(Some(WalEnvironment {
        env_dir,
        backend,
        entries,
    }))
}

/// Endpoint, region, SSE and credential defaults for S3 and compatibles.
fn apply_s3_settings(values: &mut Values, zone: &str) -> Result<()> {
    let wale_endpoint = values.take("WALE_S3_ENDPOINT");
    let aws_endpoint = values.take("AWS_ENDPOINT");
    let aws_region = values.take("AWS_REGION");

    if !wale_endpoint.is_empty() || !aws_endpoint.is_empty() {
        let (wale_endpoint, aws_endpoint, convention) = if wale_endpoint.is_empty() {
            (aws_endpoint.replace("://", "+path://"), aws_endpoint, "path".to_string())
        } else {
            let re = Regex::new(ENDPOINT_PATTERN).context("Invalid endpoint pattern")?;
            match re.captures(&wale_endpoint) {
                Some(caps) => {
                    let convention = caps[2].to_string();
                    let aws_endpoint = if aws_endpoint.is_empty() {
                        format!("{}{}", &caps[1], &caps[3])
                    } else {
                        aws_endpoint
                    };
                    (wale_endpoint.clone(), aws_endpoint, convention)
                }
                None => {
                    warn!(
                        endpoint = %wale_endpoint,
                        "Invalid WALE_S3_ENDPOINT, the format is protocol+convention://hostname:port"
                    );
                    let aws_endpoint = if aws_endpoint.is_empty() {
                        wale_endpoint.clone()
                    } else {
                        aws_endpoint
                    };
                    (wale_endpoint.clone(), aws_endpoint, "path".to_string())
                }
            }
        };

        values.set("WALE_S3_ENDPOINT", wale_endpoint);
        values.set("AWS_ENDPOINT", aws_endpoint);
        for name in ["WALE_DISABLE_S3_SSE", "WALG_DISABLE_S3_SSE"] {
            if !values.is_set(name) {
                values.set(name, "true");
            }
        }
        values.set("AWS_S3_FORCE_PATH_STYLE", (convention == "path").to_string());
        if !aws_region.is_empty() && values.get("USE_WALG_BACKUP") == "true" {
            values.set("AWS_REGION", aws_region);
        }
    } else if aws_region.is_empty() {
        let region = region_from_name(values, zone)?;
        values.set("AWS_REGION", region);
    } else {
        values.set("AWS_REGION", aws_region);
    }

    if !(values.is_set("AWS_SECRET_ACCESS_KEY") && values.is_set("AWS_ACCESS_KEY_ID")) {
        values.set("AWS_INSTANCE_PROFILE", "true");
    }
    if values.is_set("WALE_DISABLE_S3_SSE") && !values.is_set("WALG_DISABLE_S3_SSE") {
        let disabled = values.get("WALE_DISABLE_S3_SSE").to_string();
        values.set("WALG_DISABLE_S3_SSE", disabled);
    }
    if values.get("USE_WALG_BACKUP") == "true"
        && values.get("WALG_DISABLE_S3_SSE") != "true"
        && !values.is_set("WALG_S3_SSE")
    {
        values.set("WALG_S3_SSE", "AES256");
    }
    Ok(())
}

/// Region embedded in the bucket or prefix name, else the instance zone's.
fn region_from_name(values: &Values, zone: &str) -> Result<String> {
    let name = match values.get("WAL_S3_BUCKET") {
        "" => values.get("WALE_S3_PREFIX"),
        bucket => bucket,
    };
    let re = Regex::new(REGION_PATTERN).context("Invalid region pattern")?;
    if let Some(caps) = re.captures(name) {
        return Ok(caps[1].to_string());
    }
    let mut region = zone.to_string();
    region.pop();
    Ok(region)
}

/// The single Azure authentication option written to the envdir.
///
/// Access key beats SAS token beats service principal.
fn azure_auth(values: &Values) -> Vec<&'static str> {
    let configured: Vec<&[&'static str]> = AZURE_AUTH_OPTIONS
        .iter()
        .copied()
        .filter(|option| option.iter().all(|name| values.is_set(name)))
        .collect();

    let chosen = configured.first().map(|option| option.to_vec()).unwrap_or_default();
    if configured.len() > 1 {
        warn!(
            using = %chosen.join("/"),
            "Multiple authentication options configured for wal-g backup to Azure. Provide either \
             AZURE_STORAGE_ACCESS_KEY or AZURE_STORAGE_SAS_TOKEN or Service Principal \
             (AZURE_CLIENT_ID, AZURE_CLIENT_SECRET, AZURE_TENANT_ID) for authentication (or use MSI)."
        );
    }
    chosen
}

/// Write the envdir and the `TMPDIR` entry pointing at `tmpdir`.
pub fn write_wal_environment(wal: &WalEnvironment, tmpdir: &str, writer: &FileWriter) -> Result<()> {
    let env_dir = Path::new(&wal.env_dir);
    fs::create_dir_all(env_dir)
        .with_context(|| format!("Failed to create envdir {}", env_dir.display()))?;

    for (name, value) in &wal.entries {
        let path = env_dir.join(name);
        writer.write(value, &path)?;
        writer.chown(&path)?;
    }

    create_dir_with_mode(Path::new(tmpdir), 0o1777)?;
    writer.write_always(tmpdir, &env_dir.join("TMPDIR"))?;
    info!(env_dir = %wal.env_dir, backend = %wal.backend, "Wrote backup environment");
    Ok(())
}

/// Build and write the envdir for `prefix` when storage is configured.
pub fn configure_backups(placeholders: &Placeholders, prefix: StoragePrefix, writer: &FileWriter) -> Result<()> {
    match wal_environment(placeholders, prefix)? {
        Some(wal) => {
            let tmpdir = placeholders.require_text("WALE_TMPDIR")?;
            write_wal_environment(&wal, &tmpdir, writer)
        }
        None => {
            debug!(prefix = prefix.as_str(), "No storage configured, skipping envdir");
            Ok(())
        }
    }
}
