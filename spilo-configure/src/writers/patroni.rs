//! Patroni configuration file and socket directory

use super::files::{create_dir_with_mode, FileWriter};
use anyhow::{Context, Result};
use serde_yaml::Value;
use std::path::Path;

/// Write the document as block style YAML, respecting `--force`.
pub fn write_patroni_config(config: &Value, path: &Path, writer: &FileWriter) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize Patroni configuration")?;
    writer.write(&yaml, path)?;
    writer.chown(path)
}

/// Create the PostgreSQL socket directory (mode 2775) owned by postgres.
pub fn prepare_socket_dir(path: &Path, writer: &FileWriter) -> Result<()> {
    if create_dir_with_mode(path, 0o2775)? {
        writer.chown_with_group(path)?;
    }
    Ok(())
}
