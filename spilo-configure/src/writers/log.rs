//! Log shipping environment

use super::files::{create_dir_with_mode, FileWriter};
use crate::placeholders::Placeholders;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Contents of the log shipping envdir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEnvironment {
    pub env_dir: String,
    pub tmpdir: String,
    pub entries: Vec<(&'static str, String)>,
}

impl LogEnvironment {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Build the log envdir from the placeholders and instance metadata.
pub fn log_environment(placeholders: &Placeholders) -> Result<LogEnvironment> {
    let instance = |field: &str| {
        placeholders
            .lookup(&format!("instance_data.{}", field))
            .and_then(|v| v.as_text())
            .map(|v| v.into_owned())
            .unwrap_or_default()
    };

    let region = match placeholders.non_empty("AWS_REGION") {
        Some(region) => region.into_owned(),
        None => {
            let mut zone = instance("zone");
            zone.pop();
            zone
        }
    };
    let s3_key = format!(
        "spilo/{}{}{}/log/{}",
        placeholders.text_or_empty("LOG_BUCKET_SCOPE_PREFIX"),
        placeholders.text_or_empty("SCOPE"),
        placeholders.text_or_empty("LOG_BUCKET_SCOPE_SUFFIX"),
        instance("id"),
    );
    let tmpdir = placeholders.require_text("LOG_TMPDIR")?;

    Ok(LogEnvironment {
        env_dir: placeholders.require_text("LOG_ENV_DIR")?,
        tmpdir: tmpdir.clone(),
        entries: vec![
            ("LOG_TMPDIR", tmpdir),
            ("LOG_AWS_HOST", format!("s3.{}.amazonaws.com", region)),
            ("LOG_S3_KEY", s3_key),
            ("LOG_S3_BUCKET", placeholders.text_or_empty("LOG_S3_BUCKET")),
            ("PGLOG", placeholders.text_or_empty("PGLOG")),
        ],
    })
}

/// Create the directories and write every entry, replacing old values.
pub fn write_log_environment(log: &LogEnvironment, writer: &FileWriter) -> Result<()> {
    create_dir_with_mode(Path::new(&log.tmpdir), 0o1777)?;
    let env_dir = Path::new(&log.env_dir);
    fs::create_dir_all(env_dir)
        .with_context(|| format!("Failed to create envdir {}", env_dir.display()))?;
    for (name, value) in &log.entries {
        writer.write_always(value, &env_dir.join(name))?;
    }
    Ok(())
}
