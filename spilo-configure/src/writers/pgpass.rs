//! Password file for cloning over basebackup

use super::files::{make_private, FileWriter};
use crate::placeholders::Placeholders;
use anyhow::Result;
use std::path::Path;

/// Escape `\` and `:` for a pgpass field.
pub fn escape_pgpass_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | ':') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// `host:port:*:user:password` line.
pub fn pgpass_line(host: &str, port: &str, user: &str, password: &str) -> String {
    format!(
        "{}:{}:*:{}:{}",
        escape_pgpass_value(host),
        port,
        escape_pgpass_value(user),
        escape_pgpass_value(password)
    )
}

/// Write `CLONE_PGPASS` for the clone source.
pub fn write_clone_pgpass(placeholders: &Placeholders, writer: &FileWriter) -> Result<()> {
    let line = pgpass_line(
        &placeholders.require_text("CLONE_HOST")?,
        &placeholders.require_text("CLONE_PORT")?,
        &placeholders.require_text("CLONE_USER")?,
        &placeholders.require_text("CLONE_PASSWORD")?,
    );
    let file = placeholders.require_text("CLONE_PGPASS")?;
    let path = Path::new(&file);
    writer.write(&line, path)?;
    make_private(path)?;
    writer.chown(path)
}
