//! Connection pooler configuration

use super::files::FileWriter;
use super::runit;
use crate::placeholders::Placeholders;
use anyhow::Result;
use std::path::Path;
use tracing::info;

/// Write `pgbouncer.ini` and `userlist.txt` and enable the service.
pub fn write_pgbouncer(placeholders: &Placeholders, rw_dir: &str, writer: &FileWriter) -> Result<()> {
    let Some(config) = placeholders.non_empty("PGBOUNCER_CONFIGURATION") else {
        info!("No PGBOUNCER_CONFIGURATION was specified, skipping");
        return Ok(());
    };

    let dir = Path::new(rw_dir).join("pgbouncer");
    writer.write(&config, &dir.join("pgbouncer.ini"))?;

    let auth = placeholders
        .non_empty("PGBOUNCER_AUTHENTICATION")
        .or_else(|| placeholders.non_empty("PGBOUNCER_AUTH"));
    if let Some(auth) = auth {
        writer.write(&auth, &dir.join("userlist.txt"))?;
    }

    runit::link_service(rw_dir, "pgbouncer")
}
