//! CLI sections
//!
//! Each section produces one group of artefacts from the assembled
//! document and the placeholder mapping.

use crate::document::Document;
use crate::paths;
use crate::placeholders::{select_backup_tool, Placeholders, StoragePrefix};
use crate::writers::{certificates, crontab, log, pam, patroni, pgbouncer, pgpass, runit, wale};
use crate::writers::FileWriter;
use anyhow::Result;
use clap::ValueEnum;
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// Section names accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Section {
    All,
    Patroni,
    Pgqd,
    Certificate,
    WalE,
    Crontab,
    PamOauth2,
    Pgbouncer,
    Bootstrap,
    StandbyCluster,
    Log,
}

impl Section {
    /// Every concrete section, in execution order.
    pub const CONCRETE: [Section; 10] = [
        Self::Patroni,
        Self::Pgqd,
        Self::Certificate,
        Self::WalE,
        Self::Crontab,
        Self::PamOauth2,
        Self::Pgbouncer,
        Self::Bootstrap,
        Self::StandbyCluster,
        Self::Log,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Patroni => "patroni",
            Self::Pgqd => "pgqd",
            Self::Certificate => "certificate",
            Self::WalE => "wal-e",
            Self::Crontab => "crontab",
            Self::PamOauth2 => "pam-oauth2",
            Self::Pgbouncer => "pgbouncer",
            Self::Bootstrap => "bootstrap",
            Self::StandbyCluster => "standby-cluster",
            Self::Log => "log",
        }
    }

    /// Resolve `all` and drop repeats, keeping first-seen order.
    pub fn expand(requested: &[Section]) -> Vec<Section> {
        if requested.contains(&Self::All) {
            return Self::CONCRETE.to_vec();
        }
        let mut sections = Vec::with_capacity(requested.len());
        for section in requested {
            if !sections.contains(section) {
                sections.push(*section);
            }
        }
        sections
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What every section works from.
pub struct SectionContext<'a> {
    pub placeholders: &'a mut Placeholders,
    pub document: &'a Document,
    pub writer: &'a FileWriter,
}

impl SectionContext<'_> {
    fn rw_dir(&self) -> String {
        self.placeholders
            .non_empty("RW_DIR")
            .map(|dir| dir.into_owned())
            .unwrap_or_else(|| paths::DEFAULT_RW_DIR.to_string())
    }
}

/// Run one concrete section.
pub async fn run_section(section: Section, ctx: &mut SectionContext<'_>) -> Result<()> {
    info!(section = %section, "Configuring");
    let rw_dir = ctx.rw_dir();
    match section {
        Section::All => {
            for section in Section::CONCRETE {
                Box::pin(run_section(section, ctx)).await?;
            }
        }
        Section::Patroni => {
            patroni::write_patroni_config(
                &ctx.document.config,
                &paths::patroni_config_file(&rw_dir),
                ctx.writer,
            )?;
            runit::link_service(&rw_dir, "patroni")?;
            patroni::prepare_socket_dir(Path::new(paths::PG_SOCKET_DIR), ctx.writer)?;
        }
        Section::Pgqd => runit::link_service(&rw_dir, "pgqd")?,
        Section::Log => {
            if ctx.placeholders.truthy("LOG_S3_BUCKET") {
                let environment = log::log_environment(ctx.placeholders)?;
                log::write_log_environment(&environment, ctx.writer)?;
            } else {
                debug!("No LOG_S3_BUCKET, skipping log shipping");
            }
        }
        Section::WalE => {
            if ctx.placeholders.truthy("USE_WALE") {
                wale::configure_backups(ctx.placeholders, StoragePrefix::Primary, ctx.writer)?;
            }
        }
        Section::Certificate => {
            certificates::write_certificates(ctx.placeholders, ctx.writer)?;
            certificates::write_restapi_certificates(ctx.placeholders, ctx.writer)?;
        }
        Section::Crontab => crontab::write_crontab(ctx.placeholders, ctx.writer.force()).await?,
        Section::PamOauth2 => {
            let args = ctx.placeholders.text_or_empty("PAM_OAUTH2");
            pam::write_pam_oauth2(&args, Path::new(paths::PAM_POSTGRESQL), ctx.writer)?;
        }
        Section::Pgbouncer => pgbouncer::write_pgbouncer(ctx.placeholders, &rw_dir, ctx.writer)?,
        Section::Bootstrap => {
            if ctx.placeholders.truthy("CLONE_WITH_WALE") {
                select_backup_tool(ctx.placeholders, StoragePrefix::Clone);
                wale::configure_backups(ctx.placeholders, StoragePrefix::Clone, ctx.writer)?;
            }
            if ctx.placeholders.truthy("CLONE_WITH_BASEBACKUP") {
                pgpass::write_clone_pgpass(ctx.placeholders, ctx.writer)?;
            }
        }
        Section::StandbyCluster => {
            if ctx.placeholders.truthy("STANDBY_WITH_WALE") {
                select_backup_tool(ctx.placeholders, StoragePrefix::Standby);
                wale::configure_backups(ctx.placeholders, StoragePrefix::Standby, ctx.writer)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Value;
    use std::fs;
    use tempfile::TempDir;

    fn document() -> Document {
        Document {
            config: serde_yaml::from_str("scope: demo\n").unwrap(),
            local_etcd: false,
            pg_version: "15".to_string(),
        }
    }

    #[test]
    fn test_expand_sections() {
        assert_eq!(Section::expand(&[Section::Log, Section::All]).len(), 10);
        assert_eq!(
            Section::expand(&[Section::Log, Section::Pgqd, Section::Log]),
            [Section::Log, Section::Pgqd]
        );
    }

    #[test]
    fn test_section_names_match_cli_values() {
        for section in Section::CONCRETE {
            let parsed = Section::from_str(section.name(), false).unwrap();
            assert_eq!(parsed, section);
        }
        assert!(Section::from_str("unknown", false).is_err());
    }

    #[tokio::test]
    async fn test_bootstrap_writes_clone_envdir() {
        let dir = TempDir::new().unwrap();
        let env_dir = dir.path().join("env-clone-old");
        let mut placeholders = Placeholders::default();
        placeholders.set("RW_DIR", dir.path().to_str().unwrap());
        placeholders.set("WALE_TMPDIR", dir.path().join("tmp").to_str().unwrap());
        placeholders.set("CLONE_WITH_WALE", true);
        placeholders.set("CLONE_WITH_BASEBACKUP", "");
        placeholders.set("CLONE_WAL_S3_BUCKET", "old-backups");
        placeholders.set("CLONE_SCOPE", "old");
        placeholders.set("CLONE_PGVERSION", "14");
        placeholders.set("CLONE_AWS_REGION", "eu-west-1");
        placeholders.set("CLONE_USE_WALG", "true");
        placeholders.set("CLONE_WALE_ENV_DIR", env_dir.to_str().unwrap());

        let document = document();
        let writer = FileWriter::unowned(false);
        let mut ctx = SectionContext {
            placeholders: &mut placeholders,
            document: &document,
            writer: &writer,
        };
        run_section(Section::Bootstrap, &mut ctx).await.unwrap();

        assert_eq!(
            fs::read_to_string(env_dir.join("WALE_S3_PREFIX")).unwrap(),
            "s3://old-backups/spilo/old/wal/14"
        );
        assert_eq!(fs::read_to_string(env_dir.join("USE_WALG_RESTORE")).unwrap(), "true");
        assert!(!env_dir.join("BACKUP_NUM_TO_RETAIN").exists());
        assert_eq!(placeholders.get("CLONE_USE_WALG_BACKUP"), Some(&"true".into()));
    }

    #[tokio::test]
    async fn test_pgqd_links_service() {
        let dir = TempDir::new().unwrap();
        let mut placeholders = Placeholders::default();
        placeholders.set("RW_DIR", dir.path().to_str().unwrap());
        let document = document();
        let writer = FileWriter::unowned(false);
        let mut ctx = SectionContext {
            placeholders: &mut placeholders,
            document: &document,
            writer: &writer,
        };
        run_section(Section::Pgqd, &mut ctx).await.unwrap();
        assert!(fs::symlink_metadata(dir.path().join("service").join("pgqd")).is_ok());
        assert_eq!(document.config["scope"], Value::from("demo"));
    }
}
