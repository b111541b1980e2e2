//! Scheduled jobs for the postgres and root crontabs

use super::files::set_mode;
use super::runit;
use crate::placeholders::Placeholders;
use anyhow::{Context, Result};
use common::command;
use nix::unistd::{chown, getuid, Group};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

const PROC_STATUS: &str = "/proc/self/status";
const CAP_SYS_NICE: u64 = 0x80_0000;
const RENICE_JOB: &str = "*/5 * * * * bash /scripts/renice.sh";
const SSL_RELOAD_VARS: &[&str] = &[
    "PGDATA",
    "SSL_CA_FILE",
    "SSL_CRL_FILE",
    "SSL_CERTIFICATE_FILE",
    "SSL_PRIVATE_KEY_FILE",
];

/// Privilege facts read from `/proc/self/status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessPrivileges {
    pub no_new_privs: bool,
    pub sys_nice: bool,
}

impl ProcessPrivileges {
    pub fn parse(status: &str) -> Self {
        let mut privileges = Self::default();
        for line in status.lines() {
            if let Some(value) = line.strip_prefix("NoNewPrivs:") {
                privileges.no_new_privs = value.trim().parse::<u8>().is_ok_and(|v| v != 0);
            } else if let Some(value) = line.strip_prefix("CapBnd:") {
                privileges.sys_nice = u64::from_str_radix(value.trim(), 16)
                    .is_ok_and(|caps| caps & CAP_SYS_NICE == CAP_SYS_NICE);
            }
        }
        privileges
    }

    pub fn current() -> Result<Self> {
        let status = fs::read_to_string(PROC_STATUS)
            .with_context(|| format!("Failed to read {}", PROC_STATUS))?;
        Ok(Self::parse(&status))
    }
}

/// Crontab lines per user; each starts with the `PATH` line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrontabPlan {
    pub postgres: Vec<String>,
    /// Empty unless a job must run as root.
    pub root: Vec<String>,
}

impl CrontabPlan {
    /// Whether any job beyond the `PATH` line is scheduled.
    pub fn has_jobs(&self) -> bool {
        self.postgres.len() > 1 || !self.root.is_empty()
    }
}

/// Work out the scheduled jobs.
pub fn crontab_plan(placeholders: &Placeholders, privileges: ProcessPrivileges, is_root: bool) -> Result<CrontabPlan> {
    let path_line = format!("PATH={}", placeholders.text_or_empty("PATH"));
    let mut plan = CrontabPlan {
        postgres: vec![path_line.clone()],
        root: Vec::new(),
    };

    if !privileges.sys_nice {
        info!("Skipping creation of renice cron job due to lack of SYS_NICE capability");
    } else if !privileges.no_new_privs {
        plan.postgres.push(RENICE_JOB.to_string());
    } else if is_root {
        plan.root = vec![path_line, RENICE_JOB.to_string()];
    } else {
        info!(
            "Skipping creation of renice cron job due to running as not root \
             and with \"no-new-privileges:true\" (allowPrivilegeEscalation=false on K8s)"
        );
    }

    if placeholders.truthy("SSL_TEST_RELOAD") {
        let env: Vec<String> = SSL_RELOAD_VARS
            .iter()
            .filter_map(|name| placeholders.non_empty(name).map(|v| format!("{}=\"{}\"", name, v)))
            .collect();
        let hash_dir = Path::new(&placeholders.text_or_empty("RW_DIR")).join("tmp");
        plan.postgres.push(format!(
            "*/5 * * * * {} /scripts/test_reload_ssl.sh {}",
            env.join(" "),
            hash_dir.display()
        ));
    }

    if placeholders.truthy("USE_WALE") {
        plan.postgres.push(format!(
            "{} envdir \"{}\" /scripts/postgres_backup.sh \"{}\"",
            placeholders.text_or_empty("BACKUP_SCHEDULE"),
            placeholders.text_or_empty("WALE_ENV_DIR"),
            placeholders.text_or_empty("PGDATA"),
        ));
    }

    if placeholders.truthy("LOG_S3_BUCKET") {
        plan.postgres.push(format!(
            "{} nice -n 5 envdir \"{}\" /scripts/upload_pg_log_to_s3.py",
            placeholders.text_or_empty("LOG_SHIP_SCHEDULE"),
            placeholders.text_or_empty("LOG_ENV_DIR"),
        ));
    }

    let extra = placeholders.text_or_empty("CRONTAB");
    let extra: Option<Vec<String>> =
        serde_yaml::from_str(&extra).context("CRONTAB must be a YAML list of crontab lines")?;
    plan.postgres.extend(extra.unwrap_or_default());

    Ok(plan)
}

/// Prepare the cron spool directory and enable the cron service.
fn setup_runit_cron(rw_dir: &str, is_root: bool) -> Result<()> {
    let crontabs = Path::new(rw_dir).join("cron").join("crontabs");
    if !crontabs.exists() {
        fs::create_dir_all(&crontabs)
            .with_context(|| format!("Failed to create {}", crontabs.display()))?;
        set_mode(&crontabs, 0o1730)?;
        if is_root {
            match Group::from_name("crontab").context("Failed to look up group crontab")? {
                Some(group) => chown(&crontabs, None, Some(group.gid))
                    .with_context(|| format!("Failed to change group of {}", crontabs.display()))?,
                None => warn!("Group crontab not found, keeping group of the crontab spool"),
            }
        }
    }
    runit::link_service(rw_dir, "cron")
}

async fn install(user: &str, lines: &[String], force: bool) -> Result<()> {
    if !force && command::crontab_exists(user).await? {
        warn!(user, "Cron is already configured. (Use option --force to overwrite cron)");
        return Ok(());
    }
    command::install_crontab(user, lines).await?;
    info!(user, jobs = lines.len() - 1, "Installed crontab");
    Ok(())
}

/// Schedule jobs for postgres (and root when needed).
pub async fn write_crontab(placeholders: &Placeholders, force: bool) -> Result<()> {
    let is_root = getuid().is_root();
    let plan = crontab_plan(placeholders, ProcessPrivileges::current()?, is_root)?;

    if plan.has_jobs() {
        setup_runit_cron(&placeholders.require_text("RW_DIR")?, is_root)?;
    }
    if plan.postgres.len() > 1 {
        install("postgres", &plan.postgres, force).await?;
    }
    if !plan.root.is_empty() {
        install("root", &plan.root, force).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const NICE: ProcessPrivileges = ProcessPrivileges {
        no_new_privs: false,
        sys_nice: true,
    };

    fn placeholders(pairs: &[(&str, &str)]) -> Placeholders {
        let mut p = Placeholders::default();
        p.set("PATH", "/usr/bin:/bin");
        p.set("RW_DIR", "/run");
        p.set("CRONTAB", "[]");
        p.set("USE_WALE", false);
        p.set("SSL_TEST_RELOAD", false);
        p.set("LOG_S3_BUCKET", "");
        for (k, v) in pairs {
            p.set(*k, *v);
        }
        p
    }

    #[test]
    fn test_parse_proc_status() {
        let status = "Name:\tbash\nNoNewPrivs:\t1\nCapBnd:\t00000000a80425fb\n";
        assert_eq!(
            ProcessPrivileges::parse(status),
            ProcessPrivileges {
                no_new_privs: true,
                sys_nice: false
            }
        );
        let status = "NoNewPrivs:\t0\nCapBnd:\t000001ffffffffff\n";
        assert_eq!(ProcessPrivileges::parse(status), NICE);
    }

    #[test]
    fn test_path_only_plan_has_no_jobs() {
        let plan = crontab_plan(&placeholders(&[]), ProcessPrivileges::default(), false).unwrap();
        assert_eq!(plan.postgres, ["PATH=/usr/bin:/bin"]);
        assert!(!plan.has_jobs());
    }

    #[test]
    fn test_renice_placement() {
        let p = placeholders(&[]);
        let plan = crontab_plan(&p, NICE, false).unwrap();
        assert_eq!(plan.postgres[1], RENICE_JOB);

        let locked = ProcessPrivileges {
            no_new_privs: true,
            sys_nice: true,
        };
        let plan = crontab_plan(&p, locked, true).unwrap();
        assert_eq!(plan.postgres.len(), 1);
        assert_eq!(plan.root, ["PATH=/usr/bin:/bin", RENICE_JOB]);
        assert!(plan.has_jobs());

        assert!(!crontab_plan(&p, locked, false).unwrap().has_jobs());
    }

    #[test]
    fn test_backup_log_and_extra_jobs() {
        let mut p = placeholders(&[
            ("BACKUP_SCHEDULE", "0 1 * * *"),
            ("WALE_ENV_DIR", "/run/etc/wal-e.d/env"),
            ("PGDATA", "/home/postgres/pgroot/pgdata"),
            ("LOG_S3_BUCKET", "logs"),
            ("LOG_SHIP_SCHEDULE", "1 0 * * *"),
            ("LOG_ENV_DIR", "/run/etc/log.d/env"),
            ("CRONTAB", "['0 3 * * * /scripts/vacuum.sh']"),
        ]);
        p.set("USE_WALE", true);
        let plan = crontab_plan(&p, ProcessPrivileges::default(), false).unwrap();
        assert_eq!(
            plan.postgres[1..],
            [
                "0 1 * * * envdir \"/run/etc/wal-e.d/env\" /scripts/postgres_backup.sh \"/home/postgres/pgroot/pgdata\"",
                "1 0 * * * nice -n 5 envdir \"/run/etc/log.d/env\" /scripts/upload_pg_log_to_s3.py",
                "0 3 * * * /scripts/vacuum.sh",
            ]
        );
    }

    #[test]
    fn test_ssl_reload_job_lists_set_paths() {
        let mut p = placeholders(&[
            ("PGDATA", "/data"),
            ("SSL_CERTIFICATE_FILE", "/run/certs/server.crt"),
            ("SSL_PRIVATE_KEY_FILE", "/run/certs/server.key"),
            ("SSL_CA_FILE", ""),
        ]);
        p.set("SSL_TEST_RELOAD", true);
        let plan = crontab_plan(&p, ProcessPrivileges::default(), false).unwrap();
        assert_eq!(
            plan.postgres[1],
            "*/5 * * * * PGDATA=\"/data\" SSL_CERTIFICATE_FILE=\"/run/certs/server.crt\" \
             SSL_PRIVATE_KEY_FILE=\"/run/certs/server.key\" /scripts/test_reload_ssl.sh /run/tmp"
        );
    }

    #[test]
    fn test_bad_crontab_value_is_an_error() {
        let p = placeholders(&[("CRONTAB", "{not: a list}")]);
        assert!(crontab_plan(&p, ProcessPrivileges::default(), false).is_err());
    }

    #[test]
    fn test_setup_runit_cron_spool() {
        let dir = TempDir::new().unwrap();
        setup_runit_cron(dir.path().to_str().unwrap(), false).unwrap();
        let crontabs = dir.path().join("cron").join("crontabs");
        assert_eq!(fs::metadata(&crontabs).unwrap().permissions().mode() & 0o7777, 0o1730);
        assert!(fs::symlink_metadata(dir.path().join("service").join("cron")).is_ok());
    }
}
