//! Section writers
//!
//! Everything that touches the filesystem or external commands on behalf
//! of a CLI section:
//! - `files`: overwrite policy, modes and ownership
//! - `runit`: service links
//! - `patroni`, `certificates`, `wale`, `log`, `crontab`, `pam`,
//!   `pgbouncer`, `pgpass`: one per generated artefact

pub mod certificates;
pub mod crontab;
pub mod files;
pub mod log;
pub mod pam;
pub mod patroni;
pub mod pgbouncer;
pub mod pgpass;
pub mod runit;
pub mod wale;

pub use files::FileWriter;
