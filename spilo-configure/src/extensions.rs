//! Extension compatibility filter
//!
//! A static table records, per extension, the supported PostgreSQL version
//! range and whether it belongs in `shared_preload_libraries` and in the
//! `extwlist.extensions` allowlist. Names unknown to the table pass through.

use common::Environment;

/// Version bounds and eligibility of one extension.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtensionEntry {
    pub name: &'static str,
    pub min_version: f64,
    pub max_version: f64,
    pub preload: bool,
    pub allowlist: bool,
}

impl ExtensionEntry {
    const fn new(name: &'static str, min: f64, max: f64, preload: bool, allowlist: bool) -> Self {
        Self {
            name,
            min_version: min,
            max_version: max,
            preload,
            allowlist,
        }
    }

    pub fn supports(&self, version: f64) -> bool {
        self.min_version <= version && version <= self.max_version
    }

    fn eligible(&self, context: ExtensionContext) -> bool {
        match context {
            ExtensionContext::Preload => self.preload,
            ExtensionContext::Allowlist => self.allowlist,
        }
    }
}

/// Which configuration list is being filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionContext {
    /// `shared_preload_libraries`
    Preload,
    /// `extwlist.extensions`
    Allowlist,
}

const BASE_TABLE: &[ExtensionEntry] = &[
    ExtensionEntry::new("columnar", 13.0, 14.0, true, true),
    ExtensionEntry::new("pg_cron", 9.5, 15.0, true, true),
    ExtensionEntry::new("pg_stat_kcache", 9.4, 15.0, true, false),
    ExtensionEntry::new("pg_partman", 9.4, 15.0, false, true),
];

const PG_MON: ExtensionEntry = ExtensionEntry::new("pg_mon", 11.0, 15.0, true, false);

/// The extension table in iteration order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionTable {
    entries: Vec<ExtensionEntry>,
}

impl ExtensionTable {
    /// Table for this run; `ENABLE_PG_MON=true` adds `pg_mon`.
    pub fn from_env(env: &Environment) -> Self {
        Self::new(env.get("ENABLE_PG_MON") == Some("true"))
    }

    pub fn new(with_pg_mon: bool) -> Self {
        let mut entries = BASE_TABLE.to_vec();
        if with_pg_mon {
            entries.push(PG_MON);
        }
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&ExtensionEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Filter `existing` and append every eligible table entry.
    ///
    /// A name is kept when unknown to the table, or when `version` is in its
    /// range and it is eligible for `context`. Order is first-seen, without
    /// duplicates.
    pub fn append_extensions(&self, existing: &str, version: f64, context: ExtensionContext) -> String {
        let mut result: Vec<&str> = Vec::new();
        let candidates = split_names(existing).chain(self.entries.iter().map(|e| e.name));

        for name in candidates {
            if result.contains(&name) {
                continue;
            }
            let keep = match self.get(name) {
                None => true,
                Some(entry) => entry.supports(version) && entry.eligible(context),
            };
            if keep {
                result.push(name);
            }
        }
        result.join(",")
    }

    /// Filter `existing` without appending table entries.
    ///
    /// The eligibility flag is only consulted for the allowlist.
    pub fn adjust_extensions(&self, existing: &str, version: f64, context: ExtensionContext) -> String {
        let mut result: Vec<&str> = Vec::new();
        for name in split_names(existing) {
            if result.contains(&name) {
                continue;
            }
            let keep = match self.get(name) {
                None => true,
                Some(entry) => {
                    entry.supports(version)
                        && (context == ExtensionContext::Preload || entry.allowlist)
                }
            };
            if keep {
                result.push(name);
            }
        }
        result.join(",")
    }
}

fn split_names(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|name| !name.is_empty())
}
