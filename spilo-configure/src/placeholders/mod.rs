//! Placeholder mapping
//!
//! The placeholder mapping is the single input of the configuration
//! template. It is seeded from the environment snapshot, completed with
//! set-if-absent defaults and then overwritten by derived values:
//! - `value`: the string | bool | integer | nested-map value type
//! - `storage`: storage backend identification and backup tool selection
//! - `derive`: the ordered derivation pipeline

mod derive;
mod storage;
mod value;

pub use derive::{derive_placeholders, DerivationInput, KUBERNETES_DEFAULT_LABELS};
pub use storage::{
    identify_storage, select_backup_tool, StorageBackend, StoragePrefix, AUTO_ENABLE_WALG_RESTORE,
    WALG_SSH_NAMES,
};
pub use value::PlaceholderValue;

use crate::error::{ConfigureError, Result};
use common::Environment;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::BTreeMap;

/// String-keyed mapping of configuration variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Placeholders {
    values: BTreeMap<String, PlaceholderValue>,
}

impl Placeholders {
    /// Seed a mapping with every variable of the environment snapshot.
    pub fn from_env(env: &Environment) -> Self {
        Self {
            values: env
                .iter()
                .map(|(k, v)| (k.to_string(), PlaceholderValue::from(v)))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&PlaceholderValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Overwrite a value unconditionally.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<PlaceholderValue>) {
        self.values.insert(key.into(), value.into());
    }

    /// Insert a value only when the key is absent.
    pub fn set_default(&mut self, key: impl Into<String>, value: impl Into<PlaceholderValue>) {
        self.values.entry(key.into()).or_insert_with(|| value.into());
    }

    /// Truthiness of a value; absent keys are falsy.
    pub fn truthy(&self, key: &str) -> bool {
        self.get(key).is_some_and(PlaceholderValue::is_truthy)
    }

    /// Scalar value rendered as text, `None` when absent or a mapping.
    pub fn text(&self, key: &str) -> Option<Cow<'_, str>> {
        self.get(key).and_then(PlaceholderValue::as_text)
    }

    /// Scalar value as text, only when truthy.
    pub fn non_empty(&self, key: &str) -> Option<Cow<'_, str>> {
        self.get(key)
            .filter(|v| v.is_truthy())
            .and_then(PlaceholderValue::as_text)
    }

    /// Scalar value as text, empty when absent.
    pub fn text_or_empty(&self, key: &str) -> String {
        self.text(key).map(Cow::into_owned).unwrap_or_default()
    }

    /// Strict string accessor: fails when absent or not a string.
    pub fn str(&self, key: &str) -> Result<&str> {
        match self.get(key) {
            Some(PlaceholderValue::Str(s)) => Ok(s),
            Some(_) => Err(ConfigureError::TypeMismatch {
                key: key.to_string(),
                expected: "string",
            }),
            None => Err(ConfigureError::MissingPlaceholder(key.to_string())),
        }
    }

    /// Strict scalar accessor: any non-mapping value rendered as text.
    pub fn require_text(&self, key: &str) -> Result<String> {
        match self.get(key) {
            Some(v) => v
                .as_text()
                .map(Cow::into_owned)
                .ok_or_else(|| ConfigureError::TypeMismatch {
                    key: key.to_string(),
                    expected: "scalar",
                }),
            None => Err(ConfigureError::MissingPlaceholder(key.to_string())),
        }
    }

    /// Nested mapping under `key`, created when absent.
    pub fn map_mut(&mut self, key: &str) -> Result<&mut BTreeMap<String, PlaceholderValue>> {
        let entry = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| PlaceholderValue::Map(BTreeMap::new()));
        match entry {
            PlaceholderValue::Map(map) => Ok(map),
            _ => Err(ConfigureError::TypeMismatch {
                key: key.to_string(),
                expected: "mapping",
            }),
        }
    }

    /// Iterate over all placeholders in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PlaceholderValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Follow a dotted path through nested mappings.
    pub fn lookup(&self, path: &str) -> Option<&PlaceholderValue> {
        let mut parts = path.split('.');
        let mut current = self.get(parts.next()?)?;
        for part in parts {
            match current {
                PlaceholderValue::Map(map) => current = map.get(part)?,
                _ => return None,
            }
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_default_keeps_existing() {
        let mut p = Placeholders::from_env(&Environment::from_pairs([("PGPORT", "6432")]));
        p.set_default("PGPORT", "5432");
        p.set_default("APIPORT", "8008");
        assert_eq!(p.str("PGPORT").unwrap(), "6432");
        assert_eq!(p.str("APIPORT").unwrap(), "8008");
    }

    #[test]
    fn test_strict_accessors_report_mismatch() {
        let mut p = Placeholders::default();
        p.set("FLAG", true);
        assert!(matches!(
            p.str("FLAG"),
            Err(ConfigureError::TypeMismatch { .. })
        ));
        assert!(matches!(
            p.str("NOPE"),
            Err(ConfigureError::MissingPlaceholder(_))
        ));
        assert_eq!(p.require_text("FLAG").unwrap(), "true");
    }

    #[test]
    fn test_map_mut_rejects_scalars() {
        let mut p = Placeholders::default();
        p.set("postgresql", "oops");
        assert!(p.map_mut("postgresql").is_err());

        p.map_mut("instance_data")
            .unwrap()
            .insert("id".to_string(), "i-1".into());
        assert_eq!(
            p.lookup("instance_data.id"),
            Some(&PlaceholderValue::from("i-1"))
        );
        assert_eq!(p.lookup("instance_data.missing"), None);
    }

    #[test]
    fn test_truthiness_follows_value_kind() {
        let mut p = Placeholders::default();
        p.set("EMPTY", "");
        p.set("ZERO", 0);
        p.set("TEXT", "false");
        assert!(!p.truthy("EMPTY"));
        assert!(!p.truthy("ZERO"));
        assert!(p.truthy("TEXT"));
        assert!(!p.truthy("ABSENT"));
        assert_eq!(p.non_empty("EMPTY"), None);
    }
}
