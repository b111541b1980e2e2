//! Environment variable snapshot
//!
//! The process environment is captured once at startup and passed around
//! explicitly, so every derivation reads from the same immutable input.

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;

/// Values accepted as "on" for developer/debug style flags.
const TRUTHY: &[&str] = &["1", "true", "on"];

/// Immutable snapshot of environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Capture the current process environment.
    ///
    /// Variables that are not valid unicode are skipped.
    pub fn capture() -> Self {
        Self {
            vars: env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .collect(),
        }
    }

    /// Build a snapshot from explicit pairs.
    ///
    /// # Example
    /// ```ignore
    /// let env = Environment::from_pairs([("SCOPE", "demo"), ("PGPORT", "5433")]);
    /// ```
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Get a variable, if set (empty values included).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Get a variable with a default value.
    pub fn get_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get(name).unwrap_or(default)
    }

    /// Get a variable only when it is set to a non-empty value.
    pub fn non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.is_empty())
    }

    /// Whether the variable is present at all.
    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Whether the variable is present with a non-empty value.
    pub fn is_set(&self, name: &str) -> bool {
        self.non_empty(name).is_some()
    }

    /// Whether the variable holds one of `1`, `true`, `on` (case-insensitive).
    pub fn flag(&self, name: &str) -> bool {
        self.get(name)
            .map(|v| TRUTHY.contains(&v.to_lowercase().as_str()))
            .unwrap_or(false)
    }

    /// Get a variable parsed as a specific type.
    ///
    /// Returns `default` if the variable is not set or fails to parse.
    pub fn parse<T: FromStr>(&self, name: &str, default: T) -> T {
        self.get(name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Iterate over all captured variables in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
