//! Placeholder value type

use serde::Serialize;
use std::borrow::Cow;
use std::collections::BTreeMap;

/// A single placeholder value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PlaceholderValue {
    Str(String),
    Bool(bool),
    Int(i64),
    List(Vec<PlaceholderValue>),
    Map(BTreeMap<String, PlaceholderValue>),
}

impl PlaceholderValue {
    /// Empty strings, `false`, `0`, empty lists and empty mappings are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Str(s) => !s.is_empty(),
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::List(l) => !l.is_empty(),
            Self::Map(m) => !m.is_empty(),
        }
    }

    /// Scalars rendered as text; booleans become `true`/`false`.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Str(s) => Some(Cow::Borrowed(s)),
            Self::Bool(b) => Some(Cow::Owned(b.to_string())),
            Self::Int(i) => Some(Cow::Owned(i.to_string())),
            Self::List(_) | Self::Map(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Bool(_) => "bool",
            Self::Int(_) => "integer",
            Self::List(_) => "list",
            Self::Map(_) => "mapping",
        }
    }
}

impl From<&str> for PlaceholderValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for PlaceholderValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for PlaceholderValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for PlaceholderValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for PlaceholderValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u64> for PlaceholderValue {
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl<T: Into<PlaceholderValue>> From<Vec<T>> for PlaceholderValue {
    fn from(value: Vec<T>) -> Self {
        Self::List(value.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, PlaceholderValue>> for PlaceholderValue {
    fn from(value: BTreeMap<String, PlaceholderValue>) -> Self {
        Self::Map(value)
    }
}
