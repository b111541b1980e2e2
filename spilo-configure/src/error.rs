//! Error type for configuration derivation

use thiserror::Error;

/// Errors raised while deriving the configuration document.
#[derive(Debug, Error)]
pub enum ConfigureError {
    #[error("placeholder {key} is not a {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    #[error("placeholder {0} is not set")]
    MissingPlaceholder(String),

    #[error("failed to render configuration template: {0}")]
    Render(#[from] handlebars::RenderError),

    #[error("failed to parse {what} as YAML: {source}")]
    Yaml {
        what: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{var} should contain a mapping, yet it is a {found}")]
    OverrideNotMapping { var: String, found: &'static str },

    #[error("instance metadata unavailable: {0}")]
    Metadata(#[from] crate::metadata::MetadataError),

    #[error("no valid PostgreSQL version found: {0}")]
    Version(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigureError>;
