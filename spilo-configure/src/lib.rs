//! Bootstrap configuration for PostgreSQL managed by Patroni
//!
//! Derives the placeholder mapping from the environment and cloud metadata,
//! renders the Patroni document and writes the companion files the
//! container's supervised services read at start.

pub mod dcs;
pub mod document;
pub mod error;
pub mod extensions;
pub mod memory;
pub mod merge;
pub mod metadata;
pub mod paths;
pub mod placeholders;
pub mod provider;
pub mod sections;
pub mod system;
pub mod template;
pub mod version;
pub mod writers;

pub use error::{ConfigureError, Result};
