//! Shared utilities for the Spilo configuration tools
//!
//! This crate provides common functionality used by the configuration binaries:
//! - Structured logging initialization
//! - Immutable environment snapshot with typed accessors
//! - Command execution utilities

pub mod command;
pub mod config;
pub mod logging;

pub use config::Environment;
pub use logging::{init_logging, resolve_level};
