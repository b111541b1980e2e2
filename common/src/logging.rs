//! Structured logging initialization
//!
//! Provides consistent logging initialization for the configuration tools.

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Guard that keeps the tracing subscriber active.
/// Drop this at the end of main to flush logs.
pub struct LogGuard;

/// Resolve the effective log level.
///
/// `debug` wins over an explicit level; unknown level names fall back to INFO.
pub fn resolve_level(debug: bool, requested: Option<&str>) -> Level {
    if debug {
        return Level::DEBUG;
    }
    match requested.map(|l| l.trim().to_uppercase()).as_deref() {
        Some("WARNING") => Level::WARN,
        Some("CRITICAL" | "FATAL") => Level::ERROR,
        Some(other) => other.parse().unwrap_or(Level::INFO),
        None => Level::INFO,
    }
}

/// Initialize structured logging for a component.
///
/// Returns a guard that should be held for the lifetime of the program.
///
/// # Example
/// ```ignore
/// let _guard = init_logging("configure-spilo", Level::INFO);
/// info!("Starting up...");
/// ```
pub fn init_logging(component: &str, level: Level) -> LogGuard {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let format = fmt::layer().with_target(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .init();

    tracing::debug!(component, "Logging initialized");
    LogGuard
}
