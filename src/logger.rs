//! Centralized logging configuration for apex-mapper consumers.
//!
//! Provides a consistent tracing-subscriber setup with a default INFO level
//! that can be overridden through the `RUST_LOG` environment variable.

use tracing::Level;

/// Initialize the tracing subscriber with the standard configuration.
///
/// Default log level: INFO (overrideable via `RUST_LOG`).
///
/// # Example
/// ```no_run
/// use apex_mapper::init_logger;
///
/// init_logger();
/// tracing::info!("backend started");
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level.
///
/// # Example
/// ```no_run
/// use apex_mapper::init_logger_with_level;
/// use tracing::Level;
///
/// init_logger_with_level(Level::DEBUG);
/// ```
pub fn init_logger_with_level(default_level: Level) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();
}
