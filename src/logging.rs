//! Structured logging setup.
//!
//! The library itself only emits `tracing` events; this module is the
//! opt-in subscriber initialization for binaries and tests embedding the
//! engine. Level precedence: `HTM_LOG_LEVEL`, then `RUST_LOG`, then the
//! configured default.

use once_cell::sync::OnceCell;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

static INITIALIZED: OnceCell<()> = OnceCell::new();

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when no environment filter is set.
    pub level: Level,
    /// Emit JSON-structured lines instead of human-readable output.
    pub json_format: bool,
    /// Include event targets in output.
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            with_target: true,
        }
    }
}

/// Initialize the global tracing subscriber. Safe to call more than
/// once; only the first call installs a subscriber.
pub fn initialize_logging(config: &LoggingConfig) {
    INITIALIZED.get_or_init(|| {
        let filter = std::env::var("HTM_LOG_LEVEL")
            .or_else(|_| std::env::var("RUST_LOG"))
            .map(|directives| EnvFilter::new(directives))
            .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

        let builder = fmt()
            .with_env_filter(filter)
            .with_target(config.with_target);
        if config.json_format {
            let _ = builder.json().try_init();
        } else {
            let _ = builder.try_init();
        }
    });
}
