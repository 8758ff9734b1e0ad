//! Structured logging setup.
//!
//! Thin initialization layer over `tracing-subscriber`: level filtering via
//! `RUST_LOG` (falling back to a configured default), pretty or compact
//! output. The pipeline components log through `tracing` macros with
//! structured fields; embedding applications call [`init`] once at startup.

use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// Output format for log lines.
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Pretty-printed format with colors, for development.
    Pretty,
    /// Compact single-line format, for production.
    Compact,
}

/// Logging configuration options.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Default level used when `RUST_LOG` is unset.
    pub level: Level,
    /// Output format.
    pub format: OutputFormat,
    /// Whether to enable ANSI colors.
    pub with_ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_ansi: true,
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Returns an error string if a subscriber was already installed, which is
/// harmless in tests and worth surfacing in applications.
pub fn init(config: &TelemetryConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    let builder = fmt()
        .with_env_filter(filter)
        .with_ansi(config.with_ansi)
        .with_target(true);

    let result = match config.format {
        OutputFormat::Pretty => builder.pretty().try_init(),
        OutputFormat::Compact => builder.compact().try_init(),
    };
    result.map_err(|e| e.to_string())
}
