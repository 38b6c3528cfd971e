//! Structured logging setup for callcore engines and tools

use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format for the global subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line (production)
    Json,
    /// Human-readable lines (development)
    Console,
}

impl LogFormat {
    /// Parse a format name, falling back to console output
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Console,
        }
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize structured logging
///
/// This sets up:
/// - JSON formatted logs (for production)
/// - Environment-based log level filtering (`RUST_LOG`)
/// - Service name tagging
///
/// Calling it a second time in the same process is a no-op.
pub fn init_logging(service_name: &str, default_level: &str) {
    let installed = tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_current_span(false)
                .with_span_list(false),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(service = service_name, "Logging initialized");
    }
}

/// Initialize simple console logging (for development and the demo CLI)
pub fn init_console_logging(service_name: &str, default_level: &str) {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(service = service_name, "Console logging initialized");
    }
}

/// Initialize logging in the requested format
pub fn init_with_format(format: LogFormat, service_name: &str, default_level: &str) {
    match format {
        LogFormat::Json => init_logging(service_name, default_level),
        LogFormat::Console => init_console_logging(service_name, default_level),
    }
}
