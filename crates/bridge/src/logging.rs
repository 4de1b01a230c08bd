//! Process-wide logging.
//!
//! Everything goes to stderr; stdout belongs to the MCP transport. The
//! filter sits behind a reload handle so a hot config reload that changes
//! `logLevel` takes effect everywhere at once.

use crate::config::{LogFormat, LogLevel};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

/// Handle for adjusting the log level at runtime.
#[derive(Clone)]
pub struct LoggingHandle {
    reload: reload::Handle<EnvFilter, Registry>,
}

impl LoggingHandle {
    pub fn set_level(&self, level: LogLevel) {
        let filter = filter_for(level);
        if let Err(e) = self.reload.reload(filter) {
            tracing::warn!(error = %e, "failed to update log level");
        } else {
            tracing::info!(level = level.as_str(), "log level changed");
        }
    }
}

fn filter_for(level: LogLevel) -> EnvFilter {
    // RUST_LOG still wins for debugging individual modules.
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init(level: LogLevel, format: LogFormat) -> LoggingHandle {
    let (filter, handle) = reload::Layer::new(filter_for(level));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => {
            registry
                .with(
                    fmt::layer()
                        .compact()
                        .with_writer(std::io::stderr)
                        .with_target(false),
                )
                .init();
        }
        LogFormat::Json => {
            registry
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
    }

    LoggingHandle { reload: handle }
}
