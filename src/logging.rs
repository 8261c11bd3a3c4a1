//! Logging and tracing initialization.
//!
//! Console output by default, JSON lines with `--log-json`. Connection
//! handling runs inside `conn` spans, so every event for one connection
//! carries its id.

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Configuration for the logging system.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// Output logs as JSON (for machine parsing)
    pub json: bool,
    /// Enable verbose logging (sets default level to DEBUG)
    pub verbose: bool,
}

/// Filter used when `RUST_LOG` is not set.
pub fn default_directive(verbose: bool) -> String {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    format!("uhttpd_gw={}", level.as_str().to_lowercase())
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the level chosen by `verbose`. Calling this twice
/// is harmless; the second call leaves the first subscriber in place.
pub fn init(config: LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config.verbose)));

    let result = if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init()
    };

    if let Err(e) = result {
        eprintln!("logging already initialised: {}", e);
    }
}
