//! Logging setup for the server binary.
//!
//! Log output goes through `tracing-subscriber`:
//! - `RUST_LOG` selects levels (default: `info,hearth_server=debug,hearth_xmpp=debug`)
//! - `HEARTH_LOG_FORMAT=json` switches to one JSON object per line;
//!   anything else (or unset) gives human-readable output
//!
//! Metrics are recorded through the global OpenTelemetry meter by
//! `hearth_xmpp::metrics`; without an installed provider they are no-ops.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,hearth_server=debug,hearth_xmpp=debug";

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// Format named by `value`, defaulting to pretty output.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }

    /// Format selected by `HEARTH_LOG_FORMAT`.
    pub fn from_env() -> Self {
        Self::parse(std::env::var("HEARTH_LOG_FORMAT").ok().as_deref())
    }
}

/// Install the global subscriber.
pub fn init(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (json_layer, pretty_layer) = match format {
        LogFormat::Json => (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            ),
            None,
        ),
        LogFormat::Pretty => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()?;

    tracing::info!(format = ?format, "Logging initialized");
    Ok(())
}
