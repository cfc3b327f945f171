//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise the configured `application.log_level`
//! applies. Output is human-readable or one JSON object per line.

use crate::config::{ApplicationConfig, LogFormat};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

/// Build the filter from `RUST_LOG`, falling back to the configured level.
pub fn filter_for(config: &ApplicationConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(config: &ApplicationConfig) {
    let fmt_layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .with_target(false)
            .json()
            .with_current_span(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer().with_target(true).boxed(),
    };

    let installed = tracing_subscriber::registry()
        .with(filter_for(config))
        .with(fmt_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(
            "Logging initialised for '{}' ({:?})",
            config.name,
            config.log_format
        );
    }
}
