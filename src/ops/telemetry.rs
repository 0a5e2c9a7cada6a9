//! Structured logging setup.
//!
//! The library only emits `tracing` events. Binaries install a subscriber
//! with [`init_tracing`]; `RUST_LOG` overrides the configured level.

use crate::core::config::TelemetryConfig;

/// Install the global tracing subscriber if the telemetry feature is enabled.
///
/// Calling it twice is harmless: the second installation attempt is ignored.
#[cfg(feature = "telemetry")]
pub fn init_tracing(config: &TelemetryConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.log_format == "json" {
        registry
            .with(fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(not(feature = "telemetry"))]
pub fn init_tracing(_config: &TelemetryConfig) {}
