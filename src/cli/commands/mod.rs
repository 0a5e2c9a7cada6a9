//! CLI command implementations.

mod config;
mod diagnose;
mod list;

pub use config::{run_config, ConfigArgs};
pub use diagnose::{run_diagnose, DiagnoseArgs};
pub use list::{run_list, ListArgs};

use crate::core::config::Config;
use crate::ops::observability::MetricSink;
use crate::physical::Backend;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// Storage opened from a config file.
struct Storage {
    config: Config,
    /// Driver with the configured middleware on top.
    stack: Arc<dyn Backend>,
    /// Backend serving HA locks: `ha_storage` when configured, otherwise the
    /// primary driver if it has HA support.
    ha: Option<Arc<dyn Backend>>,
}

/// Load `path`, install logging, and open the configured storage.
async fn open_storage(
    path: &Path,
    log_level: Option<&str>,
    sink: Arc<dyn MetricSink>,
) -> Result<Storage> {
    let mut config = Config::from_file(path)
        .with_context(|| format!("failed to load config from {:?}", path))?;
    if let Some(level) = log_level {
        config.telemetry.log_level = level.to_string();
    }
    crate::ops::telemetry::init_tracing(&config.telemetry);

    let backend = crate::backends::new_backend(
        &config.storage.kind,
        &config.storage.options,
        sink.clone(),
    )
    .await
    .with_context(|| format!("failed to open {} storage", config.storage.kind))?;

    let ha = match config.ha_storage {
        Some(ref ha) => Some(
            crate::backends::new_backend(&ha.kind, &ha.options, sink.clone())
                .await
                .with_context(|| format!("failed to open {} ha_storage", ha.kind))?,
        ),
        None if backend.as_ha().is_some() => Some(backend.clone()),
        None => None,
    };

    let stack = crate::middleware::layer(backend, &config.middleware, sink)
        .context("failed to assemble middleware")?;
    Ok(Storage { config, stack, ha })
}
