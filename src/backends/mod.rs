//! Storage drivers.
//!
//! - [`inmem`] - Reference in-memory backend with fault toggles
//! - [`inmem_ha`] - In-memory backend with sessioned HA locks
//! - [`file`] - Local filesystem, one JSON file per key
//! - [`sql`] - SQLite through sqlx, native transactions and lease locks
//! - [`object`] - Object stores (memory, local, S3) through object_store
//! - [`pathkv`] - Embedded redb store with directory-decorated keys
//!
//! [`new_backend`] builds any of them from a driver name and options.

pub mod file;
pub mod inmem;
pub mod inmem_ha;
#[cfg(feature = "object-store")]
pub mod object;
pub mod pathkv;
#[cfg(feature = "sql")]
pub mod sql;

use crate::core::config::DriverConfig;
use crate::core::error::{PhysicalError, PhysicalResult};
use crate::ops::observability::MetricSink;
use crate::physical::Backend;
use std::sync::Arc;

pub use file::FileBackend;
pub use inmem::InmemBackend;
pub use inmem_ha::InmemHABackend;
#[cfg(feature = "object-store")]
pub use object::ObjectBackend;
pub use pathkv::PathKvBackend;
#[cfg(feature = "sql")]
pub use sql::SqlBackend;

/// Driver names accepted by [`new_backend`].
pub const BACKEND_TYPES: &[&str] = &[
    "inmem",
    "inmem_transactional",
    "inmem_ha",
    "inmem_transactional_ha",
    "file",
    "file_transactional",
    "sql",
    "object",
    "pathkv",
];

/// Whether `kind` names a driver this build knows about.
pub fn is_known_backend(kind: &str) -> bool {
    BACKEND_TYPES.contains(&kind)
}

/// Build the driver named `kind` from its options.
pub async fn new_backend(
    kind: &str,
    conf: &DriverConfig,
    sink: Arc<dyn MetricSink>,
) -> PhysicalResult<Arc<dyn Backend>> {
    tracing::debug!(backend = kind, "constructing storage backend");
    let backend: Arc<dyn Backend> = match kind {
        "inmem" => Arc::new(InmemBackend::new(conf, sink)?),
        "inmem_transactional" => Arc::new(InmemBackend::new_transactional(conf, sink)?),
        "inmem_ha" => Arc::new(InmemHABackend::new(conf, sink)?),
        "inmem_transactional_ha" => Arc::new(InmemHABackend::new_transactional(conf, sink)?),
        "file" => Arc::new(FileBackend::new(conf, sink)?),
        "file_transactional" => Arc::new(FileBackend::new_transactional(conf, sink)?),
        "pathkv" => Arc::new(PathKvBackend::new(conf, sink)?),
        #[cfg(feature = "sql")]
        "sql" => Arc::new(SqlBackend::new(conf, sink).await?),
        #[cfg(feature = "object-store")]
        "object" => Arc::new(ObjectBackend::new(conf, sink)?),
        other if is_known_backend(other) => {
            return Err(PhysicalError::unsupported(format!(
                "backend {} (not compiled into this build)",
                other
            )))
        }
        other => {
            return Err(PhysicalError::config(
                "type",
                format!("unknown backend {}", other),
            ))
        }
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::Context;
    use crate::ops::observability::noop_sink;
    use crate::physical::Entry;

    #[tokio::test]
    async fn factory_builds_inmem() {
        let b = new_backend("inmem_transactional", &DriverConfig::new(), noop_sink())
            .await
            .unwrap();
        assert!(b.as_transactional().is_some());
        b.put(&Context::background(), Entry::new("a", "b"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn factory_rejects_unknown() {
        let err = new_backend("floppy", &DriverConfig::new(), noop_sink())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PhysicalError::Config { .. }));
        assert!(!is_known_backend("floppy"));
        assert!(is_known_backend("pathkv"));
    }
}
