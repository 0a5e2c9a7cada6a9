//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use stratum::backends::{FileBackend, InmemBackend, InmemHABackend};
use stratum::core::config::DriverConfig;
use stratum::ha::LeaseConfig;
use stratum::ops::observability::{noop_sink, MetricSink};
use tempfile::{NamedTempFile, TempDir};

/// Lease timing short enough for handoff tests.
pub fn fast_lease() -> LeaseConfig {
    LeaseConfig {
        ttl: Duration::from_millis(600),
        renew_interval: Duration::from_millis(100),
        retry_interval: Duration::from_millis(20),
        watch_interval: Duration::from_millis(100),
    }
}

/// Driver options enabling HA with [`fast_lease`] timing.
pub fn fast_ha_options() -> DriverConfig {
    DriverConfig::from_pairs([
        ("ha_enabled", "true"),
        ("lock_ttl", "600ms"),
        ("lock_renew_interval", "100ms"),
        ("lock_retry_interval", "20ms"),
        ("lock_watch_interval", "100ms"),
    ])
}

pub fn sink() -> Arc<dyn MetricSink> {
    noop_sink()
}

/// Plain in-memory backend.
pub fn inmem() -> InmemBackend {
    InmemBackend::new(&DriverConfig::new(), sink()).expect("inmem backend")
}

/// Transactional in-memory backend.
pub fn inmem_transactional() -> InmemBackend {
    InmemBackend::new_transactional(&DriverConfig::new(), sink()).expect("inmem backend")
}

/// In-memory backend with lease HA.
pub fn inmem_ha() -> InmemBackend {
    InmemBackend::new(&fast_ha_options(), sink()).expect("inmem ha backend")
}

/// In-memory backend with session locks.
pub fn inmem_sessioned() -> InmemHABackend {
    InmemHABackend::new(&DriverConfig::new(), sink()).expect("inmem session backend")
}

/// File backend rooted in a fresh temp directory. Keep the guard alive.
pub fn file_backend(transactional: bool) -> (TempDir, FileBackend) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let conf = DriverConfig::from_pairs([("path", dir.path().to_string_lossy().into_owned())]);
    let backend = if transactional {
        FileBackend::new_transactional(&conf, sink())
    } else {
        FileBackend::new(&conf, sink())
    }
    .expect("file backend");
    (dir, backend)
}

/// Write `content` to a temp config file.
pub fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Create a minimal valid configuration file.
pub fn create_minimal_config() -> NamedTempFile {
    config_file(
        r#"
[storage]
type = "inmem"
"#,
    )
}

/// Configuration with a file backend rooted at `storage_dir`.
pub fn create_file_config(storage_dir: &str) -> NamedTempFile {
    config_file(&format!(
        r#"
[storage]
type = "file"
[storage.options]
path = "{}"
max_parallel = 16

[middleware]
codec = "md5"
cache_enabled = true
"#,
        storage_dir
    ))
}

/// Poll `cond` every 10ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
