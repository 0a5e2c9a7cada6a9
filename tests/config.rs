//! Configuration tests.

mod common;

use std::time::Duration;
use stratum::backends::new_backend;
use stratum::core::config::Config;
use stratum::core::context::Context;
use stratum::physical::Entry;

// ============================================================================
// Parsing
// ============================================================================

#[test]
fn parse_minimal_config() {
    let file = common::create_minimal_config();
    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.storage.kind, "inmem");
    assert!(config.ha_storage.is_none());
    assert!(config.service_registration.is_none());
    assert_eq!(config.middleware.codec, "identity");
    assert!(config.middleware.cache_enabled);
    assert_eq!(config.telemetry.log_level, "info");
}

#[test]
fn parse_full_config() {
    let config = Config::from_toml(
        r#"
[storage]
type = "file"
[storage.options]
path = "/var/lib/stratum"
max_parallel = 64
consistency_mode = "strong"

[ha_storage]
type = "sql"
[ha_storage.options]
path = "/var/lib/stratum/ha.db"
ha_enabled = true
lock_ttl = "15s"

[service_registration]
type = "inmem"
[service_registration.options]
service = "stratum"
service_tags = "east,primary"
check_timeout = "5s"

[middleware]
view_prefix = "core/"
codec = "gzip"
cache_size = 1024
cache_exclude_prefixes = ["hot/"]

[telemetry]
log_level = "debug"
log_format = "json"
"#,
    )
    .unwrap();

    assert_eq!(config.storage.options.max_parallel().unwrap(), 64);
    assert!(config.storage.options.strong_consistency().unwrap());
    let ha = config.ha_storage.unwrap();
    assert_eq!(ha.kind, "sql");
    assert_eq!(
        ha.options.duration("lock_ttl").unwrap(),
        Some(Duration::from_secs(15))
    );
    assert_eq!(config.middleware.cache_exclude_prefixes, vec!["hot/"]);
    assert_eq!(config.telemetry.log_format, "json");
}

// ============================================================================
// Validation
// ============================================================================

fn rejected(toml: &str, needle: &str) {
    let err = Config::from_toml(toml).unwrap_err();
    let chain = format!("{:#}", err);
    assert!(chain.contains(needle), "{:?} not in {:?}", needle, chain);
}

#[test]
fn validate_rejects_bad_values() {
    rejected("[storage]\ntype = \"floppy\"\n", "storage.type");
    rejected(
        "[storage]\ntype = \"inmem\"\n[storage.options]\nmax_parallel = \"lots\"\n",
        "max_parallel",
    );
    rejected(
        "[storage]\ntype = \"inmem\"\n[storage.options]\nconsistency_mode = \"eventual\"\n",
        "consistency_mode",
    );
    rejected(
        "[storage]\ntype = \"inmem\"\n[middleware]\ncodec = \"rot13\"\n",
        "middleware.codec",
    );
    rejected(
        "[storage]\ntype = \"inmem\"\n[middleware]\nview_prefix = \"../x/\"\n",
        "view_prefix",
    );
    rejected(
        "[storage]\ntype = \"inmem\"\n[telemetry]\nlog_level = \"loud\"\n",
        "log_level",
    );
    rejected(
        "[storage]\ntype = \"inmem\"\n[service_registration]\ntype = \"consul\"\n",
        "service_registration.type",
    );
    rejected(
        "[storage]\ntype = \"inmem\"\n[service_registration]\ntype = \"inmem\"\n[service_registration.options]\ncheck_timeout = \"10ms\"\n",
        "check_timeout",
    );
}

#[test]
fn missing_file_is_an_error() {
    let err = Config::from_file(std::path::Path::new("/nonexistent/stratum.toml")).unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));
}

// ============================================================================
// Assembly
// ============================================================================

#[tokio::test]
async fn config_builds_a_working_stack() {
    let dir = tempfile::TempDir::new().unwrap();
    let file = common::create_file_config(&dir.path().to_string_lossy());
    let config = Config::from_file(file.path()).unwrap();

    let backend = new_backend(&config.storage.kind, &config.storage.options, common::sink())
        .await
        .unwrap();
    let stack = stratum::middleware::layer(backend.clone(), &config.middleware, common::sink())
        .unwrap();
    let ctx = Context::background();

    stack.put(&ctx, Entry::new("a/b", "v")).await.unwrap();
    assert_eq!(stack.get(&ctx, "a/b").await.unwrap().unwrap().value, b"v");

    // The md5 codec wraps what reaches the driver.
    let raw = backend.get(&ctx, "a/b").await.unwrap().unwrap();
    assert_ne!(raw.value, b"v");
    assert!(dir.path().join("a").is_dir());
}
