//! Configuration parsing and validation.
//!
//! Application configuration is loaded from TOML files. Each storage section
//! names a driver `type` and carries a free-form `options` table which is
//! handed to the driver as a [`DriverConfig`]; drivers coerce the values they
//! need through [`crate::core::parseutil`].

use crate::core::error::{PhysicalError, PhysicalResult};
use crate::core::parseutil;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Primary storage backend.
    pub storage: StorageConfig,

    /// Separate backend for HA locking (defaults to `storage`).
    #[serde(default)]
    pub ha_storage: Option<StorageConfig>,

    /// Service registration (discovery catalog) settings.
    #[serde(default)]
    pub service_registration: Option<ServiceRegistrationConfig>,

    /// Middleware applied on top of the primary backend.
    #[serde(default)]
    pub middleware: MiddlewareConfig,

    /// Logging configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// A storage section: driver type plus driver options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Driver name, e.g. "inmem", "file", "sql".
    #[serde(rename = "type")]
    pub kind: String,

    /// Driver options.
    #[serde(default)]
    pub options: DriverConfig,
}

/// Service registration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRegistrationConfig {
    /// Catalog type. Only "inmem" ships with the crate.
    #[serde(rename = "type")]
    pub kind: String,

    /// Registrar options (`service`, `service_tags`, `check_timeout`, ...).
    #[serde(default)]
    pub options: DriverConfig,
}

/// Middleware stack settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    /// Prefix applied by a view layer; empty disables the view.
    #[serde(default)]
    pub view_prefix: String,

    /// Value codec: "identity", "gzip" or "md5".
    #[serde(default = "default_codec")]
    pub codec: String,

    /// Enable the read cache.
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,

    /// Cache capacity in entries.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Key prefixes never cached.
    #[serde(default)]
    pub cache_exclude_prefixes: Vec<String>,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            view_prefix: String::new(),
            codec: default_codec(),
            cache_enabled: default_cache_enabled(),
            cache_size: default_cache_size(),
            cache_exclude_prefixes: Vec::new(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "text" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// Default value functions

fn default_codec() -> String {
    "identity".to_string()
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_size() -> usize {
    crate::middleware::cache::DEFAULT_CACHE_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_storage("storage", &self.storage)?;
        if let Some(ref ha) = self.ha_storage {
            self.validate_storage("ha_storage", ha)?;
        }
        self.validate_registration()?;
        self.validate_middleware()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_storage(&self, section: &str, storage: &StorageConfig) -> Result<()> {
        if !crate::backends::is_known_backend(&storage.kind) {
            anyhow::bail!(
                "{}.type must be one of {:?}, got: {}",
                section,
                crate::backends::BACKEND_TYPES,
                storage.kind
            );
        }

        for key in ["max_parallel", "max_value_size"] {
            storage
                .options
                .usize(key)
                .with_context(|| format!("{}.options.{}", section, key))?;
        }
        storage
            .options
            .bool("ha_enabled")
            .with_context(|| format!("{}.options.ha_enabled", section))?;

        if let Some(mode) = storage
            .options
            .string("consistency_mode")
            .with_context(|| format!("{}.options.consistency_mode", section))?
        {
            if mode != "default" && mode != "strong" {
                anyhow::bail!(
                    "{}.options.consistency_mode must be 'default' or 'strong', got: {}",
                    section,
                    mode
                );
            }
        }
        Ok(())
    }

    fn validate_registration(&self) -> Result<()> {
        let Some(ref reg) = self.service_registration else {
            return Ok(());
        };
        if reg.kind != "inmem" {
            anyhow::bail!(
                "service_registration.type must be 'inmem', got: {}",
                reg.kind
            );
        }
        crate::registration::RegistrationConfig::from_options(&reg.options)
            .context("service_registration.options")?;
        Ok(())
    }

    fn validate_middleware(&self) -> Result<()> {
        let codecs = ["identity", "gzip", "md5"];
        if !codecs.contains(&self.middleware.codec.as_str()) {
            anyhow::bail!(
                "middleware.codec must be one of {:?}, got: {}",
                codecs,
                self.middleware.codec
            );
        }
        if self.middleware.cache_enabled && self.middleware.cache_size == 0 {
            anyhow::bail!("middleware.cache_size must be > 0 when the cache is enabled");
        }
        if self.middleware.view_prefix.contains("..") {
            anyhow::bail!("middleware.view_prefix cannot contain '..'");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.telemetry.log_format.as_str()) {
            anyhow::bail!(
                "telemetry.log_format must be one of {:?}, got: {}",
                valid_formats,
                self.telemetry.log_format
            );
        }
        Ok(())
    }
}

// ============================================================================
// Driver options
// ============================================================================

/// Free-form driver options keyed by canonical option names.
///
/// Values keep the shape they were written in (string, number, bool) and are
/// coerced on access.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverConfig {
    values: BTreeMap<String, Value>,
}

impl DriverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from string pairs, the common shape in tests.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), Value::String(v.into())))
                .collect(),
        }
    }

    /// Set an option, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn raw(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Coerce an option with `parse`, mapping failures to a Config error.
    fn parsed<T>(
        &self,
        key: &str,
        parse: impl Fn(&Value) -> Result<T, parseutil::ParseError>,
    ) -> PhysicalResult<Option<T>> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => parse(value)
                .map(Some)
                .map_err(|e| PhysicalError::config(key, e.to_string())),
        }
    }

    pub fn string(&self, key: &str) -> PhysicalResult<Option<String>> {
        self.parsed(key, parseutil::parse_string)
    }

    /// A string option that must be present and non-empty.
    pub fn require_string(&self, key: &str) -> PhysicalResult<String> {
        match self.string(key)? {
            Some(s) if !s.is_empty() => Ok(s),
            _ => Err(PhysicalError::config(key, "is required")),
        }
    }

    pub fn int(&self, key: &str) -> PhysicalResult<Option<i64>> {
        self.parsed(key, parseutil::parse_int)
    }

    pub fn usize(&self, key: &str) -> PhysicalResult<Option<usize>> {
        self.parsed(key, parseutil::parse_usize)
    }

    pub fn bool(&self, key: &str) -> PhysicalResult<Option<bool>> {
        self.parsed(key, parseutil::parse_bool)
    }

    /// Boolean option with a default when absent.
    pub fn bool_or(&self, key: &str, default: bool) -> PhysicalResult<bool> {
        Ok(self.bool(key)?.unwrap_or(default))
    }

    pub fn duration(&self, key: &str) -> PhysicalResult<Option<Duration>> {
        self.parsed(key, parseutil::parse_duration)
    }

    pub fn strings(&self, key: &str) -> PhysicalResult<Option<Vec<String>>> {
        self.parsed(key, parseutil::parse_comma_strings)
    }

    pub fn bytes(&self, key: &str) -> PhysicalResult<Option<Vec<u8>>> {
        self.parsed(key, parseutil::parse_bytes)
    }

    /// `max_parallel` with zero or absence meaning the permit pool default.
    pub fn max_parallel(&self) -> PhysicalResult<usize> {
        Ok(self.usize("max_parallel")?.unwrap_or(0))
    }

    /// `consistency_mode`, validated; `true` when set to "strong".
    pub fn strong_consistency(&self) -> PhysicalResult<bool> {
        match self.string("consistency_mode")?.as_deref() {
            None | Some("default") | Some("") => Ok(false),
            Some("strong") => Ok(true),
            Some(other) => Err(PhysicalError::config(
                "consistency_mode",
                format!("must be 'default' or 'strong', got: {}", other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[storage]
type = "file"
[storage.options]
path = "/tmp/stratum"
max_parallel = 64
ha_enabled = "false"

[middleware]
codec = "gzip"

[telemetry]
log_level = "debug"
"#;

    #[test]
    fn parses_sample() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.storage.kind, "file");
        assert_eq!(config.storage.options.max_parallel().unwrap(), 64);
        assert_eq!(
            config.storage.options.bool("ha_enabled").unwrap(),
            Some(false)
        );
        assert_eq!(config.middleware.codec, "gzip");
        assert!(config.middleware.cache_enabled);
        assert_eq!(config.telemetry.log_format, "text");
        assert!(config.ha_storage.is_none());
    }

    #[test]
    fn rejects_unknown_backend() {
        let err = Config::from_toml("[storage]\ntype = \"floppy\"\n").unwrap_err();
        assert!(err.to_string().contains("storage.type"));
    }

    #[test]
    fn rejects_bad_consistency_mode() {
        let toml = r#"
[storage]
type = "inmem"
[storage.options]
consistency_mode = "eventual"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn rejects_bad_codec() {
        let toml = r#"
[storage]
type = "inmem"
[middleware]
codec = "rot13"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn driver_config_coercions() {
        let conf = DriverConfig::from_pairs([
            ("max_parallel", "12"),
            ("check_timeout", "1m"),
            ("service_tags", "a,b"),
        ]);
        assert_eq!(conf.max_parallel().unwrap(), 12);
        assert_eq!(
            conf.duration("check_timeout").unwrap(),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            conf.strings("service_tags").unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert!(conf.require_string("path").is_err());

        let bad = DriverConfig::new().with("max_parallel", "lots");
        assert!(matches!(
            bad.max_parallel(),
            Err(PhysicalError::Config { .. })
        ));
    }
}
