//! Service registration: mirrors node health into a discovery catalog.
//!
//! - [`catalog`] - Catalog contract and in-memory catalog
//! - [`registrar`] - The registrar reactor

pub mod catalog;
pub mod registrar;

pub use catalog::{Catalog, CheckStatus, InmemCatalog, ServiceRegistration};
pub use registrar::{NodeState, ServiceRegistrar};

use crate::core::config::DriverConfig;
use crate::core::error::{PhysicalError, PhysicalResult};
use std::time::Duration;

pub const DEFAULT_SERVICE_NAME: &str = "stratum";

pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Subtracted from the check timeout so a TTL push lands before expiry.
pub const CHECK_MIN_BUFFER: Duration = Duration::from_millis(100);

pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// Delay before retrying a failed reconcile.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Registrar options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationConfig {
    pub service: String,
    pub tags: Vec<String>,
    /// Overrides the host taken from the redirect address.
    pub service_address: Option<String>,
    pub check_timeout: Duration,
    pub disabled: bool,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE_NAME.to_string(),
            tags: Vec::new(),
            service_address: None,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
            disabled: false,
        }
    }
}

impl RegistrationConfig {
    /// Read `service`, `service_tags`, `service_address`, `check_timeout` and
    /// `disable_registration`.
    pub fn from_options(conf: &DriverConfig) -> PhysicalResult<Self> {
        let defaults = Self::default();
        let config = Self {
            service: conf
                .string("service")?
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.service),
            tags: conf.strings("service_tags")?.unwrap_or_default(),
            service_address: conf.string("service_address")?,
            check_timeout: conf
                .duration("check_timeout")?
                .unwrap_or(defaults.check_timeout),
            disabled: conf.bool_or("disable_registration", false)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PhysicalResult<()> {
        if self.service.contains(char::is_whitespace) {
            return Err(PhysicalError::config(
                "service",
                "service name cannot contain whitespace",
            ));
        }
        if self.check_timeout <= CHECK_MIN_BUFFER + self.check_timeout / 16 {
            return Err(PhysicalError::config(
                "check_timeout",
                format!(
                    "{:?} leaves no interval after the {:?} buffer and jitter",
                    self.check_timeout, CHECK_MIN_BUFFER
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RegistrationConfig::from_options(&DriverConfig::new()).unwrap();
        assert_eq!(config, RegistrationConfig::default());
    }

    #[test]
    fn parses_options() {
        let conf = DriverConfig::from_pairs([
            ("service", "secrets"),
            ("service_tags", "blue, eu-west"),
            ("service_address", ""),
            ("check_timeout", "2s"),
            ("disable_registration", "true"),
        ]);
        let config = RegistrationConfig::from_options(&conf).unwrap();
        assert_eq!(config.service, "secrets");
        assert_eq!(config.tags, vec!["blue", "eu-west"]);
        assert_eq!(config.service_address.as_deref(), Some(""));
        assert_eq!(config.check_timeout, Duration::from_secs(2));
        assert!(config.disabled);
    }

    #[test]
    fn rejects_tiny_check_timeout() {
        let conf = DriverConfig::from_pairs([("check_timeout", "100ms")]);
        assert!(matches!(
            RegistrationConfig::from_options(&conf),
            Err(PhysicalError::Config { .. })
        ));
        let conf = DriverConfig::from_pairs([("service", "two words")]);
        assert!(RegistrationConfig::from_options(&conf).is_err());
    }
}
