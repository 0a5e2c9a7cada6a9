//! High-availability locking.
//!
//! - [`lease`]: lease-on-key locks for stores with compare-and-set only
//! - [`fencing`]: guarding writes with the active node's lease identity
//!
//! Sessioned locks live with the driver that provides the sessions
//! ([`crate::backends::inmem_ha`]).

pub mod fencing;
pub mod lease;

use crate::core::error::{PhysicalError, PhysicalResult};
use crate::physical::RedirectDetect;

pub use fencing::FenceGuard;
pub use lease::{LeaseConfig, LeaseHA, LeaseLock, LeaseMode, LeaseStore, LockRecord};

/// Default scheme for advertise addresses.
pub const DEFAULT_REDIRECT_SCHEME: &str = "https";
/// Default port for advertise addresses.
pub const DEFAULT_REDIRECT_PORT: u16 = 8200;

/// Build this node's advertise address from the backend's host and an
/// optional listener address hint (`scheme://host:port` or `host:port`).
pub fn detect_redirect(
    detect: &dyn RedirectDetect,
    listener: Option<&str>,
) -> PhysicalResult<String> {
    let host = detect.detect_host_addr()?;
    if host.is_empty() {
        return Err(PhysicalError::backend("backend returned an empty host"));
    }

    let (scheme, port) = match listener {
        Some(hint) if !hint.is_empty() => listener_parts(hint)?,
        _ => (DEFAULT_REDIRECT_SCHEME.to_string(), DEFAULT_REDIRECT_PORT),
    };

    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host
    };
    Ok(format!("{}://{}:{}", scheme, host, port))
}

fn listener_parts(hint: &str) -> PhysicalResult<(String, u16)> {
    let with_scheme = if hint.contains("://") {
        hint.to_string()
    } else {
        format!("{}://{}", DEFAULT_REDIRECT_SCHEME, hint)
    };
    let parsed = url::Url::parse(&with_scheme)
        .map_err(|e| PhysicalError::backend_from("parse listener address", e))?;
    let port = parsed
        .port_or_known_default()
        .unwrap_or(DEFAULT_REDIRECT_PORT);
    Ok((parsed.scheme().to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    impl RedirectDetect for Fixed {
        fn detect_host_addr(&self) -> PhysicalResult<String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn defaults_to_https_8200() {
        assert_eq!(
            detect_redirect(&Fixed("10.0.0.4"), None).unwrap(),
            "https://10.0.0.4:8200"
        );
    }

    #[test]
    fn listener_hint_sets_scheme_and_port() {
        assert_eq!(
            detect_redirect(&Fixed("node-1"), Some("http://0.0.0.0:9000")).unwrap(),
            "http://node-1:9000"
        );
        assert_eq!(
            detect_redirect(&Fixed("node-1"), Some("0.0.0.0:9443")).unwrap(),
            "https://node-1:9443"
        );
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        assert_eq!(
            detect_redirect(&Fixed("fd00::1"), None).unwrap(),
            "https://[fd00::1]:8200"
        );
        assert!(detect_redirect(&Fixed(""), None).is_err());
    }
}
