//! Discovery catalog contract and an in-memory catalog.

use crate::core::error::{PhysicalError, PhysicalResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Service record pushed to the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
    pub address: String,
    pub port: u16,
    pub version: String,
    /// TTL check registered alongside the service.
    pub check_id: String,
    pub check_ttl: Duration,
}

/// Status pushed to a TTL check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Fail,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// External service-discovery catalog.
#[async_trait]
pub trait Catalog: Send + Sync + Debug {
    /// Create or replace a service registration and its TTL check.
    async fn register(&self, service: &ServiceRegistration) -> PhysicalResult<()>;

    /// Tags currently recorded for `service_id`; `None` when unregistered.
    async fn service_tags(&self, service_id: &str) -> PhysicalResult<Option<Vec<String>>>;

    async fn update_check(
        &self,
        check_id: &str,
        status: CheckStatus,
        note: &str,
    ) -> PhysicalResult<()>;

    /// Remove a service and its checks. Removing an unknown service succeeds.
    async fn deregister(&self, service_id: &str) -> PhysicalResult<()>;
}

/// Catalog kept in process memory.
///
/// Counts registrations and can be told to fail every call, which is what
/// registrar tests need.
#[derive(Debug, Default)]
pub struct InmemCatalog {
    services: RwLock<HashMap<String, ServiceRegistration>>,
    checks: RwLock<HashMap<String, (CheckStatus, String)>>,
    registrations: AtomicUsize,
    check_updates: AtomicUsize,
    failing: AtomicBool,
}

impl InmemCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn service(&self, service_id: &str) -> Option<ServiceRegistration> {
        self.services.read().get(service_id).cloned()
    }

    pub fn check(&self, check_id: &str) -> Option<CheckStatus> {
        self.checks.read().get(check_id).map(|(status, _)| *status)
    }

    /// Number of successful `register` calls.
    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn check_updates(&self) -> usize {
        self.check_updates.load(Ordering::SeqCst)
    }

    fn fail_if_asked(&self, operation: &str) -> PhysicalResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PhysicalError::backend(format!(
                "catalog unavailable during {}",
                operation
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Catalog for InmemCatalog {
    async fn register(&self, service: &ServiceRegistration) -> PhysicalResult<()> {
        self.fail_if_asked("register")?;
        self.checks
            .write()
            .entry(service.check_id.clone())
            .or_insert((CheckStatus::Fail, String::new()));
        self.services
            .write()
            .insert(service.id.clone(), service.clone());
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn service_tags(&self, service_id: &str) -> PhysicalResult<Option<Vec<String>>> {
        self.fail_if_asked("service lookup")?;
        Ok(self.services.read().get(service_id).map(|s| s.tags.clone()))
    }

    async fn update_check(
        &self,
        check_id: &str,
        status: CheckStatus,
        note: &str,
    ) -> PhysicalResult<()> {
        self.fail_if_asked("check update")?;
        let mut checks = self.checks.write();
        match checks.get_mut(check_id) {
            Some(slot) => {
                *slot = (status, note.to_string());
                self.check_updates.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(PhysicalError::backend(format!(
                "unknown check {}",
                check_id
            ))),
        }
    }

    async fn deregister(&self, service_id: &str) -> PhysicalResult<()> {
        self.fail_if_asked("deregister")?;
        if let Some(service) = self.services.write().remove(service_id) {
            self.checks.write().remove(&service.check_id);
        }
        Ok(())
    }
}
