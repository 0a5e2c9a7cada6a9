//! Service registrar tests against the in-memory catalog.

mod common;

use std::sync::Arc;
use std::time::Duration;
use stratum::core::config::DriverConfig;
use stratum::registration::{
    CheckStatus, InmemCatalog, RegistrationConfig, ServiceRegistrar,
};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(3);

fn config() -> RegistrationConfig {
    RegistrationConfig {
        tags: vec!["blue".to_string()],
        check_timeout: Duration::from_secs(1),
        ..RegistrationConfig::default()
    }
}

fn tags_of(catalog: &InmemCatalog, id: &str) -> Option<Vec<String>> {
    catalog.service(id).map(|s| {
        let mut tags = s.tags;
        tags.sort();
        tags
    })
}

// ============================================================================
// Identity
// ============================================================================

#[test]
fn ids_derive_from_redirect_address() {
    let catalog = Arc::new(InmemCatalog::new());
    let registrar =
        ServiceRegistrar::new(config(), catalog, "https://10.0.0.1:8200").unwrap();
    assert_eq!(registrar.service_id(), "stratum:10.0.0.1:8200");
    assert_eq!(registrar.check_id(), "stratum:10.0.0.1:8200:sealed-check");
    assert!(registrar.state().sealed);
    assert_eq!(
        registrar.desired_tags(),
        vec!["standby", "sealed", "uninitialized", "blue"]
    );
}

#[test]
fn rejects_bad_redirect_and_config() {
    let catalog = Arc::new(InmemCatalog::new());
    assert!(ServiceRegistrar::new(config(), catalog.clone(), "not a url").is_err());

    let bad = RegistrationConfig {
        service: "my service".to_string(),
        ..config()
    };
    assert!(ServiceRegistrar::new(bad, catalog, "https://10.0.0.1:8200").is_err());
}

#[test]
fn config_from_options() {
    let conf = DriverConfig::from_pairs([
        ("service", "vault-east"),
        ("service_tags", "a,b"),
        ("service_address", "192.0.2.10"),
        ("check_timeout", "2s"),
    ]);
    let config = RegistrationConfig::from_options(&conf).unwrap();
    assert_eq!(config.service, "vault-east");
    assert_eq!(config.tags, vec!["a", "b"]);
    assert_eq!(config.service_address.as_deref(), Some("192.0.2.10"));
    assert_eq!(config.check_timeout, Duration::from_secs(2));

    let conf = DriverConfig::from_pairs([("check_timeout", "50ms")]);
    assert!(RegistrationConfig::from_options(&conf).is_err());
}

// ============================================================================
// Reactor
// ============================================================================

#[tokio::test]
async fn registers_follows_state_and_deregisters() {
    let catalog = Arc::new(InmemCatalog::new());
    let registrar =
        ServiceRegistrar::new(config(), catalog.clone(), "https://10.0.0.1:8200").unwrap();
    let id = registrar.service_id().to_string();
    let check_id = registrar.check_id().to_string();
    let shutdown = CancellationToken::new();
    let handle = registrar.run(shutdown.clone()).unwrap();

    assert!(
        common::eventually(WAIT, || tags_of(&catalog, &id)
            == Some(vec![
                "blue".to_string(),
                "sealed".to_string(),
                "standby".to_string(),
                "uninitialized".to_string(),
            ]))
        .await
    );
    let service = catalog.service(&id).unwrap();
    assert_eq!(service.address, "10.0.0.1");
    assert_eq!(service.port, 8200);

    registrar.notify_sealed_state_change(false);
    assert!(common::eventually(WAIT, || catalog.check(&check_id) == Some(CheckStatus::Pass)).await);

    registrar.notify_initialized_state_change(true);
    registrar.notify_active_state_change(true);
    assert!(
        common::eventually(WAIT, || tags_of(&catalog, &id)
            == Some(vec![
                "active".to_string(),
                "blue".to_string(),
                "initialized".to_string(),
                "unsealed".to_string(),
            ]))
        .await
    );

    shutdown.cancel();
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    assert!(catalog.service(&id).is_none());
    assert!(catalog.check(&check_id).is_none());
    assert!(registrar.state().sealed);
    assert!(!registrar.state().active);
}

#[tokio::test]
async fn unchanged_tags_are_not_reregistered() {
    let catalog = Arc::new(InmemCatalog::new());
    let registrar =
        ServiceRegistrar::new(config(), catalog.clone(), "https://10.0.0.1:8200").unwrap();
    let shutdown = CancellationToken::new();
    let handle = registrar.run(shutdown.clone()).unwrap();

    assert!(common::eventually(WAIT, || catalog.registrations() == 1).await);
    registrar.notify_active_state_change(false);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(catalog.registrations(), 1);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn failed_reconcile_is_retried() {
    let catalog = Arc::new(InmemCatalog::new());
    catalog.set_failing(true);
    let registrar =
        ServiceRegistrar::new(config(), catalog.clone(), "https://10.0.0.1:8200").unwrap();
    let shutdown = CancellationToken::new();
    let handle = registrar.run(shutdown.clone()).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(catalog.registrations(), 0);

    catalog.set_failing(false);
    assert!(common::eventually(WAIT, || catalog.registrations() >= 1).await);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn run_twice_fails() {
    let catalog = Arc::new(InmemCatalog::new());
    let registrar =
        ServiceRegistrar::new(config(), catalog, "https://10.0.0.1:8200").unwrap();
    let shutdown = CancellationToken::new();
    let handle = registrar.run(shutdown.clone()).unwrap();
    assert!(registrar.run(shutdown.clone()).is_err());
    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn notifications_do_not_block_when_busy() {
    let catalog = Arc::new(InmemCatalog::new());
    let registrar =
        ServiceRegistrar::new(config(), catalog, "https://10.0.0.1:8200").unwrap();
    // Not running: channels fill after one message and later ones are dropped.
    for _ in 0..10 {
        registrar.notify_active_state_change(true);
        registrar.notify_sealed_state_change(false);
    }
    assert!(registrar.state().active);
    assert!(!registrar.state().sealed);
}
