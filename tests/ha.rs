//! HA lock tests: lease locks, session locks, fencing, redirect detection.

mod common;

use std::sync::Arc;
use std::time::Duration;
use stratum::core::config::DriverConfig;
use stratum::core::context::Context;
use stratum::core::error::PhysicalError;
use stratum::ha::lease::MemoryLeaseStore;
use stratum::ha::{detect_redirect, LeaseHA, LeaseStore};
use stratum::physical::{Backend, Entry, HABackend};
use stratum::testing::exercise_ha_backend;
use tokio_util::sync::CancellationToken;

fn stop_after(delay: Duration) -> CancellationToken {
    let stop = CancellationToken::new();
    let stopper = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        stopper.cancel();
    });
    stop
}

// ============================================================================
// Lease locks
// ============================================================================

#[tokio::test]
async fn lease_handoff_between_handles() {
    let backend = common::inmem_ha();
    let ha = backend.as_ha().unwrap();

    let a = ha.lock_with("foo", "bar").unwrap();
    let lost_a = a.lock(CancellationToken::new()).await.unwrap();
    assert!(lost_a.is_some());

    let b = ha.lock_with("foo", "baz").unwrap();
    let attempt = b.lock(stop_after(Duration::from_millis(50))).await.unwrap();
    assert!(attempt.is_none());
    assert_eq!(a.value().await.unwrap(), (true, "bar".to_string()));

    a.unlock().await.unwrap();
    assert!(lost_a.unwrap().is_lost());

    let lost_b = b.lock(CancellationToken::new()).await.unwrap();
    assert!(lost_b.is_some());
    assert_eq!(a.value().await.unwrap(), (true, "baz".to_string()));
    assert_eq!(b.value().await.unwrap(), (true, "baz".to_string()));
    b.unlock().await.unwrap();
}

#[tokio::test]
async fn lease_harness() {
    let backend = common::inmem_ha();
    exercise_ha_backend(&backend, &backend).await.unwrap();
}

#[tokio::test]
async fn lease_nodes_share_a_store() {
    let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
    let node1 = LeaseHA::new(store.clone(), common::fast_lease());
    let node2 = LeaseHA::new(store, common::fast_lease());

    let leader = node1.lock_with("core/lock", "node1").unwrap();
    leader.lock(CancellationToken::new()).await.unwrap().unwrap();

    let standby = node2.lock_with("core/lock", "node2").unwrap();
    let (held, value) = standby.value().await.unwrap();
    assert!(held);
    assert_eq!(value, "node1");

    // Leader steps down; the standby's pending attempt wins.
    let waiting = tokio::spawn(async move {
        let lost = standby.lock(CancellationToken::new()).await.unwrap();
        (standby, lost)
    });
    tokio::time::sleep(Duration::from_millis(60)).await;
    leader.unlock().await.unwrap();

    let (standby, lost) = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .unwrap()
        .unwrap();
    assert!(lost.is_some());
    assert_eq!(standby.value().await.unwrap(), (true, "node2".to_string()));
}

#[tokio::test]
async fn lease_lost_when_record_revoked() {
    let backend = common::inmem_ha();
    let lock = backend.as_ha().unwrap().lock_with("foo", "bar").unwrap();
    let lost = lock.lock(CancellationToken::new()).await.unwrap().unwrap();

    backend.lease_store().clear();
    tokio::time::timeout(Duration::from_secs(2), lost.wait())
        .await
        .expect("lost signal should fire after revocation");
    assert!(lock.fencing_token().is_none());
}

#[tokio::test]
async fn double_lock_is_rejected() {
    let backend = common::inmem_ha();
    let lock = backend.as_ha().unwrap().lock_with("foo", "bar").unwrap();
    lock.lock(CancellationToken::new()).await.unwrap().unwrap();
    let again = lock.lock(CancellationToken::new()).await;
    assert!(matches!(again, Err(PhysicalError::LockAlreadyHeld)));
    lock.unlock().await.unwrap();
}

#[tokio::test]
async fn ha_disabled_backend_refuses_locks() {
    let backend = common::inmem();
    assert!(backend.as_ha().is_none());
    let res = HABackend::lock_with(&backend, "foo", "bar");
    assert!(matches!(res, Err(PhysicalError::Unsupported { .. })));
}

// ============================================================================
// Session locks
// ============================================================================

#[tokio::test]
async fn session_harness() {
    let backend = common::inmem_sessioned();
    exercise_ha_backend(&backend, &backend).await.unwrap();
}

#[tokio::test]
async fn session_invalidation_fires_lost() {
    let backend = common::inmem_sessioned();
    let lock = backend.lock_with("foo", "bar").unwrap();
    let lost = lock.lock(CancellationToken::new()).await.unwrap().unwrap();
    assert_eq!(backend.held_locks(), 1);

    assert!(backend.invalidate_session("foo"));
    tokio::time::timeout(Duration::from_secs(1), lost.wait())
        .await
        .unwrap();
    assert_eq!(backend.held_locks(), 0);
    assert!(!backend.invalidate_session("foo"));

    // The key is free for the next contender.
    let next = backend.lock_with("foo", "baz").unwrap();
    next.lock(CancellationToken::new()).await.unwrap().unwrap();
    assert_eq!(lock.value().await.unwrap(), (true, "baz".to_string()));
}

// ============================================================================
// Fencing
// ============================================================================

#[tokio::test]
async fn fenced_writes_follow_the_active_lock() {
    let backend = common::inmem_ha();
    let ctx = Context::background();
    let lock = backend
        .as_ha()
        .unwrap()
        .lock_with("core/lock", "node1")
        .unwrap();
    lock.lock(CancellationToken::new()).await.unwrap().unwrap();
    backend
        .as_fencing()
        .unwrap()
        .register_active_node_lock(&lock)
        .unwrap();

    backend.put(&ctx, Entry::new("k", "v1")).await.unwrap();

    backend.lease_store().clear();
    let res = backend.put(&ctx, Entry::new("k", "v2")).await;
    assert!(matches!(res, Err(PhysicalError::Fenced { .. })));

    // Reinitialization writes bypass the fence.
    backend
        .put(&ctx.clone().with_unfenced_write(), Entry::new("k", "v3"))
        .await
        .unwrap();
    let entry = backend.get(&ctx, "k").await.unwrap().unwrap();
    assert_eq!(entry.value, b"v3");
}

#[tokio::test]
async fn dropped_lock_stops_fencing() {
    let backend = common::inmem_ha();
    let ctx = Context::background();
    {
        let lock = backend
            .as_ha()
            .unwrap()
            .lock_with("core/lock", "node1")
            .unwrap();
        lock.lock(CancellationToken::new()).await.unwrap().unwrap();
        backend
            .as_fencing()
            .unwrap()
            .register_active_node_lock(&lock)
            .unwrap();
    }
    // Only a weak reference was kept.
    backend.put(&ctx, Entry::new("k", "v")).await.unwrap();
}

// ============================================================================
// Redirect detection
// ============================================================================

#[test]
fn redirect_from_backend_host() {
    let backend = stratum::backends::InmemHABackend::new(
        &DriverConfig::from_pairs([("redirect_host", "10.1.2.3")]),
        common::sink(),
    )
    .unwrap();
    let detect = backend.as_redirect_detect().unwrap();
    assert_eq!(
        detect_redirect(detect, Some("http://0.0.0.0:8300")).unwrap(),
        "http://10.1.2.3:8300"
    );

    assert!(common::inmem_sessioned().as_redirect_detect().is_none());
}

// ============================================================================
// SQL leases
// ============================================================================

#[cfg(feature = "sql")]
#[tokio::test]
async fn sql_lease_harness() {
    let dir = tempfile::TempDir::new().unwrap();
    let conf = common::fast_ha_options().with(
        "path",
        dir.path().join("ha.db").to_string_lossy().into_owned(),
    );
    let backend = stratum::backends::SqlBackend::new(&conf, common::sink())
        .await
        .unwrap();
    exercise_ha_backend(&backend, &backend).await.unwrap();
}
