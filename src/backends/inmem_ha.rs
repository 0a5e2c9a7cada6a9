//! In-memory backend with sessioned HA locks.
//!
//! Locks are held until `unlock` or until their session is invalidated, the
//! way store-native sessions behave. Contenders park on a [`Notify`] and
//! re-check when a lock is released.

use crate::backends::inmem::InmemBackend;
use crate::core::config::DriverConfig;
use crate::core::context::Context;
use crate::core::error::{PhysicalError, PhysicalResult};
use crate::ops::observability::MetricSink;
use crate::physical::{
    Backend, Entry, FencingToken, HABackend, LeaderLost, Lock, MountTableLimitingBackend,
    RedirectDetect, Transactional, TransactionalLimits,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Session {
    id: u64,
    value: String,
    lost: CancellationToken,
}

/// Lock table shared by every handle of one backend.
#[derive(Debug, Default)]
struct LockTable {
    sessions: Mutex<HashMap<String, Session>>,
    released: Notify,
    next_id: AtomicU64,
}

impl LockTable {
    fn release(&self, key: &str, id: u64) {
        let removed = {
            let mut sessions = self.sessions.lock();
            match sessions.get(key) {
                Some(s) if s.id == id => sessions.remove(key),
                _ => None,
            }
        };
        if let Some(session) = removed {
            session.lost.cancel();
            self.released.notify_waiters();
        }
    }
}

/// In-memory backend offering session-style HA locks.
pub struct InmemHABackend {
    inner: InmemBackend,
    table: Arc<LockTable>,
    redirect_host: Option<String>,
}

impl std::fmt::Debug for InmemHABackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InmemHABackend")
            .field("inner", &self.inner)
            .field("locks", &self.table.sessions.lock().len())
            .finish()
    }
}

impl InmemHABackend {
    /// Recognized options: everything [`InmemBackend::new`] takes, plus
    /// `redirect_host`.
    pub fn new(conf: &DriverConfig, sink: Arc<dyn MetricSink>) -> PhysicalResult<Self> {
        Self::wrap(InmemBackend::new(conf, sink)?, conf)
    }

    pub fn new_transactional(
        conf: &DriverConfig,
        sink: Arc<dyn MetricSink>,
    ) -> PhysicalResult<Self> {
        Self::wrap(InmemBackend::new_transactional(conf, sink)?, conf)
    }

    fn wrap(inner: InmemBackend, conf: &DriverConfig) -> PhysicalResult<Self> {
        Ok(Self {
            inner,
            table: Arc::new(LockTable::default()),
            redirect_host: conf.string("redirect_host")?.filter(|h| !h.is_empty()),
        })
    }

    /// The wrapped data backend.
    pub fn inner(&self) -> &InmemBackend {
        &self.inner
    }

    /// Drop the session holding `key`, as if the store had expired it.
    /// Returns whether a session was invalidated.
    pub fn invalidate_session(&self, key: &str) -> bool {
        let id = self.table.sessions.lock().get(key).map(|s| s.id);
        match id {
            Some(id) => {
                tracing::debug!(key, session = id, "invalidating lock session");
                self.table.release(key, id);
                true
            }
            None => false,
        }
    }

    /// Number of keys currently locked.
    pub fn held_locks(&self) -> usize {
        self.table.sessions.lock().len()
    }
}

#[async_trait]
impl Backend for InmemHABackend {
    async fn put(&self, ctx: &Context, entry: Entry) -> PhysicalResult<()> {
        self.inner.put(ctx, entry).await
    }

    async fn get(&self, ctx: &Context, key: &str) -> PhysicalResult<Option<Entry>> {
        self.inner.get(ctx, key).await
    }

    async fn delete(&self, ctx: &Context, key: &str) -> PhysicalResult<()> {
        self.inner.delete(ctx, key).await
    }

    async fn list(&self, ctx: &Context, prefix: &str) -> PhysicalResult<Vec<String>> {
        self.inner.list(ctx, prefix).await
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        self.inner.as_transactional()
    }

    fn as_transaction_limits(&self) -> Option<&dyn TransactionalLimits> {
        self.inner.as_transaction_limits()
    }

    fn as_ha(&self) -> Option<&dyn HABackend> {
        Some(self)
    }

    fn as_redirect_detect(&self) -> Option<&dyn RedirectDetect> {
        self.redirect_host
            .as_ref()
            .map(|_| self as &dyn RedirectDetect)
    }

    fn as_mount_table_limiting(&self) -> Option<&dyn MountTableLimitingBackend> {
        self.inner.as_mount_table_limiting()
    }
}

impl HABackend for InmemHABackend {
    fn lock_with(&self, key: &str, value: &str) -> PhysicalResult<Arc<dyn Lock>> {
        Ok(Arc::new(SessionLock {
            table: self.table.clone(),
            key: key.to_string(),
            value: value.to_string(),
            held: Mutex::new(None),
            acquiring: tokio::sync::Mutex::new(()),
        }))
    }

    fn ha_enabled(&self) -> bool {
        true
    }
}

impl RedirectDetect for InmemHABackend {
    fn detect_host_addr(&self) -> PhysicalResult<String> {
        self.redirect_host
            .clone()
            .ok_or_else(|| PhysicalError::unsupported("redirect detection"))
    }
}

// ============================================================================
// Lock handle
// ============================================================================

/// Handle for one key in the backend's lock table.
pub struct SessionLock {
    table: Arc<LockTable>,
    key: String,
    value: String,
    /// Session id while this handle holds the lock.
    held: Mutex<Option<u64>>,
    acquiring: tokio::sync::Mutex<()>,
}

impl SessionLock {
    fn current_session(&self) -> Option<u64> {
        let id = (*self.held.lock())?;
        let sessions = self.table.sessions.lock();
        match sessions.get(&self.key) {
            Some(s) if s.id == id => Some(id),
            _ => None,
        }
    }
}

#[async_trait]
impl Lock for SessionLock {
    async fn lock(&self, stop: CancellationToken) -> PhysicalResult<Option<LeaderLost>> {
        let _acquiring = self.acquiring.lock().await;
        if self.current_session().is_some() {
            return Err(PhysicalError::LockAlreadyHeld);
        }

        loop {
            // Register for wakeups before looking, so a release between the
            // check and the wait is not missed.
            let released = self.table.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut sessions = self.table.sessions.lock();
                if !sessions.contains_key(&self.key) {
                    let id = self.table.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                    let lost = CancellationToken::new();
                    sessions.insert(
                        self.key.clone(),
                        Session {
                            id,
                            value: self.value.clone(),
                            lost: lost.clone(),
                        },
                    );
                    *self.held.lock() = Some(id);
                    tracing::debug!(key = %self.key, session = id, "session lock acquired");
                    return Ok(Some(LeaderLost::new(lost)));
                }
            }

            tokio::select! {
                _ = stop.cancelled() => return Ok(None),
                _ = &mut released => {}
            }
        }
    }

    async fn unlock(&self) -> PhysicalResult<()> {
        if let Some(id) = self.held.lock().take() {
            self.table.release(&self.key, id);
        }
        Ok(())
    }

    async fn value(&self) -> PhysicalResult<(bool, String)> {
        Ok(match self.table.sessions.lock().get(&self.key) {
            Some(s) => (true, s.value.clone()),
            None => (false, String::new()),
        })
    }

    fn fencing_token(&self) -> Option<FencingToken> {
        self.current_session().map(|id| FencingToken {
            key: self.key.clone(),
            owner: id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::observability::noop_sink;
    use std::time::Duration;

    fn backend() -> InmemHABackend {
        InmemHABackend::new(
            &DriverConfig::from_pairs([("redirect_host", "10.1.2.3")]),
            noop_sink(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn waiter_wakes_on_unlock() {
        let b = backend();
        let a = b.lock_with("k", "a").unwrap();
        a.lock(CancellationToken::new()).await.unwrap().unwrap();

        let contender = b.lock_with("k", "b").unwrap();
        let waiter = tokio::spawn({
            let contender = contender.clone();
            async move { contender.lock(CancellationToken::new()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        a.unlock().await.unwrap();
        let lost = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(lost.is_some());
        assert_eq!(contender.value().await.unwrap(), (true, "b".to_string()));
    }

    #[tokio::test]
    async fn invalidation_closes_lost() {
        let b = backend();
        let a = b.lock_with("k", "a").unwrap();
        let lost = a.lock(CancellationToken::new()).await.unwrap().unwrap();
        assert!(a.fencing_token().is_some());

        assert!(b.invalidate_session("k"));
        assert!(lost.is_lost());
        assert!(a.fencing_token().is_none());
        assert!(!b.invalidate_session("k"));
        // Unlock after loss is a no-op.
        a.unlock().await.unwrap();
        assert_eq!(b.held_locks(), 0);
    }

    #[tokio::test]
    async fn double_lock_rejected() {
        let b = backend();
        let a = b.lock_with("k", "a").unwrap();
        a.lock(CancellationToken::new()).await.unwrap().unwrap();
        assert!(matches!(
            a.lock(CancellationToken::new()).await,
            Err(PhysicalError::LockAlreadyHeld)
        ));
    }

    #[tokio::test]
    async fn redirect_host_is_detected() {
        let b = backend();
        let detect = b.as_redirect_detect().unwrap();
        assert_eq!(detect.detect_host_addr().unwrap(), "10.1.2.3");
        let plain = InmemHABackend::new(&DriverConfig::new(), noop_sink()).unwrap();
        assert!(plain.as_redirect_detect().is_none());
    }
}
