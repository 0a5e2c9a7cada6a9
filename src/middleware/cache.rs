//! Write-through LRU read cache.

use crate::core::context::Context;
use crate::core::error::{PhysicalError, PhysicalResult};
use crate::ops::observability::MetricSink;
use crate::physical::{
    Backend, Entry, Operation, ToggleablePurgemonster, Transactional, TransactionalLimits,
    TxnEntry,
};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hasher;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use twox_hash::XxHash64;

/// Default number of cached entries.
pub const DEFAULT_CACHE_SIZE: usize = 128 * 1024;

/// Number of per-key lock stripes.
const LOCK_STRIPES: usize = 256;

/// Prefixes whose entries churn too fast to be worth caching.
pub const DEFAULT_EXCLUDED_PREFIXES: &[&str] =
    &["wal/logs/", "index/pages/", "sys/expire/", "core/poison-pill"];

/// Caches entries (and misses) of `inner`.
///
/// Reads and writes of the same key are serialized through a lock stripe
/// chosen by xxHash64 of the key, so a fill racing a write can never leave a
/// stale value behind.
pub struct Cache<B> {
    inner: B,
    lru: Mutex<LruCache<String, Option<Entry>>>,
    stripes: Vec<AsyncMutex<()>>,
    enabled: AtomicBool,
    excluded: Vec<String>,
    sink: Arc<dyn MetricSink>,
}

impl<B> std::fmt::Debug for Cache<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("len", &self.lru.lock().len())
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .finish()
    }
}

impl<B: Backend> Cache<B> {
    /// Cache holding up to `size` entries; zero selects [`DEFAULT_CACHE_SIZE`].
    pub fn new(inner: B, size: usize, sink: Arc<dyn MetricSink>) -> Self {
        let capacity = NonZeroUsize::new(size)
            .or(NonZeroUsize::new(DEFAULT_CACHE_SIZE))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            lru: Mutex::new(LruCache::new(capacity)),
            stripes: (0..LOCK_STRIPES).map(|_| AsyncMutex::new(())).collect(),
            enabled: AtomicBool::new(true),
            excluded: DEFAULT_EXCLUDED_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            sink,
        }
    }

    /// Never cache keys under `prefixes` (in addition to the defaults).
    pub fn with_exclusions<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded.extend(prefixes.into_iter().map(Into::into));
        self
    }

    pub fn len(&self) -> usize {
        self.lru.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn cacheable(&self, key: &str) -> bool {
        self.is_enabled() && !self.excluded.iter().any(|p| key.starts_with(p.as_str()))
    }

    fn stripe_index(key: &str) -> usize {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(key.as_bytes());
        (hasher.finish() % LOCK_STRIPES as u64) as usize
    }

    async fn lock_key(&self, key: &str) -> AsyncMutexGuard<'_, ()> {
        self.stripes[Self::stripe_index(key)].lock().await
    }

    /// Lock every stripe touched by `keys`, in index order.
    async fn lock_keys<'a>(
        &self,
        keys: impl Iterator<Item = &'a str>,
    ) -> Vec<AsyncMutexGuard<'_, ()>> {
        let mut indexes: Vec<usize> = keys.map(Self::stripe_index).collect();
        indexes.sort_unstable();
        indexes.dedup();
        let mut guards = Vec::with_capacity(indexes.len());
        for i in indexes {
            guards.push(self.stripes[i].lock().await);
        }
        guards
    }

    fn store(&self, key: &str, entry: Option<Entry>) {
        if self.cacheable(key) {
            self.lru.lock().put(key.to_string(), entry);
        }
    }

    fn forget(&self, key: &str) {
        self.lru.lock().pop(key);
    }
}

#[async_trait]
impl<B: Backend> Backend for Cache<B> {
    async fn put(&self, ctx: &Context, entry: Entry) -> PhysicalResult<()> {
        if !self.cacheable(&entry.key) {
            return self.inner.put(ctx, entry).await;
        }
        let _guard = self.lock_key(&entry.key).await;
        let key = entry.key.clone();
        match self.inner.put(ctx, entry.clone()).await {
            Ok(()) => {
                self.sink.incr_counter("cache.write", 1);
                self.store(&key, Some(entry));
                Ok(())
            }
            Err(err) => {
                self.forget(&key);
                Err(err)
            }
        }
    }

    async fn get(&self, ctx: &Context, key: &str) -> PhysicalResult<Option<Entry>> {
        if !self.cacheable(key) {
            return self.inner.get(ctx, key).await;
        }
        let _guard = self.lock_key(key).await;

        if !ctx.cache_refresh() {
            if let Some(hit) = self.lru.lock().get(key).cloned() {
                self.sink.incr_counter("cache.hit", 1);
                return Ok(hit);
            }
        }
        self.sink.incr_counter("cache.miss", 1);

        let entry = self.inner.get(ctx, key).await?;
        self.store(key, entry.clone());
        Ok(entry)
    }

    async fn delete(&self, ctx: &Context, key: &str) -> PhysicalResult<()> {
        if !self.cacheable(key) {
            return self.inner.delete(ctx, key).await;
        }
        let _guard = self.lock_key(key).await;
        let res = self.inner.delete(ctx, key).await;
        self.forget(key);
        if res.is_ok() {
            self.sink.incr_counter("cache.delete", 1);
        }
        res
    }

    async fn list(&self, ctx: &Context, prefix: &str) -> PhysicalResult<Vec<String>> {
        self.inner.list(ctx, prefix).await
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        self.inner
            .as_transactional()
            .map(|_| self as &dyn Transactional)
    }

    fn as_transaction_limits(&self) -> Option<&dyn TransactionalLimits> {
        self.inner.as_transaction_limits()
    }

    fn as_purgeable(&self) -> Option<&dyn ToggleablePurgemonster> {
        Some(self)
    }
}

#[async_trait]
impl<B: Backend> Transactional for Cache<B> {
    async fn transaction(&self, ctx: &Context, txns: &mut [TxnEntry]) -> PhysicalResult<()> {
        let inner = self
            .inner
            .as_transactional()
            .ok_or_else(|| PhysicalError::unsupported("transaction"))?;

        if !self.is_enabled() {
            return inner.transaction(ctx, txns).await;
        }

        let _guards = self
            .lock_keys(txns.iter().map(|t| t.entry.key.as_str()))
            .await;
        let res = inner.transaction(ctx, txns).await;

        for txn in txns.iter() {
            match (txn.operation, &res) {
                (Operation::Put, Ok(())) => self.store(&txn.entry.key, Some(txn.entry.clone())),
                (Operation::Put | Operation::Delete, _) => self.forget(&txn.entry.key),
                _ => {}
            }
        }
        res
    }
}

impl<B: Backend> ToggleablePurgemonster for Cache<B> {
    fn purge(&self) {
        self.lru.lock().clear();
    }

    fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::AcqRel);
        // Writes skipped the cache while it was off.
        if enabled && !was {
            self.purge();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InmemBackend;
    use crate::ops::observability::{noop_sink, InmemSink};

    #[tokio::test]
    async fn hits_and_write_through() {
        let inner = Arc::new(InmemBackend::default());
        let sink = Arc::new(InmemSink::new());
        let cache = Cache::new(inner.clone(), 16, sink.clone());
        let ctx = Context::background();

        cache.put(&ctx, Entry::new("k", "v1")).await.unwrap();
        // Changed behind the cache's back.
        inner.put(&ctx, Entry::new("k", "v2")).await.unwrap();
        assert_eq!(cache.get(&ctx, "k").await.unwrap().unwrap().value, b"v1");
        assert_eq!(sink.counter("cache.hit"), 1);

        let refreshed = cache
            .get(&ctx.clone().with_cache_refresh(), "k")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.value, b"v2");
        assert_eq!(cache.get(&ctx, "k").await.unwrap().unwrap().value, b"v2");

        cache.delete(&ctx, "k").await.unwrap();
        assert!(cache.get(&ctx, "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_and_disable() {
        let inner = Arc::new(InmemBackend::default());
        let cache = Cache::new(inner.clone(), 16, noop_sink());
        let ctx = Context::background();

        cache.put(&ctx, Entry::new("k", "v1")).await.unwrap();
        assert_eq!(cache.len(), 1);
        cache.purge();
        assert!(cache.is_empty());

        cache.set_enabled(false);
        cache.put(&ctx, Entry::new("k", "v2")).await.unwrap();
        assert!(cache.is_empty());
        inner.put(&ctx, Entry::new("k", "v3")).await.unwrap();
        assert_eq!(cache.get(&ctx, "k").await.unwrap().unwrap().value, b"v3");
        cache.set_enabled(true);
        assert_eq!(cache.get(&ctx, "k").await.unwrap().unwrap().value, b"v3");
    }

    #[tokio::test]
    async fn excluded_prefixes_bypass() {
        let inner = Arc::new(InmemBackend::default());
        let cache = Cache::new(inner.clone(), 16, noop_sink()).with_exclusions(["tmp/"]);
        let ctx = Context::background();

        cache.put(&ctx, Entry::new("tmp/a", "1")).await.unwrap();
        cache.put(&ctx, Entry::new("wal/logs/1", "1")).await.unwrap();
        assert!(cache.is_empty());
        cache.put(&ctx, Entry::new("keep", "1")).await.unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn failed_write_evicts() {
        let inner = Arc::new(InmemBackend::default());
        let cache = Cache::new(inner.clone(), 16, noop_sink());
        let ctx = Context::background();

        cache.put(&ctx, Entry::new("k", "v1")).await.unwrap();
        inner.fail_put(true);
        assert!(cache.put(&ctx, Entry::new("k", "v2")).await.is_err());
        inner.fail_put(false);
        assert!(cache.lru.lock().peek("k").is_none());
    }

    #[test]
    fn stripes_are_stable() {
        let a = Cache::<InmemBackend>::stripe_index("foo/bar");
        assert_eq!(a, Cache::<InmemBackend>::stripe_index("foo/bar"));
        assert!(a < LOCK_STRIPES);
    }
}
