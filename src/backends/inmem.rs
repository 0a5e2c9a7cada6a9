//! In-memory reference backend.
//!
//! An ordered map behind a single logical RW lock. Used by tests and as the
//! reference for the Backend contract: every driver must behave like this one.
//! Fault toggles let tests make individual verbs fail on demand.

use crate::core::config::DriverConfig;
use crate::core::context::Context;
use crate::core::error::{PhysicalError, PhysicalResult};
use crate::ha::fencing::FenceGuard;
use crate::ha::lease::{LeaseConfig, LeaseHA, MemoryLeaseStore};
use crate::ops::observability::{noop_sink, DriverMetrics, MetricSink, Verb};
use crate::physical::{
    check_transaction_limits, collapse_children, generic_transaction_handler, validate_entry_size,
    validate_key, Backend, Entry, FencingHABackend, HABackend, Lock, MountTableLimitingBackend,
    Operation, PermitPool, PseudoTransactional, Transactional, TransactionalLimits, TxnEntry,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Multiplier applied to `max_value_size` for mount-table paths when
/// `max_mount_table_value_size` is not set.
const MOUNT_TABLE_SIZE_FACTOR: usize = 4;

/// Fault toggles, flipped at runtime by tests.
#[derive(Debug, Default)]
struct Faults {
    put: AtomicBool,
    get: AtomicBool,
    delete: AtomicBool,
    list: AtomicBool,
    get_in_txn: AtomicBool,
    /// One-shot write failure; `n + 1` fails the write after `n` more
    /// succeed, 0 is off.
    write_countdown: AtomicUsize,
}

impl Faults {
    fn take_write_fault(&self) -> bool {
        let prev = self
            .write_countdown
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        matches!(prev, Ok(1))
    }
}

/// In-memory backend.
pub struct InmemBackend {
    root: RwLock<BTreeMap<String, Vec<u8>>>,
    /// Serializes writers and transactions against readers.
    lock: tokio::sync::RwLock<()>,
    permits: PermitPool,
    metrics: DriverMetrics,
    transactional: bool,

    max_value_size: usize,
    max_key_size: usize,
    mount_table_max_value_size: usize,
    mount_table_paths: RwLock<Vec<String>>,

    faults: Faults,
    log_ops: AtomicBool,
    write_latency_ms: AtomicU64,
    max_batch_entries: AtomicUsize,
    max_batch_size: AtomicUsize,

    leases: Arc<MemoryLeaseStore>,
    ha: Option<LeaseHA>,
    fence: FenceGuard,
}

impl std::fmt::Debug for InmemBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InmemBackend")
            .field("transactional", &self.transactional)
            .field("entries", &self.root.read().len())
            .field("ha_enabled", &self.ha.is_some())
            .finish()
    }
}

impl Default for InmemBackend {
    fn default() -> Self {
        Self::build(false, 0, noop_sink())
    }
}

impl InmemBackend {
    /// Build from driver options.
    ///
    /// Recognized: `max_value_size`, `max_key_size`,
    /// `max_mount_table_value_size`, `max_parallel`, `ha_enabled`,
    /// `transaction_max_entries`, `transaction_max_size`, `lock_*` and
    /// `consistency_mode`.
    pub fn new(conf: &DriverConfig, sink: Arc<dyn MetricSink>) -> PhysicalResult<Self> {
        Self::from_options(false, conf, sink)
    }

    /// Transactional variant: one permit, so transactions and single writes
    /// never interleave.
    pub fn new_transactional(
        conf: &DriverConfig,
        sink: Arc<dyn MetricSink>,
    ) -> PhysicalResult<Self> {
        Self::from_options(true, conf, sink)
    }

    fn from_options(
        transactional: bool,
        conf: &DriverConfig,
        sink: Arc<dyn MetricSink>,
    ) -> PhysicalResult<Self> {
        let max_parallel = if transactional { 1 } else { conf.max_parallel()? };
        let mut backend = Self::build(transactional, max_parallel, sink);

        backend.max_value_size = conf.usize("max_value_size")?.unwrap_or(0);
        backend.max_key_size = conf.usize("max_key_size")?.unwrap_or(0);
        backend.mount_table_max_value_size = conf
            .usize("max_mount_table_value_size")?
            .unwrap_or(backend.max_value_size * MOUNT_TABLE_SIZE_FACTOR);
        backend.max_batch_entries = AtomicUsize::new(
            conf.usize("transaction_max_entries")?.unwrap_or(0),
        );
        backend.max_batch_size =
            AtomicUsize::new(conf.usize("transaction_max_size")?.unwrap_or(0));

        if conf.strong_consistency()? {
            tracing::debug!("inmem backend is always strongly consistent");
        }
        if conf.bool_or("ha_enabled", false)? {
            let lease_config = LeaseConfig::from_options(conf)?;
            backend.ha = Some(LeaseHA::new(backend.leases.clone(), lease_config));
        }
        Ok(backend)
    }

    fn build(transactional: bool, max_parallel: usize, sink: Arc<dyn MetricSink>) -> Self {
        let capacity = if transactional { 1 } else { max_parallel };
        Self {
            root: RwLock::new(BTreeMap::new()),
            lock: tokio::sync::RwLock::new(()),
            permits: PermitPool::new(capacity),
            metrics: DriverMetrics::new("inmem", sink),
            transactional,
            max_value_size: 0,
            max_key_size: 0,
            mount_table_max_value_size: 0,
            mount_table_paths: RwLock::new(Vec::new()),
            faults: Faults::default(),
            log_ops: AtomicBool::new(false),
            write_latency_ms: AtomicU64::new(0),
            max_batch_entries: AtomicUsize::new(0),
            max_batch_size: AtomicUsize::new(0),
            leases: Arc::new(MemoryLeaseStore::new()),
            ha: None,
            fence: FenceGuard::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Test knobs
    // ------------------------------------------------------------------------

    pub fn fail_put(&self, fail: bool) {
        self.faults.put.store(fail, Ordering::SeqCst);
    }

    pub fn fail_get(&self, fail: bool) {
        self.faults.get.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.faults.delete.store(fail, Ordering::SeqCst);
    }

    pub fn fail_list(&self, fail: bool) {
        self.faults.list.store(fail, Ordering::SeqCst);
    }

    /// Let `writes` more puts or deletes succeed, then fail the next one once.
    pub fn fail_write_after(&self, writes: usize) {
        self.faults
            .write_countdown
            .store(writes + 1, Ordering::SeqCst);
    }

    /// Fail transactions that contain a Get member.
    pub fn fail_get_in_txn(&self, fail: bool) {
        self.faults.get_in_txn.store(fail, Ordering::SeqCst);
    }

    /// Log every operation at info level.
    pub fn set_log_ops(&self, enabled: bool) {
        self.log_ops.store(enabled, Ordering::SeqCst);
    }

    /// Delay applied to every Put and Delete.
    pub fn set_write_latency(&self, latency: Duration) {
        self.write_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Override transaction limits; zero restores the defaults.
    pub fn set_max_batch(&self, entries: usize, size: usize) {
        self.max_batch_entries.store(entries, Ordering::SeqCst);
        self.max_batch_size.store(size, Ordering::SeqCst);
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.root.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.read().is_empty()
    }

    /// Permit pool, exposed for concurrency assertions.
    pub fn permits(&self) -> &PermitPool {
        &self.permits
    }

    /// Lease table backing the HA lock.
    pub fn lease_store(&self) -> &Arc<MemoryLeaseStore> {
        &self.leases
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn log_op(&self, operation: &str, key: &str) {
        if self.log_ops.load(Ordering::Relaxed) {
            tracing::info!(operation, key, "inmem operation");
        }
    }

    fn value_limit(&self, key: &str) -> usize {
        let is_mount_table = self
            .mount_table_paths
            .read()
            .iter()
            .any(|p| key == p || key.starts_with(p.as_str()));
        if is_mount_table {
            self.mount_table_max_value_size
        } else {
            self.max_value_size
        }
    }

    async fn write_latency(&self, ctx: &Context) -> PhysicalResult<()> {
        let ms = self.write_latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            ctx.sleep(Duration::from_millis(ms)).await?;
        }
        Ok(())
    }

    async fn check_fence(&self, ctx: &Context) -> PhysicalResult<()> {
        if self.ha.is_none() {
            return Ok(());
        }
        self.fence.check(ctx, self.leases.as_ref()).await
    }
}

// ============================================================================
// Internal hooks: no lock, no permit
// ============================================================================

#[async_trait]
impl PseudoTransactional for InmemBackend {
    async fn get_internal(&self, ctx: &Context, key: &str) -> PhysicalResult<Option<Entry>> {
        self.log_op("get", key);
        if self.faults.get.load(Ordering::SeqCst) {
            return Err(PhysicalError::disabled("get"));
        }
        ctx.check()?;
        validate_key(key)?;
        Ok(self
            .root
            .read()
            .get(key)
            .map(|value| Entry::new(key, value.clone())))
    }

    async fn put_internal(&self, ctx: &Context, entry: Entry) -> PhysicalResult<()> {
        self.log_op("put", &entry.key);
        if self.faults.put.load(Ordering::SeqCst) || self.faults.take_write_fault() {
            return Err(PhysicalError::disabled("put"));
        }
        ctx.check()?;
        validate_key(&entry.key)?;
        validate_entry_size(&entry, self.max_key_size, self.value_limit(&entry.key))?;
        self.write_latency(ctx).await?;
        self.root.write().insert(entry.key, entry.value);
        Ok(())
    }

    async fn delete_internal(&self, ctx: &Context, key: &str) -> PhysicalResult<()> {
        self.log_op("delete", key);
        if self.faults.delete.load(Ordering::SeqCst) || self.faults.take_write_fault() {
            return Err(PhysicalError::disabled("delete"));
        }
        ctx.check()?;
        validate_key(key)?;
        self.write_latency(ctx).await?;
        self.root.write().remove(key);
        Ok(())
    }
}

impl InmemBackend {
    async fn list_internal(&self, ctx: &Context, prefix: &str) -> PhysicalResult<Vec<String>> {
        self.log_op("list", prefix);
        if self.faults.list.load(Ordering::SeqCst) {
            return Err(PhysicalError::disabled("list"));
        }
        ctx.check()?;
        validate_key(prefix)?;
        let root = self.root.read();
        let keys = root
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .map(|(k, _)| k.as_str())
            .take_while(|k| k.starts_with(prefix));
        Ok(collapse_children(prefix, keys))
    }
}

// ============================================================================
// Backend
// ============================================================================

#[async_trait]
impl Backend for InmemBackend {
    async fn put(&self, ctx: &Context, entry: Entry) -> PhysicalResult<()> {
        let start = Instant::now();
        let res = async {
            let _permit = self.permits.acquire(ctx).await?;
            let _guard = self.lock.write().await;
            self.check_fence(ctx).await?;
            self.put_internal(ctx, entry).await
        }
        .await;
        self.metrics.observe(Verb::Put, start, &res);
        res
    }

    async fn get(&self, ctx: &Context, key: &str) -> PhysicalResult<Option<Entry>> {
        let start = Instant::now();
        let res = async {
            let _permit = self.permits.acquire(ctx).await?;
            let _guard = self.lock.read().await;
            self.get_internal(ctx, key).await
        }
        .await;
        self.metrics.observe(Verb::Get, start, &res);
        res
    }

    async fn delete(&self, ctx: &Context, key: &str) -> PhysicalResult<()> {
        let start = Instant::now();
        let res = async {
            let _permit = self.permits.acquire(ctx).await?;
            let _guard = self.lock.write().await;
            self.check_fence(ctx).await?;
            self.delete_internal(ctx, key).await
        }
        .await;
        self.metrics.observe(Verb::Delete, start, &res);
        res
    }

    async fn list(&self, ctx: &Context, prefix: &str) -> PhysicalResult<Vec<String>> {
        let start = Instant::now();
        let res = async {
            let _permit = self.permits.acquire(ctx).await?;
            let _guard = self.lock.read().await;
            self.list_internal(ctx, prefix).await
        }
        .await;
        self.metrics.observe(Verb::List, start, &res);
        res
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        if self.transactional {
            Some(self)
        } else {
            None
        }
    }

    fn as_transaction_limits(&self) -> Option<&dyn TransactionalLimits> {
        if self.transactional {
            Some(self)
        } else {
            None
        }
    }

    fn as_ha(&self) -> Option<&dyn HABackend> {
        self.ha.as_ref().map(|_| self as &dyn HABackend)
    }

    fn as_fencing(&self) -> Option<&dyn FencingHABackend> {
        self.ha.as_ref().map(|_| self as &dyn FencingHABackend)
    }

    fn as_mount_table_limiting(&self) -> Option<&dyn MountTableLimitingBackend> {
        Some(self)
    }
}

#[async_trait]
impl Transactional for InmemBackend {
    async fn transaction(&self, ctx: &Context, txns: &mut [TxnEntry]) -> PhysicalResult<()> {
        let start = Instant::now();
        let res = async {
            let _permit = self.permits.acquire(ctx).await?;
            let _guard = self.lock.write().await;

            if self.faults.get_in_txn.load(Ordering::SeqCst)
                && txns.iter().any(|t| t.operation == Operation::Get)
            {
                return Err(PhysicalError::disabled("get in transaction"));
            }
            check_transaction_limits(txns, self.transaction_limits())?;
            self.check_fence(ctx).await?;
            generic_transaction_handler(ctx, self, txns).await
        }
        .await;
        self.metrics.observe(Verb::Transaction, start, &res);
        res
    }
}

impl TransactionalLimits for InmemBackend {
    fn transaction_limits(&self) -> (usize, usize) {
        (
            self.max_batch_entries.load(Ordering::SeqCst),
            self.max_batch_size.load(Ordering::SeqCst),
        )
    }
}

impl MountTableLimitingBackend for InmemBackend {
    fn register_mount_table_path(&self, path: &str) {
        self.mount_table_paths.write().push(path.to_string());
    }
}

impl HABackend for InmemBackend {
    fn lock_with(&self, key: &str, value: &str) -> PhysicalResult<Arc<dyn Lock>> {
        match self.ha {
            Some(ref ha) => ha.lock_with(key, value),
            None => Err(PhysicalError::unsupported("HA locking")),
        }
    }

    fn ha_enabled(&self) -> bool {
        self.ha.is_some()
    }
}

impl FencingHABackend for InmemBackend {
    fn register_active_node_lock(&self, lock: &Arc<dyn Lock>) -> PhysicalResult<()> {
        if self.ha.is_none() {
            return Err(PhysicalError::unsupported("fencing"));
        }
        self.fence.register(lock);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::observability::InmemSink;

    fn ctx() -> Context {
        Context::background()
    }

    #[tokio::test]
    async fn fault_toggles() {
        let b = InmemBackend::default();
        b.put(&ctx(), Entry::new("k", "v")).await.unwrap();

        b.fail_get(true);
        assert!(matches!(
            b.get(&ctx(), "k").await,
            Err(PhysicalError::OperationDisabled { .. })
        ));
        b.fail_get(false);

        b.fail_put(true);
        assert!(b.put(&ctx(), Entry::new("k", "w")).await.is_err());
        b.fail_put(false);

        b.fail_list(true);
        assert!(b.list(&ctx(), "").await.is_err());
        b.fail_list(false);

        b.fail_delete(true);
        assert!(b.delete(&ctx(), "k").await.is_err());
        b.fail_delete(false);

        assert_eq!(b.get(&ctx(), "k").await.unwrap().unwrap().value, b"v");
    }

    #[tokio::test]
    async fn value_and_key_limits() {
        let conf = DriverConfig::from_pairs([("max_value_size", "4"), ("max_key_size", "8")]);
        let b = InmemBackend::new(&conf, noop_sink()).unwrap();
        assert!(matches!(
            b.put(&ctx(), Entry::new("k", "12345")).await,
            Err(PhysicalError::ValueTooLarge { size: 5, max: 4 })
        ));
        assert!(matches!(
            b.put(&ctx(), Entry::new("much/too/long", "1")).await,
            Err(PhysicalError::KeyTooLarge { .. })
        ));

        b.register_mount_table_path("core/");
        b.put(&ctx(), Entry::new("core/m", vec![0u8; 16]))
            .await
            .unwrap();
        assert!(b
            .put(&ctx(), Entry::new("core/m", vec![0u8; 17]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn get_in_txn_fault() {
        let b = InmemBackend::new_transactional(&DriverConfig::new(), noop_sink()).unwrap();
        b.fail_get_in_txn(true);
        let mut txns = vec![TxnEntry::get("a"), TxnEntry::put("b", "1")];
        assert!(b.transaction(&ctx(), &mut txns).await.is_err());
        let mut txns = vec![TxnEntry::put("b", "1")];
        b.transaction(&ctx(), &mut txns).await.unwrap();
    }

    #[tokio::test]
    async fn transaction_limits_enforced() {
        let b = InmemBackend::new_transactional(&DriverConfig::new(), noop_sink()).unwrap();
        b.set_max_batch(2, 0);
        assert_eq!(b.transaction_limits(), (2, 0));
        let mut txns = vec![
            TxnEntry::put("a", "1"),
            TxnEntry::put("b", "1"),
            TxnEntry::put("c", "1"),
        ];
        assert!(b.transaction(&ctx(), &mut txns).await.is_err());
        assert!(b.is_empty());

        b.set_max_batch(0, 8);
        let mut txns = vec![TxnEntry::put("abc", "12345")];
        assert!(b.transaction(&ctx(), &mut txns).await.is_ok());
        let mut txns = vec![TxnEntry::put("abc", "123456")];
        assert!(b.transaction(&ctx(), &mut txns).await.is_err());
    }

    #[tokio::test]
    async fn capabilities_follow_variant() {
        let plain = InmemBackend::default();
        assert!(plain.as_transactional().is_none());
        assert!(plain.as_ha().is_none());

        let conf = DriverConfig::from_pairs([("ha_enabled", "true")]);
        let txn = InmemBackend::new_transactional(&conf, noop_sink()).unwrap();
        assert!(txn.as_transactional().is_some());
        assert!(txn.as_ha().is_some());
        assert!(txn.as_fencing().is_some());
        assert_eq!(txn.permits().capacity(), 1);
    }

    #[tokio::test]
    async fn metrics_are_recorded() {
        let sink = Arc::new(InmemSink::new());
        let b = InmemBackend::new(&DriverConfig::new(), sink.clone()).unwrap();
        b.put(&ctx(), Entry::new("a", "1")).await.unwrap();
        b.fail_get(true);
        let _ = b.get(&ctx(), "a").await;
        assert_eq!(sink.samples("inmem.put").unwrap().count, 1);
        assert_eq!(sink.counter("inmem.getFailed"), 1);
    }

    #[tokio::test]
    async fn write_latency_is_cancelable() {
        let b = InmemBackend::default();
        b.set_write_latency(Duration::from_secs(30));
        let c = Context::background().with_timeout(Duration::from_millis(20));
        assert!(matches!(
            b.put(&c, Entry::new("a", "1")).await,
            Err(PhysicalError::Canceled)
        ));
        assert!(b.is_empty());
    }
}
