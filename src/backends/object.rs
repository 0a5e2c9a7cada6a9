//! Object store backend (object_store).
//!
//! Entries map to objects under an optional root prefix. Like the file
//! backend, the leaf segment is stored with a `_` prefix so `foo` and
//! `foo/bar` can coexist on stores where a name is either an object or a
//! directory, and listing uses the store's native delimiter query.

use crate::core::config::DriverConfig;
use crate::core::context::Context;
use crate::core::error::{PhysicalError, PhysicalResult};
use crate::ops::observability::{DriverMetrics, MetricSink, Verb};
use crate::physical::{
    check_transaction_limits, generic_transaction_handler, validate_entry_size, validate_key,
    Backend, Entry, PermitPool,
    PseudoTransactional, Transactional, TransactionalLimits, TxnEntry,
};
use async_trait::async_trait;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

const LEAF_PREFIX: &str = "_";

fn translate(context: &str, err: object_store::Error) -> PhysicalError {
    PhysicalError::backend_from(context, err)
}

/// Object store driver.
pub struct ObjectBackend {
    store: Arc<dyn ObjectStore>,
    root: Vec<String>,
    permits: PermitPool,
    metrics: DriverMetrics,
    max_value_size: usize,
    /// Transactions take it exclusively, single operations shared.
    txn_lock: tokio::sync::RwLock<()>,
}

impl std::fmt::Debug for ObjectBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBackend")
            .field("store", &self.store.to_string())
            .field("root", &self.root.join("/"))
            .finish()
    }
}

impl ObjectBackend {
    /// Options: `store` (`memory` | `local` | `s3`), `path`, `bucket`,
    /// `region`, `endpoint`, `max_parallel`, `max_value_size`,
    /// `consistency_mode`.
    pub fn new(conf: &DriverConfig, sink: Arc<dyn MetricSink>) -> PhysicalResult<Self> {
        let kind = conf
            .string("store")?
            .unwrap_or_else(|| "memory".to_string());
        let path = conf.string("path")?.unwrap_or_default();

        let (store, prefix): (Arc<dyn ObjectStore>, String) = match kind.as_str() {
            "memory" => (Arc::new(object_store::memory::InMemory::new()), path),
            "local" => {
                if path.is_empty() {
                    return Err(PhysicalError::config("path", "is required for the local store"));
                }
                std::fs::create_dir_all(&path)?;
                let store = object_store::local::LocalFileSystem::new_with_prefix(&path)
                    .map_err(|e| translate("open local object store", e))?;
                (Arc::new(store), String::new())
            }
            #[cfg(feature = "s3")]
            "s3" => (Self::s3_store(conf)?, path),
            other => {
                return Err(PhysicalError::config(
                    "store",
                    format!("unsupported object store: {}", other),
                ))
            }
        };
        Self::with_store(store, &prefix, conf, sink)
    }

    #[cfg(feature = "s3")]
    fn s3_store(conf: &DriverConfig) -> PhysicalResult<Arc<dyn ObjectStore>> {
        let bucket = conf.require_string("bucket")?;
        let mut builder = object_store::aws::AmazonS3Builder::from_env().with_bucket_name(bucket);
        if let Some(region) = conf.string("region")? {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = conf.string("endpoint")? {
            builder = builder
                .with_allow_http(endpoint.starts_with("http://"))
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false);
        }
        let store = builder.build().map_err(|e| translate("build s3 store", e))?;
        Ok(Arc::new(store))
    }

    /// Wrap an existing store, rooting every key under `prefix`.
    pub fn with_store(
        store: Arc<dyn ObjectStore>,
        prefix: &str,
        conf: &DriverConfig,
        sink: Arc<dyn MetricSink>,
    ) -> PhysicalResult<Self> {
        validate_key(prefix)?;
        if conf.strong_consistency()? {
            tracing::info!(store = %store, "object backend: consistency_mode=strong requested");
        }
        Ok(Self {
            store,
            root: prefix
                .split('/')
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            permits: PermitPool::with_metrics(conf.max_parallel()?, "object", sink.clone()),
            metrics: DriverMetrics::new("object", sink),
            max_value_size: conf.usize("max_value_size")?.unwrap_or(0),
            txn_lock: tokio::sync::RwLock::new(()),
        })
    }

    /// Object path for `key`: root segments, key directories, `_leaf`.
    fn object_path(&self, key: &str) -> PhysicalResult<ObjectPath> {
        validate_key(key)?;
        let (dir, leaf) = match key.rfind('/') {
            Some(i) => (&key[..i], &key[i + 1..]),
            None => ("", key),
        };
        if leaf.is_empty() {
            return Err(PhysicalError::backend(format!(
                "key must name an entry, not a directory: {}",
                key
            )));
        }
        let leaf = format!("{}{}", LEAF_PREFIX, leaf);
        let parts = self
            .root
            .iter()
            .map(String::as_str)
            .chain(dir.split('/').filter(|s| !s.is_empty()))
            .chain(std::iter::once(leaf.as_str()));
        Ok(ObjectPath::from_iter(parts))
    }

    fn dir_path(&self, dir: &str) -> ObjectPath {
        ObjectPath::from_iter(
            self.root
                .iter()
                .map(String::as_str)
                .chain(dir.split('/').filter(|s| !s.is_empty())),
        )
    }

    fn observe<T>(&self, verb: Verb, start: Instant, res: &PhysicalResult<T>) {
        self.metrics.observe(verb, start, res);
        if let Err(PhysicalError::Backend { .. }) = res {
            self.metrics.server_error();
        }
    }

    async fn list_internal(&self, ctx: &Context, prefix: &str) -> PhysicalResult<Vec<String>> {
        validate_key(prefix)?;
        // "a/b/pa" lists directory "a/b/" and keeps names starting with "pa".
        let (dir, partial) = match prefix.rfind('/') {
            Some(i) => (&prefix[..i], &prefix[i + 1..]),
            None => ("", prefix),
        };
        let dir_path = self.dir_path(dir);
        let listing = ctx
            .run(async {
                let query = if dir_path.as_ref().is_empty() {
                    None
                } else {
                    Some(&dir_path)
                };
                self.store
                    .list_with_delimiter(query)
                    .await
                    .map_err(|e| translate("object list", e))
            })
            .await?;

        let mut names = BTreeSet::new();
        for common in &listing.common_prefixes {
            if let Some(name) = common.filename() {
                if let Some(rest) = name.strip_prefix(partial) {
                    names.insert(format!("{}/", rest));
                }
            }
        }
        for object in &listing.objects {
            let Some(name) = object.location.filename() else {
                continue;
            };
            let Some(leaf) = name.strip_prefix(LEAF_PREFIX) else {
                continue;
            };
            if let Some(rest) = leaf.strip_prefix(partial) {
                if !rest.is_empty() {
                    names.insert(rest.to_string());
                }
            }
        }
        Ok(names.into_iter().collect())
    }
}

#[async_trait]
impl PseudoTransactional for ObjectBackend {
    async fn get_internal(&self, ctx: &Context, key: &str) -> PhysicalResult<Option<Entry>> {
        let path = self.object_path(key)?;
        ctx.run(async {
            match self.store.get(&path).await {
                Ok(result) => {
                    let bytes = result
                        .bytes()
                        .await
                        .map_err(|e| translate("object read", e))?;
                    Ok(Some(Entry::new(key, bytes.to_vec())))
                }
                Err(object_store::Error::NotFound { .. }) => Ok(None),
                Err(e) => Err(translate("object get", e)),
            }
        })
        .await
    }

    async fn put_internal(&self, ctx: &Context, entry: Entry) -> PhysicalResult<()> {
        validate_entry_size(&entry, 0, self.max_value_size)?;
        let path = self.object_path(&entry.key)?;
        ctx.run(async {
            self.store
                .put(&path, entry.value.into())
                .await
                .map_err(|e| translate("object put", e))?;
            Ok(())
        })
        .await
    }

    async fn delete_internal(&self, ctx: &Context, key: &str) -> PhysicalResult<()> {
        let path = self.object_path(key)?;
        ctx.run(async {
            match self.store.delete(&path).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(translate("object delete", e)),
            }
        })
        .await
    }
}

#[async_trait]
impl Backend for ObjectBackend {
    async fn put(&self, ctx: &Context, entry: Entry) -> PhysicalResult<()> {
        let start = Instant::now();
        let res = async {
            let _permit = self.permits.acquire(ctx).await?;
            let _guard = self.txn_lock.read().await;
            self.put_internal(ctx, entry).await
        }
        .await;
        self.observe(Verb::Put, start, &res);
        res
    }

    async fn get(&self, ctx: &Context, key: &str) -> PhysicalResult<Option<Entry>> {
        let start = Instant::now();
        let res = async {
            let _permit = self.permits.acquire(ctx).await?;
            let _guard = self.txn_lock.read().await;
            self.get_internal(ctx, key).await
        }
        .await;
        self.observe(Verb::Get, start, &res);
        res
    }

    async fn delete(&self, ctx: &Context, key: &str) -> PhysicalResult<()> {
        let start = Instant::now();
        let res = async {
            let _permit = self.permits.acquire(ctx).await?;
            let _guard = self.txn_lock.read().await;
            self.delete_internal(ctx, key).await
        }
        .await;
        self.observe(Verb::Delete, start, &res);
        res
    }

    async fn list(&self, ctx: &Context, prefix: &str) -> PhysicalResult<Vec<String>> {
        let start = Instant::now();
        let res = async {
            let _permit = self.permits.acquire(ctx).await?;
            let _guard = self.txn_lock.read().await;
            self.list_internal(ctx, prefix).await
        }
        .await;
        self.observe(Verb::List, start, &res);
        res
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        Some(self)
    }

    fn as_transaction_limits(&self) -> Option<&dyn TransactionalLimits> {
        Some(self)
    }
}

#[async_trait]
impl Transactional for ObjectBackend {
    async fn transaction(&self, ctx: &Context, txns: &mut [TxnEntry]) -> PhysicalResult<()> {
        let start = Instant::now();
        let res = async {
            check_transaction_limits(txns, self.transaction_limits())?;
            let _permit = self.permits.acquire(ctx).await?;
            let _guard = self.txn_lock.write().await;
            generic_transaction_handler(ctx, self, txns).await
        }
        .await;
        self.observe(Verb::Transaction, start, &res);
        res
    }
}

impl TransactionalLimits for ObjectBackend {
    fn transaction_limits(&self) -> (usize, usize) {
        (0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::observability::noop_sink;

    fn memory(prefix: &str) -> ObjectBackend {
        ObjectBackend::with_store(
            Arc::new(object_store::memory::InMemory::new()),
            prefix,
            &DriverConfig::new(),
            noop_sink(),
        )
        .unwrap()
    }

    #[test]
    fn object_paths_decorate_leaves() {
        let b = memory("root/sub");
        assert_eq!(b.object_path("a/b").unwrap().as_ref(), "root/sub/a/_b");
        assert_eq!(b.object_path("leaf").unwrap().as_ref(), "root/sub/_leaf");
        assert!(b.object_path("dir/").is_err());
    }

    #[tokio::test]
    async fn partial_prefix_listing() {
        let b = memory("");
        let ctx = Context::background();
        for key in ["foo", "foo/bar", "fox", "zap"] {
            b.put(&ctx, Entry::new(key, "v")).await.unwrap();
        }
        assert_eq!(b.list(&ctx, "fo").await.unwrap(), vec!["o", "o/", "x"]);
        assert_eq!(b.list(&ctx, "").await.unwrap(), vec!["foo", "foo/", "fox", "zap"]);
    }

    #[test]
    fn unknown_store_rejected() {
        let conf = DriverConfig::from_pairs([("store", "tape")]);
        assert!(matches!(
            ObjectBackend::new(&conf, noop_sink()),
            Err(PhysicalError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn local_store_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let conf = DriverConfig::from_pairs([("store", "local")])
            .with("path", tmp.path().to_string_lossy().to_string());
        let b = ObjectBackend::new(&conf, noop_sink()).unwrap();
        let ctx = Context::background();
        b.put(&ctx, Entry::new("foo", "test")).await.unwrap();
        b.put(&ctx, Entry::new("foo/bar", "baz")).await.unwrap();
        assert_eq!(b.get(&ctx, "foo").await.unwrap().unwrap().value, b"test");
        assert_eq!(b.list(&ctx, "").await.unwrap(), vec!["foo", "foo/"]);
        assert_eq!(b.list(&ctx, "foo/").await.unwrap(), vec!["bar"]);
    }
}
