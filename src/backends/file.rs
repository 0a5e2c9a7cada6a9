//! Local filesystem backend.
//!
//! One file per entry. A key `a/b/c` is stored as `<path>/a/b/_c`, holding the
//! JSON document `{"Value": "<base64>"}`. Writes go to a temporary sibling that
//! is renamed over the target, so a crash leaves either the old or the new
//! value. Deleting an entry removes every directory it leaves empty.

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
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;

/// Prefix marking entry files; directories carry no prefix.
const LEAF_PREFIX: char = '_';

/// Prefix of in-flight temporary files.
const TEMP_PREFIX: &str = ".tmp-";

#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    #[serde(rename = "Value", with = "base64_bytes")]
    value: Vec<u8>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Filesystem backend.
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
    lock: tokio::sync::RwLock<()>,
    permits: PermitPool,
    metrics: DriverMetrics,
    max_value_size: usize,
    transactional: bool,
}

impl FileBackend {
    /// Recognized options: `path` (required), `max_value_size`,
    /// `max_parallel`, `consistency_mode`.
    pub fn new(conf: &DriverConfig, sink: Arc<dyn MetricSink>) -> PhysicalResult<Self> {
        Self::from_options(false, conf, sink)
    }

    /// Transactional variant, serialized through a single permit.
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
        let root = PathBuf::from(conf.require_string("path")?);
        let capacity = if transactional { 1 } else { conf.max_parallel()? };
        if conf.strong_consistency()? {
            tracing::debug!(path = %root.display(), "file backend is always strongly consistent");
        }
        Ok(Self {
            root,
            lock: tokio::sync::RwLock::new(()),
            permits: PermitPool::new(capacity),
            metrics: DriverMetrics::new("file", sink),
            max_value_size: conf.usize("max_value_size")?.unwrap_or(0),
            transactional,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Split a key into its directory and leaf file path.
    fn paths(&self, key: &str) -> PhysicalResult<(PathBuf, PathBuf)> {
        validate_key(key)?;
        if key.starts_with('/') {
            return Err(PhysicalError::backend(format!(
                "key cannot begin with '/': {}",
                key
            )));
        }
        let (dir, leaf) = match key.rfind('/') {
            Some(i) => (self.root.join(&key[..i]), &key[i + 1..]),
            None => (self.root.clone(), key),
        };
        let file = dir.join(format!("{}{}", LEAF_PREFIX, leaf));
        Ok((dir, file))
    }

    /// Remove empty directories from `dir` up to, not including, the root.
    async fn cleanup_logical_path(&self, mut dir: PathBuf) -> PhysicalResult<()> {
        while dir != self.root && dir.starts_with(&self.root) {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    if !dir.pop() {
                        break;
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if entries.next_entry().await?.is_some() {
                break;
            }
            match tokio::fs::remove_dir(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                // A concurrent writer repopulated the directory.
                Err(_) => break,
            }
            if !dir.pop() {
                break;
            }
        }
        Ok(())
    }

    async fn create_dir(dir: &Path) -> PhysicalResult<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder.create(dir).await?;
        Ok(())
    }

    async fn write_atomic(
        ctx: &Context,
        dir: &Path,
        file: &Path,
        bytes: &[u8],
    ) -> PhysicalResult<()> {
        let tmp = dir.join(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4()));
        let mut opts = tokio::fs::OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        opts.mode(0o600);

        let res: PhysicalResult<()> = async {
            let mut f = opts.open(&tmp).await?;
            f.write_all(bytes).await?;
            f.sync_all().await?;
            drop(f);
            ctx.check()?;
            tokio::fs::rename(&tmp, file).await?;
            Ok(())
        }
        .await;
        if res.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        res
    }

    async fn list_internal(&self, ctx: &Context, prefix: &str) -> PhysicalResult<Vec<String>> {
        ctx.check()?;
        validate_key(prefix)?;
        let dir = self.root.join(prefix.trim_end_matches('/'));
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_dir() {
                names.push(format!("{}/", name));
            } else if let Some(leaf) = name.strip_prefix(LEAF_PREFIX) {
                names.push(leaf.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl PseudoTransactional for FileBackend {
    async fn get_internal(&self, ctx: &Context, key: &str) -> PhysicalResult<Option<Entry>> {
        ctx.check()?;
        let (_, file) = self.paths(key)?;
        let bytes = match tokio::fs::read(&file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.is_empty() {
            // Left behind by a crashed write.
            if let Err(err) = tokio::fs::remove_file(&file).await {
                tracing::debug!(key, error = %err, "failed to remove zero-byte entry");
            }
            return Ok(None);
        }
        let decoded: FileEntry = serde_json::from_slice(&bytes)
            .map_err(|e| PhysicalError::backend_from("decode file entry", e))?;
        Ok(Some(Entry::new(key, decoded.value)))
    }

    async fn put_internal(&self, ctx: &Context, entry: Entry) -> PhysicalResult<()> {
        ctx.check()?;
        validate_entry_size(&entry, 0, self.max_value_size)?;
        let (dir, file) = self.paths(&entry.key)?;
        let bytes = serde_json::to_vec(&FileEntry { value: entry.value })
            .map_err(|e| PhysicalError::backend_from("encode file entry", e))?;
        Self::create_dir(&dir).await?;
        Self::write_atomic(ctx, &dir, &file, &bytes).await
    }

    async fn delete_internal(&self, ctx: &Context, key: &str) -> PhysicalResult<()> {
        ctx.check()?;
        let (dir, file) = self.paths(key)?;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.cleanup_logical_path(dir).await
    }
}

#[async_trait]
impl Backend for FileBackend {
    async fn put(&self, ctx: &Context, entry: Entry) -> PhysicalResult<()> {
        let start = Instant::now();
        let res = async {
            let _permit = self.permits.acquire(ctx).await?;
            let _guard = self.lock.write().await;
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
}

#[async_trait]
impl Transactional for FileBackend {
    async fn transaction(&self, ctx: &Context, txns: &mut [TxnEntry]) -> PhysicalResult<()> {
        let start = Instant::now();
        let res = async {
            check_transaction_limits(txns, self.transaction_limits())?;
            let _permit = self.permits.acquire(ctx).await?;
            let _guard = self.lock.write().await;
            generic_transaction_handler(ctx, self, txns).await
        }
        .await;
        self.metrics.observe(Verb::Transaction, start, &res);
        res
    }
}

impl TransactionalLimits for FileBackend {
    fn transaction_limits(&self) -> (usize, usize) {
        (0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::observability::noop_sink;
    use base64::Engine;

    fn encode_file_value(value: &[u8]) -> String {
        format!(
            "{{\"Value\":\"{}\"}}",
            base64::engine::general_purpose::STANDARD.encode(value)
        )
    }

    fn backend(dir: &Path) -> FileBackend {
        let conf = DriverConfig::new().with("path", dir.to_string_lossy().to_string());
        FileBackend::new(&conf, noop_sink()).unwrap()
    }

    #[test]
    fn path_is_required() {
        assert!(matches!(
            FileBackend::new(&DriverConfig::new(), noop_sink()),
            Err(PhysicalError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn stores_leaf_files_as_json() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        b.put(&Context::background(), Entry::new("foo/bar", "baz"))
            .await
            .unwrap();
        let raw = std::fs::read_to_string(tmp.path().join("foo").join("_bar")).unwrap();
        assert_eq!(raw, encode_file_value(b"baz"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_and_dir_modes() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        b.put(&Context::background(), Entry::new("d/k", "v"))
            .await
            .unwrap();
        let dir_mode = std::fs::metadata(tmp.path().join("d"))
            .unwrap()
            .permissions()
            .mode();
        let file_mode = std::fs::metadata(tmp.path().join("d").join("_k"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        assert_eq!(file_mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn zero_byte_file_reads_as_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        std::fs::write(tmp.path().join("_crashed"), b"").unwrap();
        assert!(b
            .get(&Context::background(), "crashed")
            .await
            .unwrap()
            .is_none());
        assert!(!tmp.path().join("_crashed").exists());
    }

    #[tokio::test]
    async fn list_hides_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        b.put(&Context::background(), Entry::new("a", "1"))
            .await
            .unwrap();
        std::fs::write(tmp.path().join(".tmp-leftover"), b"x").unwrap();
        assert_eq!(b.list(&Context::background(), "").await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn rejects_parent_references() {
        let tmp = tempfile::tempdir().unwrap();
        let b = backend(tmp.path());
        assert!(matches!(
            b.put(&Context::background(), Entry::new("../escape", "x"))
                .await,
            Err(PhysicalError::PathContainsParentReferences)
        ));
    }
}
