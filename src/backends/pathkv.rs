//! Embedded path-decorated KV backend (redb).
//!
//! redb is a flat ordered store, so hierarchy is encoded in the keys:
//!
//! ```text
//! 'o' <dir> 0x00 <leaf>    entry <dir>/<leaf>, value = entry bytes
//! 'd' <dir> 0x00 <name>    subdirectory <dir>/<name>/, value = u64 BE child count
//! ```
//!
//! `<dir>` is escaped (`0x00` -> `0x01 0x01`, `0x01` -> `0x01 0x02`) so the
//! first `0x00` always ends it; keys may contain NUL bytes.
//!
//! Listing `<dir>/` is two range reads, one per marker, each returning exactly
//! the immediate children. Directory markers are refcounted by their direct
//! children and removed when the count drops to zero. All of this happens in
//! a single write transaction, which also makes multi-entry transactions
//! native.

use crate::core::config::DriverConfig;
use crate::core::context::Context;
use crate::core::error::{PhysicalError, PhysicalResult};
use crate::ops::observability::{DriverMetrics, MetricSink, Verb};
use crate::physical::{
    check_transaction_limits, validate_entry_size, validate_key, validate_txn_entries,
    Backend, Entry, Operation, PermitPool, Transactional, TransactionalLimits, TxnEntry,
};
use async_trait::async_trait;
use redb::{Database, ReadableTable, Table, TableDefinition};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

const KV_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("stratum_pathkv");

const ENTRY_MARKER: u8 = b'o';
const DIR_MARKER: u8 = b'd';
const SEPARATOR: u8 = 0x00;
const ESCAPE: u8 = 0x01;

fn db_err<E: Into<redb::Error>>(err: E) -> PhysicalError {
    PhysicalError::backend_from("pathkv", err.into())
}

// ============================================================================
// Key encoding
// ============================================================================

/// Split `a/b/c` into `("a/b", "c")`.
fn split_key(key: &str) -> (&str, &str) {
    match key.rfind('/') {
        Some(i) => (&key[..i], &key[i + 1..]),
        None => ("", key),
    }
}

fn push_dir(out: &mut Vec<u8>, dir: &str) {
    for &b in dir.as_bytes() {
        match b {
            SEPARATOR => out.extend_from_slice(&[ESCAPE, 0x01]),
            ESCAPE => out.extend_from_slice(&[ESCAPE, 0x02]),
            _ => out.push(b),
        }
    }
}

fn marker_key(marker: u8, dir: &str, name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(dir.len() + name.len() + 2);
    out.push(marker);
    push_dir(&mut out, dir);
    out.push(SEPARATOR);
    out.extend_from_slice(name.as_bytes());
    out
}

/// Half-open byte range covering every `marker` child of `dir`.
fn child_range(marker: u8, dir: &str) -> (Vec<u8>, Vec<u8>) {
    let mut start = Vec::with_capacity(dir.len() + 2);
    start.push(marker);
    push_dir(&mut start, dir);
    let mut end = start.clone();
    start.push(SEPARATOR);
    end.push(SEPARATOR + 1);
    (start, end)
}

fn decode_count(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[8 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    u64::from_be_bytes(buf)
}

// ============================================================================
// Table operations (inside one transaction)
// ============================================================================

type KvTable<'txn> = Table<'txn, &'static [u8], &'static [u8]>;

fn get_in<T>(table: &T, key: &str) -> PhysicalResult<Option<Vec<u8>>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let (dir, leaf) = split_key(key);
    let k = marker_key(ENTRY_MARKER, dir, leaf);
    Ok(table
        .get(k.as_slice())
        .map_err(db_err)?
        .map(|v| v.value().to_vec()))
}

/// Add `delta` to the child count of directory `dir`, creating or removing
/// its marker and cascading to the parent when it appears or disappears.
fn adjust_dir(table: &mut KvTable<'_>, dir: &str, delta: i64) -> PhysicalResult<()> {
    let mut dir = dir.to_string();
    let mut delta = delta;
    while !dir.is_empty() && delta != 0 {
        let (parent, name) = split_key(&dir);
        let k = marker_key(DIR_MARKER, parent, name);
        let current = table
            .get(k.as_slice())
            .map_err(db_err)?
            .map(|v| decode_count(v.value()))
            .unwrap_or(0);
        let next = (current as i64 + delta).max(0) as u64;

        let cascade = match (current, next) {
            (0, n) if n > 0 => 1,
            (c, 0) if c > 0 => -1,
            _ => 0,
        };
        if next == 0 {
            table.remove(k.as_slice()).map_err(db_err)?;
        } else {
            table
                .insert(k.as_slice(), next.to_be_bytes().as_slice())
                .map_err(db_err)?;
        }

        delta = cascade;
        dir = parent.to_string();
    }
    Ok(())
}

fn put_in(table: &mut KvTable<'_>, key: &str, value: &[u8]) -> PhysicalResult<()> {
    let (dir, leaf) = split_key(key);
    let k = marker_key(ENTRY_MARKER, dir, leaf);
    let existed = table.get(k.as_slice()).map_err(db_err)?.is_some();
    table.insert(k.as_slice(), value).map_err(db_err)?;
    if !existed {
        adjust_dir(table, dir, 1)?;
    }
    Ok(())
}

fn delete_in(table: &mut KvTable<'_>, key: &str) -> PhysicalResult<()> {
    let (dir, leaf) = split_key(key);
    let k = marker_key(ENTRY_MARKER, dir, leaf);
    let existed = table.remove(k.as_slice()).map_err(db_err)?.is_some();
    if existed {
        adjust_dir(table, dir, -1)?;
    }
    Ok(())
}

fn names_in<T>(table: &T, marker: u8, dir: &str) -> PhysicalResult<Vec<String>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let (start, end) = child_range(marker, dir);
    let mut names = Vec::new();
    for item in table
        .range::<&[u8]>(start.as_slice()..end.as_slice())
        .map_err(db_err)?
    {
        let (k, _) = item.map_err(db_err)?;
        let name = &k.value()[start.len()..];
        names.push(String::from_utf8_lossy(name).into_owned());
    }
    Ok(names)
}

fn list_in<T>(table: &T, prefix: &str) -> PhysicalResult<Vec<String>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let (dir, partial) = split_key(prefix);
    let mut out = BTreeSet::new();
    for name in names_in(table, DIR_MARKER, dir)? {
        if let Some(rest) = name.strip_prefix(partial) {
            out.insert(format!("{}/", rest));
        }
    }
    for name in names_in(table, ENTRY_MARKER, dir)? {
        if let Some(rest) = name.strip_prefix(partial) {
            if !rest.is_empty() {
                out.insert(rest.to_string());
            }
        }
    }
    Ok(out.into_iter().collect())
}

// ============================================================================
// Backend
// ============================================================================

/// redb-backed driver.
pub struct PathKvBackend {
    db: Arc<Database>,
    path: PathBuf,
    permits: PermitPool,
    metrics: DriverMetrics,
    max_value_size: usize,
    limits: (usize, usize),
}

impl std::fmt::Debug for PathKvBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathKvBackend")
            .field("path", &self.path)
            .finish()
    }
}

impl PathKvBackend {
    /// Options: `path` (database file, required), `max_parallel`,
    /// `max_value_size`, `transaction_max_entries`, `transaction_max_size`,
    /// `consistency_mode`.
    pub fn new(conf: &DriverConfig, sink: Arc<dyn MetricSink>) -> PhysicalResult<Self> {
        let path = PathBuf::from(conf.require_string("path")?);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        if conf.strong_consistency()? {
            tracing::debug!(path = %path.display(), "pathkv is always strongly consistent");
        }

        let db = Database::create(&path).map_err(db_err)?;
        let txn = db.begin_write().map_err(db_err)?;
        {
            txn.open_table(KV_TABLE).map_err(db_err)?;
        }
        txn.commit().map_err(db_err)?;

        Ok(Self {
            db: Arc::new(db),
            path,
            permits: PermitPool::with_metrics(conf.max_parallel()?, "pathkv", sink.clone()),
            metrics: DriverMetrics::new("pathkv", sink),
            max_value_size: conf.usize("max_value_size")?.unwrap_or(0),
            limits: (
                conf.usize("transaction_max_entries")?.unwrap_or(0),
                conf.usize("transaction_max_size")?.unwrap_or(0),
            ),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` inside one write transaction on the blocking pool. The commit
    /// is skipped if `ctx` is canceled by then.
    async fn write_txn<T, F>(&self, ctx: &Context, f: F) -> PhysicalResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut KvTable<'_>) -> PhysicalResult<T> + Send + 'static,
    {
        let db = self.db.clone();
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write().map_err(db_err)?;
            let out = {
                let mut table = txn.open_table(KV_TABLE).map_err(db_err)?;
                f(&mut table)
            };
            match out {
                Ok(value) if !ctx.is_cancelled() => {
                    txn.commit().map_err(db_err)?;
                    Ok(value)
                }
                Ok(_) => {
                    txn.abort().map_err(db_err)?;
                    Err(PhysicalError::Canceled)
                }
                Err(err) => {
                    txn.abort().map_err(db_err)?;
                    Err(err)
                }
            }
        })
        .await
        .map_err(|e| PhysicalError::backend(format!("pathkv task failed: {}", e)))?
    }

    async fn read_txn<T, F>(&self, f: F) -> PhysicalResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&redb::ReadOnlyTable<&'static [u8], &'static [u8]>) -> PhysicalResult<T>
            + Send
            + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read().map_err(db_err)?;
            let table = txn.open_table(KV_TABLE).map_err(db_err)?;
            f(&table)
        })
        .await
        .map_err(|e| PhysicalError::backend(format!("pathkv task failed: {}", e)))?
    }
}

#[async_trait]
impl Backend for PathKvBackend {
    async fn put(&self, ctx: &Context, entry: Entry) -> PhysicalResult<()> {
        let start = Instant::now();
        let res = async {
            validate_key(&entry.key)?;
            validate_entry_size(&entry, 0, self.max_value_size)?;
            let _permit = self.permits.acquire(ctx).await?;
            ctx.check()?;
            self.write_txn(ctx, move |table| put_in(table, &entry.key, &entry.value))
                .await
        }
        .await;
        self.metrics.observe(Verb::Put, start, &res);
        res
    }

    async fn get(&self, ctx: &Context, key: &str) -> PhysicalResult<Option<Entry>> {
        let start = Instant::now();
        let res = async {
            validate_key(key)?;
            let _permit = self.permits.acquire(ctx).await?;
            ctx.check()?;
            let owned = key.to_string();
            let value = self.read_txn(move |table| get_in(table, &owned)).await?;
            Ok(value.map(|v| Entry::new(key, v)))
        }
        .await;
        self.metrics.observe(Verb::Get, start, &res);
        res
    }

    async fn delete(&self, ctx: &Context, key: &str) -> PhysicalResult<()> {
        let start = Instant::now();
        let res = async {
            validate_key(key)?;
            let _permit = self.permits.acquire(ctx).await?;
            ctx.check()?;
            let owned = key.to_string();
            self.write_txn(ctx, move |table| delete_in(table, &owned))
                .await
        }
        .await;
        self.metrics.observe(Verb::Delete, start, &res);
        res
    }

    async fn list(&self, ctx: &Context, prefix: &str) -> PhysicalResult<Vec<String>> {
        let start = Instant::now();
        let res = async {
            validate_key(prefix)?;
            let _permit = self.permits.acquire(ctx).await?;
            ctx.check()?;
            let owned = prefix.to_string();
            self.read_txn(move |table| list_in(table, &owned)).await
        }
        .await;
        self.metrics.observe(Verb::List, start, &res);
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
impl Transactional for PathKvBackend {
    async fn transaction(&self, ctx: &Context, txns: &mut [TxnEntry]) -> PhysicalResult<()> {
        let start = Instant::now();
        let res = async {
            validate_txn_entries(txns)?;
            check_transaction_limits(txns, self.limits)?;
            for txn in txns.iter() {
                if txn.operation == Operation::Put {
                    validate_entry_size(&txn.entry, 0, self.max_value_size)?;
                }
            }
            let _permit = self.permits.acquire(ctx).await?;
            ctx.check()?;

            let ops: Vec<TxnEntry> = txns.to_vec();
            let fetched = self
                .write_txn(ctx, move |table| {
                    let mut fetched = Vec::new();
                    for (i, txn) in ops.iter().enumerate() {
                        if txn.operation == Operation::Get {
                            if let Some(value) = get_in(&*table, &txn.entry.key)? {
                                fetched.push((i, value));
                            }
                        }
                    }
                    for txn in &ops {
                        match txn.operation {
                            Operation::Put => put_in(table, &txn.entry.key, &txn.entry.value)?,
                            Operation::Delete => delete_in(table, &txn.entry.key)?,
                            Operation::Get | Operation::List => {}
                        }
                    }
                    Ok(fetched)
                })
                .await?;

            for (i, value) in fetched {
                txns[i].entry.value = value;
            }
            Ok(())
        }
        .await;
        self.metrics.observe(Verb::Transaction, start, &res);
        res
    }
}

impl TransactionalLimits for PathKvBackend {
    fn transaction_limits(&self) -> (usize, usize) {
        self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::observability::noop_sink;

    fn open(dir: &Path) -> PathKvBackend {
        let conf = DriverConfig::new().with(
            "path",
            dir.join("data.redb").to_string_lossy().to_string(),
        );
        PathKvBackend::new(&conf, noop_sink()).unwrap()
    }

    #[test]
    fn marker_keys() {
        assert_eq!(marker_key(ENTRY_MARKER, "a/b", "c"), b"oa/b\0c".to_vec());
        assert_eq!(marker_key(DIR_MARKER, "", "a"), b"d\0a".to_vec());
        let (start, end) = child_range(ENTRY_MARKER, "a");
        assert_eq!(start, b"oa\0".to_vec());
        assert_eq!(end, b"oa\x01".to_vec());
        assert_eq!(decode_count(&7u64.to_be_bytes()), 7);
        assert_eq!(
            marker_key(ENTRY_MARKER, "a\0b", "x"),
            b"oa\x01\x01b\0x".to_vec()
        );
    }

    #[tokio::test]
    async fn nul_bytes_do_not_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let b = open(tmp.path());
        let ctx = Context::background();

        b.put(&ctx, Entry::new("a\0b/x", "first")).await.unwrap();
        b.put(&ctx, Entry::new("a/b\0x", "second")).await.unwrap();
        b.put(&ctx, Entry::new("a\u{1}/y", "third")).await.unwrap();

        for (key, want) in [
            ("a\0b/x", "first"),
            ("a/b\0x", "second"),
            ("a\u{1}/y", "third"),
        ] {
            let got = b.get(&ctx, key).await.unwrap().unwrap();
            assert_eq!(got.value, want.as_bytes(), "key {:?}", key);
        }

        assert_eq!(b.list(&ctx, "a/").await.unwrap(), vec!["b\0x"]);
        assert_eq!(b.list(&ctx, "a\0b/").await.unwrap(), vec!["x"]);
        assert_eq!(
            b.list(&ctx, "").await.unwrap(),
            vec!["a\u{0}b/", "a\u{1}/", "a/"]
        );
    }

    #[tokio::test]
    async fn directory_markers_are_refcounted() {
        let tmp = tempfile::tempdir().unwrap();
        let b = open(tmp.path());
        let ctx = Context::background();

        b.put(&ctx, Entry::new("a/b/c", "1")).await.unwrap();
        b.put(&ctx, Entry::new("a/b/d", "2")).await.unwrap();
        b.put(&ctx, Entry::new("a/b/d", "3")).await.unwrap();
        assert_eq!(b.list(&ctx, "").await.unwrap(), vec!["a/"]);
        assert_eq!(b.list(&ctx, "a/").await.unwrap(), vec!["b/"]);
        assert_eq!(b.list(&ctx, "a/b/").await.unwrap(), vec!["c", "d"]);

        b.delete(&ctx, "a/b/c").await.unwrap();
        assert_eq!(b.list(&ctx, "a/").await.unwrap(), vec!["b/"]);
        b.delete(&ctx, "a/b/d").await.unwrap();
        assert!(b.list(&ctx, "").await.unwrap().is_empty());
        assert!(b.list(&ctx, "a/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sibling_prefixes_do_not_leak() {
        let tmp = tempfile::tempdir().unwrap();
        let b = open(tmp.path());
        let ctx = Context::background();
        b.put(&ctx, Entry::new("ab/x", "1")).await.unwrap();
        b.put(&ctx, Entry::new("a/y", "2")).await.unwrap();
        assert_eq!(b.list(&ctx, "a/").await.unwrap(), vec!["y"]);
        assert_eq!(b.list(&ctx, "").await.unwrap(), vec!["a/", "ab/"]);
    }

    #[tokio::test]
    async fn reopen_keeps_data() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let b = open(tmp.path());
            b.put(&Context::background(), Entry::new("k", "v"))
                .await
                .unwrap();
        }
        let b = open(tmp.path());
        let got = b.get(&Context::background(), "k").await.unwrap().unwrap();
        assert_eq!(got.value, b"v");
    }
}
