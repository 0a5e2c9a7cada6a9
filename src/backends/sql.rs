//! SQL backend (SQLite through sqlx).
//!
//! Entries live in a two-column table `(k TEXT PRIMARY KEY, v BLOB)`; lock
//! records in a separate HA table. Transactions and fenced writes run inside
//! one database transaction, so the fencing check and the mutation commit
//! together.

use crate::core::config::DriverConfig;
use crate::core::context::Context;
use crate::core::error::{PhysicalError, PhysicalResult};
use crate::ha::fencing::{check_record, FenceGuard};
use crate::ha::lease::{now_millis, LeaseConfig, LeaseHA, LeaseMode, LeaseStore, LockRecord};
use crate::ops::observability::{DriverMetrics, MetricSink, Verb};
use crate::physical::{
    check_transaction_limits, collapse_children, validate_entry_size, validate_key,
    validate_txn_entries, Backend, Entry, FencingHABackend, FencingToken, HABackend, Lock,
    Operation, PermitPool, Transactional, TransactionalLimits, TxnEntry,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_TABLE: &str = "stratum_kv";
pub const DEFAULT_HA_TABLE: &str = "stratum_ha_locks";

/// Upper bound on pooled connections regardless of `max_parallel`.
const MAX_POOL_CONNECTIONS: usize = 16;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite result codes for "database is busy/locked".
const SQLITE_BUSY_CODES: &[&str] = &["5", "6", "517"];

fn validate_identifier(key: &str, name: &str) -> PhysicalResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(PhysicalError::config(
            key,
            format!("invalid table name: {:?}", name),
        ));
    }
    Ok(())
}

fn translate(context: &str, err: sqlx::Error) -> PhysicalError {
    if let sqlx::Error::Database(ref db_err) = err {
        if let Some(code) = db_err.code() {
            let code: &str = &code;
            if SQLITE_BUSY_CODES.contains(&code) {
                return PhysicalError::TransactionConflict {
                    message: format!("{}: {}", context, db_err.message()),
                };
            }
        }
    }
    PhysicalError::backend_from(context, err)
}

/// Prepared SQL text for one table pair.
#[derive(Debug, Clone)]
struct Statements {
    get: String,
    put: String,
    delete: String,
    list: String,
}

impl Statements {
    fn new(table: &str) -> Self {
        Self {
            get: format!("SELECT v FROM {} WHERE k = ?", table),
            put: format!(
                "INSERT INTO {} (k, v) VALUES (?, ?) ON CONFLICT(k) DO UPDATE SET v = excluded.v",
                table
            ),
            delete: format!("DELETE FROM {} WHERE k = ?", table),
            list: format!(
                "SELECT k FROM {} WHERE k >= ? AND substr(k, 1, ?) = ? ORDER BY k",
                table
            ),
        }
    }
}

// ============================================================================
// Lease store
// ============================================================================

/// Lock records in the HA table.
#[derive(Debug, Clone)]
pub struct SqlLeaseStore {
    pool: SqlitePool,
    acquire: String,
    renew: String,
    read: String,
    release: String,
}

impl SqlLeaseStore {
    fn new(pool: SqlitePool, table: &str) -> Self {
        Self {
            pool,
            acquire: format!(
                "INSERT INTO {t} (k, value, owner, expires_ms) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(k) DO UPDATE SET value = excluded.value, owner = excluded.owner, \
                 expires_ms = excluded.expires_ms \
                 WHERE {t}.owner = excluded.owner OR {t}.expires_ms <= ?",
                t = table
            ),
            renew: format!(
                "UPDATE {} SET value = ?, expires_ms = ? WHERE k = ? AND owner = ?",
                table
            ),
            read: format!(
                "SELECT value, owner, expires_ms FROM {} WHERE k = ?",
                table
            ),
            release: format!("DELETE FROM {} WHERE k = ? AND owner = ?", table),
        }
    }

    async fn read_in(
        &self,
        conn: &mut SqliteConnection,
        key: &str,
    ) -> PhysicalResult<Option<LockRecord>> {
        let row = sqlx::query_as::<_, (String, String, i64)>(&self.read)
            .bind(key)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| translate("sql read lock", e))?;
        Ok(row.map(|(value, owner, expires)| LockRecord {
            value,
            owner,
            expires_at_ms: expires.max(0) as u64,
        }))
    }
}

#[async_trait]
impl LeaseStore for SqlLeaseStore {
    async fn compare_and_set_lease(
        &self,
        key: &str,
        record: &LockRecord,
        mode: LeaseMode,
    ) -> PhysicalResult<bool> {
        let res = match mode {
            LeaseMode::Acquire => {
                sqlx::query(&self.acquire)
                    .bind(key)
                    .bind(&record.value)
                    .bind(&record.owner)
                    .bind(record.expires_at_ms as i64)
                    .bind(now_millis() as i64)
                    .execute(&self.pool)
                    .await
            }
            LeaseMode::Renew => {
                sqlx::query(&self.renew)
                    .bind(&record.value)
                    .bind(record.expires_at_ms as i64)
                    .bind(key)
                    .bind(&record.owner)
                    .execute(&self.pool)
                    .await
            }
        };
        let done = res.map_err(|e| translate("sql write lock", e))?;
        Ok(done.rows_affected() == 1)
    }

    async fn read_lease(&self, key: &str) -> PhysicalResult<Option<LockRecord>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| translate("sql acquire connection", e))?;
        self.read_in(&mut *conn, key).await
    }

    async fn release_lease(&self, key: &str, owner: &str) -> PhysicalResult<()> {
        sqlx::query(&self.release)
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(|e| translate("sql release lock", e))?;
        Ok(())
    }
}

// ============================================================================
// Backend
// ============================================================================

/// SQLite-backed driver.
#[derive(Debug)]
pub struct SqlBackend {
    pool: SqlitePool,
    stmts: Statements,
    permits: PermitPool,
    metrics: DriverMetrics,
    max_value_size: usize,
    limits: (usize, usize),
    leases: Arc<SqlLeaseStore>,
    ha: Option<LeaseHA>,
    fence: FenceGuard,
}

impl SqlBackend {
    /// Connect and create the tables if needed.
    ///
    /// Options: `connection_url` or `path`, `table`, `ha_table`,
    /// `max_parallel`, `max_value_size`, `ha_enabled`, `lock_*`,
    /// `transaction_max_entries`, `transaction_max_size`, `consistency_mode`.
    pub async fn new(conf: &DriverConfig, sink: Arc<dyn MetricSink>) -> PhysicalResult<Self> {
        let url = match conf.string("connection_url")? {
            Some(url) if !url.is_empty() => url,
            _ => format!("sqlite:{}?mode=rwc", conf.require_string("path")?),
        };
        let table = conf
            .string("table")?
            .unwrap_or_else(|| DEFAULT_TABLE.to_string());
        let ha_table = conf
            .string("ha_table")?
            .unwrap_or_else(|| DEFAULT_HA_TABLE.to_string());
        validate_identifier("table", &table)?;
        validate_identifier("ha_table", &ha_table)?;
        if conf.strong_consistency()? {
            tracing::info!(
                "sql backend: consistency_mode=strong (SQLite reads are always consistent)"
            );
        }

        let permits = PermitPool::with_metrics(conf.max_parallel()?, "sql", sink.clone());
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| PhysicalError::config("connection_url", e.to_string()))?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(permits.capacity().min(MAX_POOL_CONNECTIONS) as u32)
            .connect_with(options)
            .await
            .map_err(|e| translate("sql connect", e))?;

        Self::initialize_schema(&pool, &table, &ha_table).await?;

        let leases = Arc::new(SqlLeaseStore::new(pool.clone(), &ha_table));
        let ha = if conf.bool_or("ha_enabled", false)? {
            Some(LeaseHA::new(leases.clone(), LeaseConfig::from_options(conf)?))
        } else {
            None
        };

        tracing::debug!(table = %table, ha_table = %ha_table, "sql backend ready");
        Ok(Self {
            pool,
            stmts: Statements::new(&table),
            permits,
            metrics: DriverMetrics::new("sql", sink),
            max_value_size: conf.usize("max_value_size")?.unwrap_or(0),
            limits: (
                conf.usize("transaction_max_entries")?.unwrap_or(0),
                conf.usize("transaction_max_size")?.unwrap_or(0),
            ),
            leases,
            ha,
            fence: FenceGuard::new(),
        })
    }

    async fn initialize_schema(
        pool: &SqlitePool,
        table: &str,
        ha_table: &str,
    ) -> PhysicalResult<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (k TEXT PRIMARY KEY, v BLOB NOT NULL)",
            table
        ))
        .execute(pool)
        .await
        .map_err(|e| translate("sql create table", e))?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                k TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                owner TEXT NOT NULL,
                expires_ms INTEGER NOT NULL
            )
            "#,
            ha_table
        ))
        .execute(pool)
        .await
        .map_err(|e| translate("sql create ha table", e))?;
        Ok(())
    }

    /// Lease store backing the HA lock.
    pub fn lease_store(&self) -> &Arc<SqlLeaseStore> {
        &self.leases
    }

    fn fence_token(&self, ctx: &Context) -> PhysicalResult<Option<FencingToken>> {
        if self.ha.is_none() {
            return Ok(None);
        }
        self.fence.token_for(ctx)
    }

    fn observe<T>(&self, verb: Verb, start: Instant, res: &PhysicalResult<T>) {
        self.metrics.observe(verb, start, res);
        if let Err(PhysicalError::Backend { .. }) = res {
            self.metrics.server_error();
        }
    }

    async fn write(&self, ctx: &Context, key: &str, value: Option<&[u8]>) -> PhysicalResult<()> {
        let token = self.fence_token(ctx)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| translate("sql begin", e))?;
        if let Some(ref token) = token {
            let record = self.leases.read_in(&mut *tx, &token.key).await?;
            check_record(record.as_ref(), token)?;
        }
        match value {
            Some(value) => sqlx::query(&self.stmts.put)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(|e| translate("sql put", e))?,
            None => sqlx::query(&self.stmts.delete)
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(|e| translate("sql delete", e))?,
        };
        ctx.check()?;
        tx.commit().await.map_err(|e| translate("sql commit", e))
    }
}

#[async_trait]
impl Backend for SqlBackend {
    async fn put(&self, ctx: &Context, entry: Entry) -> PhysicalResult<()> {
        let start = Instant::now();
        let res = async {
            validate_key(&entry.key)?;
            validate_entry_size(&entry, 0, self.max_value_size)?;
            let _permit = self.permits.acquire(ctx).await?;
            ctx.run(self.write(ctx, &entry.key, Some(&entry.value))).await
        }
        .await;
        self.observe(Verb::Put, start, &res);
        res
    }

    async fn get(&self, ctx: &Context, key: &str) -> PhysicalResult<Option<Entry>> {
        let start = Instant::now();
        let res = async {
            validate_key(key)?;
            let _permit = self.permits.acquire(ctx).await?;
            let row = ctx
                .run(async {
                    sqlx::query_as::<_, (Vec<u8>,)>(&self.stmts.get)
                        .bind(key)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(|e| translate("sql get", e))
                })
                .await?;
            Ok(row.map(|(value,)| Entry::new(key, value)))
        }
        .await;
        self.observe(Verb::Get, start, &res);
        res
    }

    async fn delete(&self, ctx: &Context, key: &str) -> PhysicalResult<()> {
        let start = Instant::now();
        let res = async {
            validate_key(key)?;
            let _permit = self.permits.acquire(ctx).await?;
            ctx.run(self.write(ctx, key, None)).await
        }
        .await;
        self.observe(Verb::Delete, start, &res);
        res
    }

    async fn list(&self, ctx: &Context, prefix: &str) -> PhysicalResult<Vec<String>> {
        let start = Instant::now();
        let res = async {
            validate_key(prefix)?;
            let _permit = self.permits.acquire(ctx).await?;
            let rows = ctx
                .run(async {
                    sqlx::query_as::<_, (String,)>(&self.stmts.list)
                        .bind(prefix)
                        .bind(prefix.chars().count() as i64)
                        .bind(prefix)
                        .fetch_all(&self.pool)
                        .await
                        .map_err(|e| translate("sql list", e))
                })
                .await?;
            Ok(collapse_children(prefix, rows.iter().map(|(k,)| k.as_str())))
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

    fn as_ha(&self) -> Option<&dyn HABackend> {
        self.ha.as_ref().map(|_| self as &dyn HABackend)
    }

    fn as_fencing(&self) -> Option<&dyn FencingHABackend> {
        self.ha.as_ref().map(|_| self as &dyn FencingHABackend)
    }
}

#[async_trait]
impl Transactional for SqlBackend {
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
            let token = self.fence_token(ctx)?;
            let _permit = self.permits.acquire(ctx).await?;

            ctx.run(async {
                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(|e| translate("sql begin", e))?;
                if let Some(ref token) = token {
                    let record = self.leases.read_in(&mut *tx, &token.key).await?;
                    check_record(record.as_ref(), token)?;
                }

                for txn in txns.iter_mut() {
                    if txn.operation != Operation::Get {
                        continue;
                    }
                    let row = sqlx::query_as::<_, (Vec<u8>,)>(&self.stmts.get)
                        .bind(&txn.entry.key)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(|e| translate("sql get", e))?;
                    if let Some((value,)) = row {
                        txn.entry.value = value;
                    }
                }

                for txn in txns.iter() {
                    match txn.operation {
                        Operation::Put => {
                            sqlx::query(&self.stmts.put)
                                .bind(&txn.entry.key)
                                .bind(&txn.entry.value)
                                .execute(&mut *tx)
                                .await
                                .map_err(|e| translate("sql put", e))?;
                        }
                        Operation::Delete => {
                            sqlx::query(&self.stmts.delete)
                                .bind(&txn.entry.key)
                                .execute(&mut *tx)
                                .await
                                .map_err(|e| translate("sql delete", e))?;
                        }
                        Operation::Get | Operation::List => {}
                    }
                }
                ctx.check()?;
                tx.commit().await.map_err(|e| translate("sql commit", e))
            })
            .await
        }
        .await;
        self.observe(Verb::Transaction, start, &res);
        res
    }
}

impl TransactionalLimits for SqlBackend {
    fn transaction_limits(&self) -> (usize, usize) {
        self.limits
    }
}

impl HABackend for SqlBackend {
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

impl FencingHABackend for SqlBackend {
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

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_identifier("table", "stratum_kv").is_ok());
        assert!(validate_identifier("table", "kv; DROP TABLE x").is_err());
        assert!(validate_identifier("table", "1kv").is_err());
        assert!(validate_identifier("table", "").is_err());
    }

    #[test]
    fn list_statement_uses_prefix_match() {
        let stmts = Statements::new("t");
        assert_eq!(
            stmts.list,
            "SELECT k FROM t WHERE k >= ? AND substr(k, 1, ?) = ? ORDER BY k"
        );
    }
}
