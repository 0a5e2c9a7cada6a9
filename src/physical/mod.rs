//! The physical storage contract.
//!
//! A [`Backend`] is a four-verb key/value store: put, get, delete and list.
//! Keys are `/`-delimited paths and [`Backend::list`] returns the immediate
//! children of a prefix. Drivers opt into extra capabilities
//! ([`Transactional`], [`HABackend`], [`TransactionalLimits`], ...) and
//! advertise them through the `as_*` discovery methods, so wrappers can
//! forward exactly the capabilities their inner backend has.

pub mod permit;
pub mod transaction;

use crate::core::context::Context;
use crate::core::error::{PhysicalError, PhysicalResult};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use permit::{Permit, PermitPool, DEFAULT_PARALLEL_OPERATIONS};
pub use transaction::generic_transaction_handler;

/// Historical default for entries per transaction.
pub const DEFAULT_TXN_MAX_ENTRIES: usize = 63;

/// Historical default byte budget per transaction.
pub const DEFAULT_TXN_MAX_SIZE: usize = 128 * 1024;

// ============================================================================
// Data model
// ============================================================================

/// A single key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
    /// Ask the encryption layer above for an extra wrap.
    pub seal_wrap: bool,
    /// Reserved for replication; never read by this crate.
    pub value_hash: Option<Vec<u8>>,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            seal_wrap: false,
            value_hash: None,
        }
    }

    /// Entry carrying only a key, used for Get and Delete transaction members.
    pub fn key_only(key: impl Into<String>) -> Self {
        Self::new(key, Vec::new())
    }

    /// Approximate size counted against transaction byte budgets.
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// Storage operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Put,
    Get,
    Delete,
    List,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Put => write!(f, "put"),
            Self::Get => write!(f, "get"),
            Self::Delete => write!(f, "delete"),
            Self::List => write!(f, "list"),
        }
    }
}

/// One member of a transaction.
///
/// A `Get` member is filled in place with the pre-transaction value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnEntry {
    pub operation: Operation,
    pub entry: Entry,
}

impl TxnEntry {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            operation: Operation::Put,
            entry: Entry::new(key, value),
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self {
            operation: Operation::Get,
            entry: Entry::key_only(key),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            operation: Operation::Delete,
            entry: Entry::key_only(key),
        }
    }

    /// Bytes this member counts against a transaction's byte budget.
    pub fn budget_size(&self) -> usize {
        self.entry.size()
    }
}

/// Reject transaction members that are not Put, Get or Delete.
pub fn validate_txn_entries(txns: &[TxnEntry]) -> PhysicalResult<()> {
    for txn in txns {
        validate_key(&txn.entry.key)?;
        if txn.operation == Operation::List {
            return Err(PhysicalError::backend(format!(
                "{} operation is not allowed in a transaction (key {})",
                txn.operation, txn.entry.key
            )));
        }
    }
    Ok(())
}

// ============================================================================
// Capability traits
// ============================================================================

/// The uniform key/value contract every driver and middleware implements.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Insert or replace an entry.
    async fn put(&self, ctx: &Context, entry: Entry) -> PhysicalResult<()>;

    /// Fetch an entry; `None` when the key does not exist.
    async fn get(&self, ctx: &Context, key: &str) -> PhysicalResult<Option<Entry>>;

    /// Remove an entry; removing a missing key succeeds.
    async fn delete(&self, ctx: &Context, key: &str) -> PhysicalResult<()>;

    /// Immediate children of `prefix`: leaves as bare names, deeper keys
    /// collapsed to their first segment followed by `/`.
    async fn list(&self, ctx: &Context, prefix: &str) -> PhysicalResult<Vec<String>>;

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        None
    }

    fn as_transaction_limits(&self) -> Option<&dyn TransactionalLimits> {
        None
    }

    fn as_ha(&self) -> Option<&dyn HABackend> {
        None
    }

    fn as_fencing(&self) -> Option<&dyn FencingHABackend> {
        None
    }

    fn as_redirect_detect(&self) -> Option<&dyn RedirectDetect> {
        None
    }

    fn as_purgeable(&self) -> Option<&dyn ToggleablePurgemonster> {
        None
    }

    fn as_mount_table_limiting(&self) -> Option<&dyn MountTableLimitingBackend> {
        None
    }
}

/// A backend that applies a list of operations atomically from the caller's view.
#[async_trait]
pub trait Transactional: Backend {
    async fn transaction(&self, ctx: &Context, txns: &mut [TxnEntry]) -> PhysicalResult<()>;
}

/// Per-transaction size limits. Zeros mean "use the historical defaults".
pub trait TransactionalLimits: Send + Sync {
    /// `(max entries, max bytes)` accepted by one transaction.
    fn transaction_limits(&self) -> (usize, usize);
}

/// Resolve zero limits to [`DEFAULT_TXN_MAX_ENTRIES`] and [`DEFAULT_TXN_MAX_SIZE`].
pub fn effective_transaction_limits(limits: (usize, usize)) -> (usize, usize) {
    let (entries, size) = limits;
    (
        if entries == 0 {
            DEFAULT_TXN_MAX_ENTRIES
        } else {
            entries
        },
        if size == 0 { DEFAULT_TXN_MAX_SIZE } else { size },
    )
}

/// Reject a transaction that exceeds `limits` (zeros resolved as in
/// [`effective_transaction_limits`]). Sizes are measured with
/// [`TxnEntry::budget_size`].
pub fn check_transaction_limits(txns: &[TxnEntry], limits: (usize, usize)) -> PhysicalResult<()> {
    let (max_entries, max_size) = effective_transaction_limits(limits);
    if txns.len() > max_entries {
        return Err(PhysicalError::backend(format!(
            "transaction has {} entries, max: {}",
            txns.len(),
            max_entries
        )));
    }
    let size: usize = txns.iter().map(TxnEntry::budget_size).sum();
    if size > max_size {
        return Err(PhysicalError::backend(format!(
            "transaction is {} bytes, max: {}",
            size, max_size
        )));
    }
    Ok(())
}

/// Hooks for stores without native multi-write; they take no locks and
/// acquire no permits, the caller of
/// [`generic_transaction_handler`] is responsible for both.
#[async_trait]
pub trait PseudoTransactional: Send + Sync {
    async fn get_internal(&self, ctx: &Context, key: &str) -> PhysicalResult<Option<Entry>>;
    async fn put_internal(&self, ctx: &Context, entry: Entry) -> PhysicalResult<()>;
    async fn delete_internal(&self, ctx: &Context, key: &str) -> PhysicalResult<()>;
}

/// A backend that can hand out HA locks.
pub trait HABackend: Send + Sync {
    /// Build a lock handle for `key` that will publish `value` once held.
    fn lock_with(&self, key: &str, value: &str) -> PhysicalResult<Arc<dyn Lock>>;

    /// Whether HA is enabled for this backend instance.
    fn ha_enabled(&self) -> bool;
}

/// Signal that a held lock has been lost.
///
/// Closed (resolved) at most once; after that the holder must act as a
/// non-leader.
#[derive(Debug, Clone)]
pub struct LeaderLost {
    token: CancellationToken,
}

impl LeaderLost {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Resolves when the lock is lost.
    pub async fn wait(&self) {
        self.token.cancelled().await
    }

    pub fn is_lost(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Lease identity attached to fenced writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencingToken {
    /// Lock key in the backing store.
    pub key: String,
    /// Owner id recorded in the lock.
    pub owner: String,
}

/// An HA lock handle.
#[async_trait]
pub trait Lock: Send + Sync {
    /// Block until the lock is held, `stop` is canceled, or an error occurs.
    ///
    /// Returns `Ok(None)` when stopped before acquiring.
    async fn lock(&self, stop: CancellationToken) -> PhysicalResult<Option<LeaderLost>>;

    /// Release the lock. Idempotent; safe after the lock was lost.
    async fn unlock(&self) -> PhysicalResult<()>;

    /// Whether anyone holds the lock, and the value they published.
    async fn value(&self) -> PhysicalResult<(bool, String)>;

    /// Lease identity while this handle holds the lock.
    fn fencing_token(&self) -> Option<FencingToken> {
        None
    }
}

/// A backend whose writes can be fenced by the active node's lock.
pub trait FencingHABackend: HABackend {
    /// Register the lock every subsequent write must still hold.
    ///
    /// The backend keeps only a weak reference; dropping the lock unregisters it.
    fn register_active_node_lock(&self, lock: &Arc<dyn Lock>) -> PhysicalResult<()>;
}

/// A backend that can tell what address this node is reachable at.
pub trait RedirectDetect: Send + Sync {
    fn detect_host_addr(&self) -> PhysicalResult<String>;
}

/// Cache-like middleware that can be emptied and switched off.
pub trait ToggleablePurgemonster: Send + Sync {
    fn purge(&self);
    fn set_enabled(&self, enabled: bool);
}

/// A backend that allows larger values under registered mount-table paths.
pub trait MountTableLimitingBackend: Send + Sync {
    fn register_mount_table_path(&self, path: &str);
}

// ============================================================================
// Forwarding impls
// ============================================================================

macro_rules! forward_backend {
    ($wrapper:ty) => {
        #[async_trait]
        impl<T: Backend + ?Sized> Backend for $wrapper {
            async fn put(&self, ctx: &Context, entry: Entry) -> PhysicalResult<()> {
                (**self).put(ctx, entry).await
            }

            async fn get(&self, ctx: &Context, key: &str) -> PhysicalResult<Option<Entry>> {
                (**self).get(ctx, key).await
            }

            async fn delete(&self, ctx: &Context, key: &str) -> PhysicalResult<()> {
                (**self).delete(ctx, key).await
            }

            async fn list(&self, ctx: &Context, prefix: &str) -> PhysicalResult<Vec<String>> {
                (**self).list(ctx, prefix).await
            }

            fn as_transactional(&self) -> Option<&dyn Transactional> {
                (**self).as_transactional()
            }

            fn as_transaction_limits(&self) -> Option<&dyn TransactionalLimits> {
                (**self).as_transaction_limits()
            }

            fn as_ha(&self) -> Option<&dyn HABackend> {
                (**self).as_ha()
            }

            fn as_fencing(&self) -> Option<&dyn FencingHABackend> {
                (**self).as_fencing()
            }

            fn as_redirect_detect(&self) -> Option<&dyn RedirectDetect> {
                (**self).as_redirect_detect()
            }

            fn as_purgeable(&self) -> Option<&dyn ToggleablePurgemonster> {
                (**self).as_purgeable()
            }

            fn as_mount_table_limiting(&self) -> Option<&dyn MountTableLimitingBackend> {
                (**self).as_mount_table_limiting()
            }
        }
    };
}

forward_backend!(Arc<T>);
forward_backend!(Box<T>);

// ============================================================================
// Key helpers
// ============================================================================

/// Reject keys containing a parent reference.
pub fn validate_key(key: &str) -> PhysicalResult<()> {
    if key.contains("..") {
        return Err(PhysicalError::PathContainsParentReferences);
    }
    Ok(())
}

/// Enforce optional key and value size caps; zero disables a cap.
pub fn validate_entry_size(entry: &Entry, max_key: usize, max_value: usize) -> PhysicalResult<()> {
    if max_key > 0 && entry.key.len() > max_key {
        return Err(PhysicalError::KeyTooLarge {
            size: entry.key.len(),
            max: max_key,
        });
    }
    if max_value > 0 && entry.value.len() > max_value {
        return Err(PhysicalError::ValueTooLarge {
            size: entry.value.len(),
            max: max_value,
        });
    }
    Ok(())
}

/// Every ancestor prefix of `key`, shallowest first: `a/b/c` yields `a/`, `a/b/`.
pub fn prefixes(key: &str) -> Vec<&str> {
    key.match_indices('/').map(|(i, _)| &key[..=i]).collect()
}

/// Immediate child name of `key` under `prefix`, if `key` lies under it.
pub fn immediate_child<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    if rest.is_empty() {
        return None;
    }
    match rest.find('/') {
        Some(i) => Some(&rest[..=i]),
        None => Some(rest),
    }
}

/// Collapse full keys into the immediate-children view of `prefix`:
/// deduplicated and sorted.
pub fn collapse_children<'a, I>(prefix: &str, keys: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    keys.into_iter()
        .filter_map(|k| immediate_child(prefix, k))
        .map(String::from)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
