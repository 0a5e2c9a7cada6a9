//! Prefix view: a backend scoped under a fixed key prefix.

use crate::core::context::Context;
use crate::core::error::{PhysicalError, PhysicalResult};
use crate::physical::{
    Backend, Entry, ToggleablePurgemonster, Transactional, TransactionalLimits, TxnEntry,
};
use async_trait::async_trait;

/// Presents `inner` as if its keys started at `prefix`.
///
/// Keys are prefixed on the way in and stripped on the way out. A key with a
/// `..` segment is rejected with [`PhysicalError::RelativePath`] before it
/// reaches the inner backend.
#[derive(Debug)]
pub struct View<B> {
    inner: B,
    prefix: String,
}

impl<B: Backend> View<B> {
    pub fn new(inner: B, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn expand_key(&self, key: &str) -> PhysicalResult<String> {
        if key.contains("..") {
            return Err(PhysicalError::RelativePath {
                path: key.to_string(),
            });
        }
        Ok(format!("{}{}", self.prefix, key))
    }

    fn truncate_key(&self, full: &str) -> String {
        full.strip_prefix(self.prefix.as_str())
            .unwrap_or(full)
            .to_string()
    }
}

#[async_trait]
impl<B: Backend> Backend for View<B> {
    async fn put(&self, ctx: &Context, mut entry: Entry) -> PhysicalResult<()> {
        entry.key = self.expand_key(&entry.key)?;
        self.inner.put(ctx, entry).await
    }

    async fn get(&self, ctx: &Context, key: &str) -> PhysicalResult<Option<Entry>> {
        let full = self.expand_key(key)?;
        let entry = self.inner.get(ctx, &full).await?;
        Ok(entry.map(|mut e| {
            e.key = self.truncate_key(&e.key);
            e
        }))
    }

    async fn delete(&self, ctx: &Context, key: &str) -> PhysicalResult<()> {
        let full = self.expand_key(key)?;
        self.inner.delete(ctx, &full).await
    }

    async fn list(&self, ctx: &Context, prefix: &str) -> PhysicalResult<Vec<String>> {
        let full = self.expand_key(prefix)?;
        self.inner.list(ctx, &full).await
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
        self.inner.as_purgeable()
    }
}

#[async_trait]
impl<B: Backend> Transactional for View<B> {
    async fn transaction(&self, ctx: &Context, txns: &mut [TxnEntry]) -> PhysicalResult<()> {
        let inner = self
            .inner
            .as_transactional()
            .ok_or_else(|| PhysicalError::unsupported("transaction"))?;

        let mut expanded = Vec::with_capacity(txns.len());
        for txn in txns.iter() {
            let mut copy = txn.clone();
            copy.entry.key = self.expand_key(&txn.entry.key)?;
            expanded.push(copy);
        }

        inner.transaction(ctx, &mut expanded).await?;

        for (txn, done) in txns.iter_mut().zip(expanded) {
            txn.entry.value = done.entry.value;
        }
        Ok(())
    }
}
