//! Coalesces single-entry writes into transactions.
//!
//! Writes made with a batch-ok [`Context`] are queued to a worker task which
//! flushes them as one transaction on the inner backend when the batch is full
//! or the tick fires. Every submitter of a batch receives that batch's result.
//! Writes without the flag, and every write to a non-transactional inner
//! backend, go straight through.
//!
//! A caller whose context is canceled while waiting gets `Canceled` at once.
//! Its write is dropped if the flush carrying it has not started yet; once
//! the flush is underway the write may still land.

use crate::core::context::Context;
use crate::core::error::{PhysicalError, PhysicalResult};
use crate::physical::{
    effective_transaction_limits, validate_key, Backend, Entry, Transactional,
    TransactionalLimits, TxnEntry,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Entries per flush before the inner limits are applied.
pub const DEFAULT_MAX_BATCH_ENTRIES: usize = 64;

const SUBMIT_QUEUE: usize = 1024;

type BatchResult = Result<(), Arc<PhysicalError>>;

struct Submission {
    txn: TxnEntry,
    ctx: Context,
    done: oneshot::Sender<BatchResult>,
}

/// Write coalescer over a transactional backend.
pub struct Batcher<B> {
    inner: Arc<B>,
    submit: mpsc::Sender<Submission>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    max_entries: usize,
}

impl<B> std::fmt::Debug for Batcher<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batcher")
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

impl<B: Backend + 'static> Batcher<B> {
    /// Batcher with the default size and tick. Must be called within a
    /// tokio runtime.
    pub fn new(inner: B) -> Self {
        Self::with_options(inner, DEFAULT_MAX_BATCH_ENTRIES, DEFAULT_BATCH_INTERVAL)
    }

    pub fn with_options(inner: B, max_entries: usize, interval: Duration) -> Self {
        let inner = Arc::new(inner);
        let (limit_entries, limit_size) = effective_transaction_limits(
            inner
                .as_transaction_limits()
                .map(|l| l.transaction_limits())
                .unwrap_or((0, 0)),
        );
        let max_entries = max_entries.max(1).min(limit_entries);

        let (submit, rx) = mpsc::channel(SUBMIT_QUEUE);
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            inner.clone(),
            rx,
            shutdown.clone(),
            max_entries,
            limit_size,
            interval,
        ));

        Self {
            inner,
            submit,
            shutdown,
            worker: Mutex::new(Some(worker)),
            max_entries,
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Flush whatever is queued and stop the worker. Later batch-ok writes
    /// go straight to the inner backend.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                tracing::warn!(error = %err, "batch worker ended abnormally");
            }
        }
    }

    fn batchable(&self, ctx: &Context) -> bool {
        ctx.batch_ok() && self.inner.as_transactional().is_some() && !self.shutdown.is_cancelled()
    }

    /// Queue `txn` and wait for the flush that carries it. Returns the entry
    /// back if the worker is gone.
    async fn submit(&self, ctx: &Context, txn: TxnEntry) -> Result<PhysicalResult<()>, TxnEntry> {
        let (done, outcome) = oneshot::channel();
        let sub = Submission {
            txn,
            ctx: ctx.clone(),
            done,
        };
        tokio::select! {
            sent = self.submit.send(sub) => {
                if let Err(mpsc::error::SendError(sub)) = sent {
                    return Err(sub.txn);
                }
            }
            _ = ctx.cancelled() => return Ok(Err(PhysicalError::Canceled)),
        }
        Ok(tokio::select! {
            biased;
            res = outcome => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(source)) => Err(PhysicalError::Batch { source }),
                Err(_) => Err(PhysicalError::backend("batch worker stopped before flushing")),
            },
            _ = ctx.cancelled() => Err(PhysicalError::Canceled),
        })
    }
}

impl<B> Drop for Batcher<B> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_worker<B: Backend + 'static>(
    inner: Arc<B>,
    mut rx: mpsc::Receiver<Submission>,
    shutdown: CancellationToken,
    max_entries: usize,
    max_size: usize,
    interval: Duration,
) {
    let mut pending: Vec<Submission> = Vec::with_capacity(max_entries);
    let mut pending_size = 0usize;
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            sub = rx.recv() => {
                let Some(sub) = sub else { break };
                let size = sub.txn.budget_size();
                if !pending.is_empty() && pending_size + size > max_size {
                    flush(inner.as_ref(), &mut pending).await;
                    pending_size = 0;
                }
                pending_size += size;
                pending.push(sub);
                if pending.len() >= max_entries {
                    flush(inner.as_ref(), &mut pending).await;
                    pending_size = 0;
                }
            }
            _ = tick.tick() => {
                if !pending.is_empty() {
                    flush(inner.as_ref(), &mut pending).await;
                    pending_size = 0;
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }

    rx.close();
    while let Ok(sub) = rx.try_recv() {
        pending.push(sub);
    }
    while !pending.is_empty() {
        let rest = pending.split_off(pending.len().min(max_entries));
        flush(inner.as_ref(), &mut pending).await;
        pending = rest;
    }
    tracing::debug!("batch worker stopped");
}

async fn flush<B: Backend>(inner: &B, pending: &mut Vec<Submission>) {
    let (batch, canceled): (Vec<Submission>, Vec<Submission>) =
        std::mem::take(pending).into_iter().partition(|s| !s.ctx.is_cancelled());
    for sub in canceled {
        let _ = sub.done.send(Err(Arc::new(PhysicalError::Canceled)));
    }
    if batch.is_empty() {
        return;
    }
    let mut txns: Vec<TxnEntry> = batch.iter().map(|s| s.txn.clone()).collect();

    let ctx = Context::background();
    let res = match inner.as_transactional() {
        Some(t) => t.transaction(&ctx, &mut txns).await,
        None => Err(PhysicalError::unsupported("transaction")),
    };
    let outcome: BatchResult = match res {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::warn!(entries = batch.len(), error = %err, "batched transaction failed");
            Err(Arc::new(err))
        }
    };

    for sub in batch {
        // The submitter may have gone away; nothing to report to.
        let _ = sub.done.send(outcome.clone());
    }
}

#[async_trait]
impl<B: Backend + 'static> Backend for Batcher<B> {
    async fn put(&self, ctx: &Context, entry: Entry) -> PhysicalResult<()> {
        if !self.batchable(ctx) {
            return self.inner.put(ctx, entry).await;
        }
        validate_key(&entry.key)?;
        ctx.check()?;
        let txn = TxnEntry {
            operation: crate::physical::Operation::Put,
            entry,
        };
        match self.submit(ctx, txn).await
        {
            Ok(res) => res,
            Err(txn) => self.inner.put(ctx, txn.entry).await,
        }
    }

    async fn get(&self, ctx: &Context, key: &str) -> PhysicalResult<Option<Entry>> {
        self.inner.get(ctx, key).await
    }

    async fn delete(&self, ctx: &Context, key: &str) -> PhysicalResult<()> {
        if !self.batchable(ctx) {
            return self.inner.delete(ctx, key).await;
        }
        validate_key(key)?;
        ctx.check()?;
        match self.submit(ctx, TxnEntry::delete(key)).await {
            Ok(res) => res,
            Err(txn) => self.inner.delete(ctx, &txn.entry.key).await,
        }
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
}

#[async_trait]
impl<B: Backend + 'static> Transactional for Batcher<B> {
    async fn transaction(&self, ctx: &Context, txns: &mut [TxnEntry]) -> PhysicalResult<()> {
        match self.inner.as_transactional() {
            Some(inner) => inner.transaction(ctx, txns).await,
            None => Err(PhysicalError::unsupported("transaction")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InmemBackend;
    use crate::core::config::DriverConfig;
    use crate::ops::observability::InmemSink;

    fn transactional(sink: Arc<InmemSink>) -> Arc<InmemBackend> {
        Arc::new(InmemBackend::new_transactional(&DriverConfig::new(), sink).unwrap())
    }

    #[tokio::test]
    async fn concurrent_writes_share_a_transaction() {
        let sink = Arc::new(InmemSink::new());
        let inner = transactional(sink.clone());
        let batcher = Arc::new(Batcher::with_options(
            inner.clone(),
            8,
            Duration::from_millis(50),
        ));

        let mut handles = Vec::new();
        for i in 0..8 {
            let b = batcher.clone();
            handles.push(tokio::spawn(async move {
                let ctx = Context::background().with_batch_ok();
                b.put(&ctx, Entry::new(format!("k{}", i), "v")).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let ctx = Context::background();
        assert_eq!(inner.list(&ctx, "").await.unwrap().len(), 8);
        assert_eq!(sink.samples("inmem.put").map(|s| s.count).unwrap_or(0), 0);
        assert!(sink.samples("inmem.transaction").unwrap().count >= 1);
    }

    #[tokio::test]
    async fn unflagged_writes_bypass() {
        let sink = Arc::new(InmemSink::new());
        let inner = transactional(sink.clone());
        let batcher = Batcher::new(inner.clone());
        batcher
            .put(&Context::background(), Entry::new("k", "v"))
            .await
            .unwrap();
        assert_eq!(sink.samples("inmem.put").unwrap().count, 1);
    }

    #[tokio::test]
    async fn failure_reaches_every_submitter() {
        let sink = Arc::new(InmemSink::new());
        let inner = transactional(sink);
        inner.fail_put(true);
        let batcher = Arc::new(Batcher::with_options(
            inner.clone(),
            2,
            Duration::from_millis(20),
        ));

        let ctx = Context::background().with_batch_ok();
        let (a, b) = tokio::join!(
            batcher.put(&ctx, Entry::new("a", "1")),
            batcher.put(&ctx, Entry::new("b", "2"))
        );
        assert!(matches!(a, Err(PhysicalError::Batch { .. })));
        assert!(matches!(b, Err(PhysicalError::Batch { .. })));
    }

    #[tokio::test]
    async fn batch_size_is_capped_by_limits() {
        let conf = DriverConfig::new().with("transaction_max_entries", 3);
        let inner =
            InmemBackend::new_transactional(&conf, crate::ops::observability::noop_sink())
                .unwrap();
        let batcher = Batcher::with_options(inner, 100, DEFAULT_BATCH_INTERVAL);
        assert_eq!(batcher.max_entries(), 3);
    }

    #[tokio::test]
    async fn canceled_waiter_returns_and_write_is_dropped() {
        let sink = Arc::new(InmemSink::new());
        let inner = transactional(sink);
        let batcher = Batcher::with_options(inner.clone(), 64, Duration::from_millis(200));

        let ctx = Context::background()
            .with_timeout(Duration::from_millis(20))
            .with_batch_ok();
        let start = tokio::time::Instant::now();
        let res = batcher.put(&ctx, Entry::new("k", "v")).await;
        assert!(matches!(res, Err(PhysicalError::Canceled)));
        assert!(start.elapsed() < Duration::from_millis(200));

        batcher.close().await;
        assert!(inner.is_empty());
    }

    #[tokio::test]
    async fn close_flushes_and_falls_back() {
        let sink = Arc::new(InmemSink::new());
        let inner = transactional(sink);
        let batcher = Batcher::with_options(inner.clone(), 64, Duration::from_secs(60));
        batcher.close().await;

        let ctx = Context::background().with_batch_ok();
        batcher.put(&ctx, Entry::new("late", "v")).await.unwrap();
        assert!(inner.get(&ctx, "late").await.unwrap().is_some());
    }
}
