//! Bounded permit pool gating outbound driver calls.
//!
//! Every driver holds a permit for the whole round trip of each request so a
//! slow store cannot be flooded with unbounded concurrency. Permits are RAII
//! guards: dropping one releases it.

use crate::core::context::Context;
use crate::core::error::{PhysicalError, PhysicalResult};
use crate::ops::observability::MetricSink;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Capacity used when a pool is built with zero.
pub const DEFAULT_PARALLEL_OPERATIONS: usize = 128;

#[derive(Debug)]
struct PoolMetrics {
    permits: String,
    sink: Arc<dyn MetricSink>,
}

/// Counting semaphore with a live in-use gauge.
#[derive(Debug)]
pub struct PermitPool {
    semaphore: Semaphore,
    capacity: usize,
    in_use: AtomicUsize,
    metrics: Option<PoolMetrics>,
}

impl PermitPool {
    /// Create a pool; zero capacity selects [`DEFAULT_PARALLEL_OPERATIONS`].
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_PARALLEL_OPERATIONS
        } else {
            capacity
        };
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            in_use: AtomicUsize::new(0),
            metrics: None,
        }
    }

    /// Create a pool that reports `<name>.permits-limit` once and
    /// `<name>.permits` on every change.
    pub fn with_metrics(capacity: usize, name: &str, sink: Arc<dyn MetricSink>) -> Self {
        let mut pool = Self::new(capacity);
        sink.set_gauge(&format!("{}.permits-limit", name), pool.capacity as f64);
        let metrics = PoolMetrics {
            permits: format!("{}.permits", name),
            sink,
        };
        metrics.sink.set_gauge(&metrics.permits, 0.0);
        pool.metrics = Some(metrics);
        pool
    }

    /// Wait for a permit, or fail with `Canceled` if `ctx` is canceled first.
    pub async fn acquire(&self, ctx: &Context) -> PhysicalResult<Permit<'_>> {
        ctx.check()?;
        let permit = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(PhysicalError::Canceled),
            permit = self.semaphore.acquire() => permit
                .map_err(|_| PhysicalError::backend("permit pool closed"))?,
        };
        let current = self.in_use.fetch_add(1, Ordering::AcqRel) + 1;
        self.report(current);
        Ok(Permit {
            pool: self,
            _permit: permit,
        })
    }

    /// Number of permits currently held.
    pub fn current(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn release(&self) {
        let current = self.in_use.fetch_sub(1, Ordering::AcqRel) - 1;
        self.report(current);
    }

    fn report(&self, current: usize) {
        if let Some(ref metrics) = self.metrics {
            metrics.sink.set_gauge(&metrics.permits, current as f64);
        }
    }
}

impl Default for PermitPool {
    fn default() -> Self {
        Self::new(DEFAULT_PARALLEL_OPERATIONS)
    }
}

/// A held permit. Released on drop.
#[derive(Debug)]
#[must_use = "a permit is released as soon as it is dropped"]
pub struct Permit<'a> {
    pool: &'a PermitPool,
    _permit: SemaphorePermit<'a>,
}

impl Permit<'_> {
    /// Release explicitly; equivalent to dropping.
    pub fn release(self) {}
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        // Counter drops before the semaphore slot is returned, so in_use
        // never exceeds capacity.
        self.pool.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::observability::InmemSink;
    use std::time::Duration;

    #[test]
    fn zero_capacity_uses_default() {
        assert_eq!(PermitPool::new(0).capacity(), DEFAULT_PARALLEL_OPERATIONS);
        assert_eq!(PermitPool::new(3).capacity(), 3);
    }

    #[tokio::test]
    async fn acquire_and_release_track_current() {
        let pool = PermitPool::new(2);
        let ctx = Context::background();
        let a = pool.acquire(&ctx).await.unwrap();
        let b = pool.acquire(&ctx).await.unwrap();
        assert_eq!(pool.current(), 2);
        drop(a);
        assert_eq!(pool.current(), 1);
        b.release();
        assert_eq!(pool.current(), 0);
    }

    #[tokio::test]
    async fn acquire_honors_cancellation() {
        let pool = PermitPool::new(1);
        let ctx = Context::background();
        let _held = pool.acquire(&ctx).await.unwrap();

        let waiter = Context::background().with_timeout(Duration::from_millis(20));
        let res = pool.acquire(&waiter).await;
        assert!(matches!(res, Err(PhysicalError::Canceled)));
        assert_eq!(pool.current(), 1);
    }

    #[tokio::test]
    async fn metered_pool_reports_gauges() {
        let sink = Arc::new(InmemSink::new());
        let pool = PermitPool::with_metrics(4, "test", sink.clone());
        let ctx = Context::background();
        {
            let _p = pool.acquire(&ctx).await.unwrap();
        }
        assert_eq!(sink.gauge_history("test.permits-limit"), vec![4.0]);
        assert_eq!(sink.gauge_history("test.permits"), vec![0.0, 1.0, 0.0]);
    }
}
