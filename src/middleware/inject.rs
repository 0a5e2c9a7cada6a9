//! Fault injection for tests and chaos runs: latency and random failures.

use crate::core::context::Context;
use crate::core::error::{PhysicalError, PhysicalResult};
use crate::physical::{Backend, Entry, Transactional, TransactionalLimits, TxnEntry};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

// ============================================================================
// Latency
// ============================================================================

/// Delays every call by `latency`, varied by up to `jitter_percent` either way.
pub struct LatencyInjector<B> {
    inner: B,
    latency: Duration,
    jitter_percent: u8,
    rng: Mutex<StdRng>,
}

impl<B> std::fmt::Debug for LatencyInjector<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyInjector")
            .field("latency", &self.latency)
            .field("jitter_percent", &self.jitter_percent)
            .finish()
    }
}

impl<B: Backend> LatencyInjector<B> {
    /// `jitter_percent` is clamped to 100.
    pub fn new(inner: B, latency: Duration, jitter_percent: u8) -> Self {
        let jitter_percent = jitter_percent.min(100);
        tracing::warn!(
            latency_ms = latency.as_millis() as u64,
            jitter_percent,
            "creating latency injector"
        );
        Self {
            inner,
            latency,
            jitter_percent,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic variant for tests.
    pub fn with_seed(inner: B, latency: Duration, jitter_percent: u8, seed: u64) -> Self {
        let mut injector = Self::new(inner, latency, jitter_percent);
        injector.rng = Mutex::new(StdRng::seed_from_u64(seed));
        injector
    }

    /// Next delay: `latency * (100 ± jitter) / 100`.
    pub fn next_delay(&self) -> Duration {
        if self.jitter_percent == 0 || self.latency.is_zero() {
            return self.latency;
        }
        let j = u32::from(self.jitter_percent);
        let percent = self.rng.lock().gen_range(100 - j..=100 + j);
        self.latency * percent / 100
    }

    async fn delay(&self, ctx: &Context) -> PhysicalResult<()> {
        ctx.sleep(self.next_delay()).await
    }
}

#[async_trait]
impl<B: Backend> Backend for LatencyInjector<B> {
    async fn put(&self, ctx: &Context, entry: Entry) -> PhysicalResult<()> {
        self.delay(ctx).await?;
        self.inner.put(ctx, entry).await
    }

    async fn get(&self, ctx: &Context, key: &str) -> PhysicalResult<Option<Entry>> {
        self.delay(ctx).await?;
        self.inner.get(ctx, key).await
    }

    async fn delete(&self, ctx: &Context, key: &str) -> PhysicalResult<()> {
        self.delay(ctx).await?;
        self.inner.delete(ctx, key).await
    }

    async fn list(&self, ctx: &Context, prefix: &str) -> PhysicalResult<Vec<String>> {
        self.delay(ctx).await?;
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
impl<B: Backend> Transactional for LatencyInjector<B> {
    async fn transaction(&self, ctx: &Context, txns: &mut [TxnEntry]) -> PhysicalResult<()> {
        let inner = self
            .inner
            .as_transactional()
            .ok_or_else(|| PhysicalError::unsupported("transaction"))?;
        self.delay(ctx).await?;
        inner.transaction(ctx, txns).await
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Fails a configurable percentage of calls with `OperationDisabled`.
pub struct ErrorInjector<B> {
    inner: B,
    error_percent: AtomicU8,
    rng: Mutex<StdRng>,
}

impl<B> std::fmt::Debug for ErrorInjector<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorInjector")
            .field("error_percent", &self.error_percent.load(Ordering::Relaxed))
            .finish()
    }
}

impl<B: Backend> ErrorInjector<B> {
    /// `error_percent` is clamped to 100.
    pub fn new(inner: B, error_percent: u8) -> Self {
        let error_percent = error_percent.min(100);
        tracing::warn!(error_percent, "creating error injector");
        Self {
            inner,
            error_percent: AtomicU8::new(error_percent),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn set_error_percent(&self, percent: u8) {
        self.error_percent.store(percent.min(100), Ordering::Release);
    }

    pub fn error_percent(&self) -> u8 {
        self.error_percent.load(Ordering::Acquire)
    }

    fn maybe_fail(&self, operation: &str) -> PhysicalResult<()> {
        let percent = self.error_percent();
        if percent == 0 {
            return Ok(());
        }
        if self.rng.lock().gen_range(0..100u8) < percent {
            tracing::debug!(operation, "injecting error");
            return Err(PhysicalError::disabled(format!("{} (injected)", operation)));
        }
        Ok(())
    }
}

#[async_trait]
impl<B: Backend> Backend for ErrorInjector<B> {
    async fn put(&self, ctx: &Context, entry: Entry) -> PhysicalResult<()> {
        self.maybe_fail("put")?;
        self.inner.put(ctx, entry).await
    }

    async fn get(&self, ctx: &Context, key: &str) -> PhysicalResult<Option<Entry>> {
        self.maybe_fail("get")?;
        self.inner.get(ctx, key).await
    }

    async fn delete(&self, ctx: &Context, key: &str) -> PhysicalResult<()> {
        self.maybe_fail("delete")?;
        self.inner.delete(ctx, key).await
    }

    async fn list(&self, ctx: &Context, prefix: &str) -> PhysicalResult<Vec<String>> {
        self.maybe_fail("list")?;
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
impl<B: Backend> Transactional for ErrorInjector<B> {
    async fn transaction(&self, ctx: &Context, txns: &mut [TxnEntry]) -> PhysicalResult<()> {
        let inner = self
            .inner
            .as_transactional()
            .ok_or_else(|| PhysicalError::unsupported("transaction"))?;
        self.maybe_fail("transaction")?;
        inner.transaction(ctx, txns).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InmemBackend;
    use std::time::Instant;

    #[test]
    fn delay_stays_in_band() {
        let inj = LatencyInjector::with_seed(
            InmemBackend::default(),
            Duration::from_millis(100),
            20,
            7,
        );
        for _ in 0..200 {
            let d = inj.next_delay();
            assert!(d >= Duration::from_millis(80) && d <= Duration::from_millis(120));
        }
        let fixed = LatencyInjector::new(InmemBackend::default(), Duration::from_millis(5), 0);
        assert_eq!(fixed.next_delay(), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn latency_is_applied() {
        let inj = LatencyInjector::new(InmemBackend::default(), Duration::from_millis(30), 0);
        let ctx = Context::background();
        let start = Instant::now();
        inj.put(&ctx, Entry::new("k", "v")).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn error_percent_extremes() {
        let inj = ErrorInjector::new(InmemBackend::default(), 100);
        let ctx = Context::background();
        assert!(matches!(
            inj.get(&ctx, "k").await,
            Err(PhysicalError::OperationDisabled { .. })
        ));

        inj.set_error_percent(0);
        for _ in 0..50 {
            inj.put(&ctx, Entry::new("k", "v")).await.unwrap();
        }
        inj.set_error_percent(250);
        assert_eq!(inj.error_percent(), 100);
    }

    #[test]
    fn transactional_only_when_inner_is() {
        let plain = ErrorInjector::new(InmemBackend::default(), 0);
        assert!(plain.as_transactional().is_none());

        let txn = ErrorInjector::new(
            InmemBackend::new_transactional(
                &crate::core::config::DriverConfig::new(),
                crate::ops::observability::noop_sink(),
            )
            .unwrap(),
            0,
        );
        assert!(txn.as_transactional().is_some());
    }
}
