//! Per-call context: cancellation plus request flags.
//!
//! Every backend verb takes a [`Context`]. Cancellation is cooperative: drivers
//! call [`Context::check`] before committing and race their suspension points
//! against [`Context::cancelled`].

use crate::core::error::{PhysicalError, PhysicalResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

bitflags::bitflags! {
    /// Per-call flags carried alongside cancellation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ContextFlags: u8 {
        /// Bypass cached reads and refill the cache from the inner backend.
        const CACHE_REFRESH = 0b0000_0001;
        /// Caller accepts having a single write coalesced into a batch.
        const BATCH_OK = 0b0000_0010;
        /// Skip fencing checks for this write.
        const UNFENCED_WRITE = 0b0000_0100;
    }
}

impl Default for ContextFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Cancellation scope and flags for one storage call.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    flags: ContextFlags,
}

impl Context {
    /// A context that is never canceled and carries no flags.
    pub fn background() -> Self {
        Self::default()
    }

    /// Build a context observing an existing cancellation token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            flags: ContextFlags::empty(),
        }
    }

    /// Derive a context canceled with this one or by its own token.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            flags: self.flags,
        }
    }

    /// Derive a child context that cancels itself after `timeout`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let child = self.child();
        let token = child.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => token.cancel(),
                _ = token.cancelled() => {}
            }
        });
        child
    }

    /// Same flags, fresh cancellation. Used where work must finish even
    /// though the caller gave up, such as transaction rollback.
    pub fn detached(&self) -> Self {
        Self {
            token: CancellationToken::new(),
            flags: self.flags,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the context is canceled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Return `Canceled` if the context has been canceled.
    pub fn check(&self) -> PhysicalResult<()> {
        if self.token.is_cancelled() {
            Err(PhysicalError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Drive `fut` to completion unless the context is canceled first.
    pub async fn run<T, F>(&self, fut: F) -> PhysicalResult<T>
    where
        F: Future<Output = PhysicalResult<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(PhysicalError::Canceled),
            res = fut => res,
        }
    }

    /// Sleep for `duration`, returning `Canceled` if interrupted.
    pub async fn sleep(&self, duration: Duration) -> PhysicalResult<()> {
        if duration.is_zero() {
            return self.check();
        }
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }

    pub fn flags(&self) -> ContextFlags {
        self.flags
    }

    pub fn with_flags(mut self, flags: ContextFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_cache_refresh(self) -> Self {
        self.with_flags(ContextFlags::CACHE_REFRESH)
    }

    pub fn with_batch_ok(self) -> Self {
        self.with_flags(ContextFlags::BATCH_OK)
    }

    /// Mark writes made with this context as exempt from fencing.
    pub fn with_unfenced_write(self) -> Self {
        self.with_flags(ContextFlags::UNFENCED_WRITE)
    }

    pub fn cache_refresh(&self) -> bool {
        self.flags.contains(ContextFlags::CACHE_REFRESH)
    }

    pub fn batch_ok(&self) -> bool {
        self.flags.contains(ContextFlags::BATCH_OK)
    }

    pub fn unfenced_write(&self) -> bool {
        self.flags.contains(ContextFlags::UNFENCED_WRITE)
    }
}
