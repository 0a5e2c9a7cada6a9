//! Write fencing against the registered active-node lock.
//!
//! A fencing backend keeps a non-owning reference to the lock the active node
//! registered. Each write looks the lock up, asks it for its lease identity and
//! verifies that identity against the store before committing. Writes made
//! with [`Context::with_unfenced_write`] skip the check.
//!
//! [`Context::with_unfenced_write`]: crate::core::context::Context::with_unfenced_write

use crate::core::context::Context;
use crate::core::error::{PhysicalError, PhysicalResult};
use crate::ha::lease::{now_millis, LeaseStore, LockRecord};
use crate::physical::{FencingToken, Lock};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

/// Holds the registered active-node lock, if any.
#[derive(Default)]
pub struct FenceGuard {
    lock: RwLock<Option<Weak<dyn Lock>>>,
}

impl std::fmt::Debug for FenceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FenceGuard")
            .field("registered", &self.is_registered())
            .finish()
    }
}

impl FenceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `lock`, replacing any earlier registration.
    pub fn register(&self, lock: &Arc<dyn Lock>) {
        *self.lock.write() = Some(Arc::downgrade(lock));
    }

    pub fn clear(&self) {
        *self.lock.write() = None;
    }

    /// Whether a live lock is registered.
    pub fn is_registered(&self) -> bool {
        self.lock
            .read()
            .as_ref()
            .map(|w| w.strong_count() > 0)
            .unwrap_or(false)
    }

    /// Lease identity the write made under `ctx` must carry.
    ///
    /// `Ok(None)` means the write is not fenced: unfenced context, nothing
    /// registered, or the registered lock has been dropped.
    pub fn token_for(&self, ctx: &Context) -> PhysicalResult<Option<FencingToken>> {
        if ctx.unfenced_write() {
            return Ok(None);
        }
        let Some(lock) = self.lock.read().as_ref().and_then(Weak::upgrade) else {
            return Ok(None);
        };
        match lock.fencing_token() {
            Some(token) => Ok(Some(token)),
            None => Err(PhysicalError::Fenced {
                reason: "active node lock is no longer held".to_string(),
            }),
        }
    }

    /// Resolve the token for `ctx` and verify it against `store`.
    pub async fn check(&self, ctx: &Context, store: &dyn LeaseStore) -> PhysicalResult<()> {
        match self.token_for(ctx)? {
            Some(token) => verify(store, &token).await,
            None => Ok(()),
        }
    }
}

/// Fail with `Fenced` unless the record under the token's key still names
/// the token's owner and has not expired.
pub async fn verify(store: &dyn LeaseStore, token: &FencingToken) -> PhysicalResult<()> {
    let record = store.read_lease(&token.key).await?;
    check_record(record.as_ref(), token)
}

/// Same check as [`verify`] over an already-read record.
pub fn check_record(record: Option<&LockRecord>, token: &FencingToken) -> PhysicalResult<()> {
    match record {
        Some(r) if r.owner == token.owner && !r.is_expired(now_millis()) => Ok(()),
        Some(r) if r.owner != token.owner => Err(PhysicalError::Fenced {
            reason: format!("lock {} is held by another node", token.key),
        }),
        Some(_) => Err(PhysicalError::Fenced {
            reason: format!("lease on {} has expired", token.key),
        }),
        None => Err(PhysicalError::Fenced {
            reason: format!("lock {} is not held", token.key),
        }),
    }
}
