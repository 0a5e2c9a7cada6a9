//! Rollback-based transactions for stores without native multi-write.
//!
//! The handler applies members in order and records, for each mutation, the
//! compensating operation that undoes it. On failure the compensations run in
//! reverse order. Rollback is best-effort: failures are collected, not fatal.

use crate::core::context::Context;
use crate::core::error::{PhysicalError, PhysicalResult, TransactionError};
use crate::physical::{validate_txn_entries, Entry, Operation, PseudoTransactional, TxnEntry};

/// Inverse of one applied mutation.
#[derive(Debug)]
enum Compensation {
    Restore(Entry),
    Remove(String),
}

/// Apply `txns` through the `*_internal` hooks of `backend`.
///
/// The caller must already hold whatever lock and permit serialize
/// transactions on `backend`. `Get` members are filled in place with the
/// values present before any mutation.
pub async fn generic_transaction_handler<B>(
    ctx: &Context,
    backend: &B,
    txns: &mut [TxnEntry],
) -> PhysicalResult<()>
where
    B: PseudoTransactional + ?Sized,
{
    validate_txn_entries(txns)?;
    ctx.check()?;

    for txn in txns.iter_mut() {
        if txn.operation == Operation::Get {
            if let Some(existing) = backend.get_internal(ctx, &txn.entry.key).await? {
                txn.entry.value = existing.value;
            }
        }
    }

    let mut rollback: Vec<Compensation> = Vec::with_capacity(txns.len());
    let mut failure: Option<PhysicalError> = None;

    for txn in txns.iter() {
        let step = match txn.operation {
            Operation::Delete => apply_delete(ctx, backend, &txn.entry.key).await,
            Operation::Put => apply_put(ctx, backend, &txn.entry).await,
            Operation::Get | Operation::List => continue,
        };
        match step {
            Ok(Some(compensation)) => rollback.push(compensation),
            Ok(None) => {}
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }

    let Some(cause) = failure else {
        return Ok(());
    };

    tracing::debug!(
        error = %cause,
        compensations = rollback.len(),
        "transaction failed, rolling back"
    );

    let mut err = TransactionError::new(cause);
    let rollback_ctx = ctx.detached();
    while let Some(compensation) = rollback.pop() {
        let res = match compensation {
            Compensation::Restore(entry) => backend.put_internal(&rollback_ctx, entry).await,
            Compensation::Remove(key) => backend.delete_internal(&rollback_ctx, &key).await,
        };
        if let Err(rollback_err) = res {
            tracing::warn!(error = %rollback_err, "transaction rollback step failed");
            err.rollback_errors.push(rollback_err);
        }
    }
    Err(err.into())
}

async fn apply_delete<B>(
    ctx: &Context,
    backend: &B,
    key: &str,
) -> PhysicalResult<Option<Compensation>>
where
    B: PseudoTransactional + ?Sized,
{
    ctx.check()?;
    let Some(existing) = backend.get_internal(ctx, key).await? else {
        return Ok(None);
    };
    backend.delete_internal(ctx, key).await?;
    Ok(Some(Compensation::Restore(Entry::new(
        existing.key,
        existing.value,
    ))))
}

async fn apply_put<B>(
    ctx: &Context,
    backend: &B,
    entry: &Entry,
) -> PhysicalResult<Option<Compensation>>
where
    B: PseudoTransactional + ?Sized,
{
    ctx.check()?;
    let compensation = match backend.get_internal(ctx, &entry.key).await? {
        Some(existing) => Compensation::Restore(Entry::new(existing.key, existing.value)),
        None => Compensation::Remove(entry.key.clone()),
    };
    backend.put_internal(ctx, entry.clone()).await?;
    Ok(Some(compensation))
}
