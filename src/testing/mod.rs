//! Conformance harness shared by every driver's tests.
//!
//! Each `exercise_*` function drives a backend through the behavior the
//! [`Backend`] contract promises and returns the first deviation as an error.
//! The backend must start empty and is left empty on success.
//!
//! ```ignore
//! let backend = InmemBackend::default();
//! exercise_backend(&backend).await?;
//! exercise_backend_list_prefix(&backend).await?;
//! ```

use crate::core::context::Context;
use crate::physical::{Backend, Entry, TxnEntry};
use anyhow::{bail, ensure, Context as _, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn expect_value(b: &dyn Backend, ctx: &Context, key: &str, want: &[u8]) -> Result<()> {
    let got = b
        .get(ctx, key)
        .await
        .with_context(|| format!("get {}", key))?;
    match got {
        Some(entry) => {
            ensure!(entry.key == key, "get {} returned key {}", key, entry.key);
            ensure!(
                entry.value == want,
                "get {}: want {:?}, got {:?}",
                key,
                String::from_utf8_lossy(want),
                String::from_utf8_lossy(&entry.value)
            );
            Ok(())
        }
        None => bail!("get {}: missing", key),
    }
}

async fn expect_missing(b: &dyn Backend, ctx: &Context, key: &str) -> Result<()> {
    let got = b
        .get(ctx, key)
        .await
        .with_context(|| format!("get {}", key))?;
    ensure!(got.is_none(), "get {}: expected no entry, got {:?}", key, got);
    Ok(())
}

async fn expect_list(b: &dyn Backend, ctx: &Context, prefix: &str, want: &[&str]) -> Result<()> {
    let mut got = b
        .list(ctx, prefix)
        .await
        .with_context(|| format!("list {:?}", prefix))?;
    got.sort();
    ensure!(
        got == want,
        "list {:?}: want {:?}, got {:?}",
        prefix,
        want,
        got
    );
    Ok(())
}

/// Basic put/get/delete/list behavior.
pub async fn exercise_backend(b: &dyn Backend) -> Result<()> {
    let ctx = Context::background();

    expect_list(b, &ctx, "", &[]).await?;

    // Missing keys are not errors.
    expect_missing(b, &ctx, "foo").await?;
    b.delete(&ctx, "foo").await.context("delete missing key")?;

    b.put(&ctx, Entry::new("foo", "test"))
        .await
        .context("put foo")?;
    expect_value(b, &ctx, "foo", b"test").await?;
    expect_list(b, &ctx, "", &["foo"]).await?;

    // Put replaces.
    b.put(&ctx, Entry::new("foo", "test2"))
        .await
        .context("overwrite foo")?;
    expect_value(b, &ctx, "foo", b"test2").await?;

    b.delete(&ctx, "foo").await.context("delete foo")?;
    expect_missing(b, &ctx, "foo").await?;
    expect_list(b, &ctx, "", &[]).await?;
    b.delete(&ctx, "foo").await.context("delete foo twice")?;

    // Shallow and nested keys side by side.
    b.put(&ctx, Entry::new("foo", "test")).await.context("put foo")?;
    b.put(&ctx, Entry::new("foo/bar", "baz"))
        .await
        .context("put foo/bar")?;
    expect_list(b, &ctx, "", &["foo", "foo/"]).await?;
    expect_list(b, &ctx, "foo/", &["bar"]).await?;
    expect_value(b, &ctx, "foo", b"test").await?;
    expect_value(b, &ctx, "foo/bar", b"baz").await?;

    // Deeper keys collapse to their first segment.
    b.put(&ctx, Entry::new("foo/bar/baz/qux", "deep"))
        .await
        .context("put deep key")?;
    expect_list(b, &ctx, "foo/", &["bar", "bar/"]).await?;
    expect_list(b, &ctx, "foo/bar/", &["baz/"]).await?;
    expect_list(b, &ctx, "foo/bar/baz/", &["qux"]).await?;

    // Deleting a parent entry leaves children alone.
    b.delete(&ctx, "foo").await.context("delete foo")?;
    expect_list(b, &ctx, "", &["foo/"]).await?;
    expect_value(b, &ctx, "foo/bar", b"baz").await?;

    b.delete(&ctx, "foo/bar/baz/qux")
        .await
        .context("delete deep key")?;
    expect_list(b, &ctx, "foo/", &["bar"]).await?;
    b.delete(&ctx, "foo/bar").await.context("delete foo/bar")?;
    expect_list(b, &ctx, "", &[]).await?;
    expect_list(b, &ctx, "foo/", &[]).await?;

    // Binary values survive untouched.
    let binary: Vec<u8> = (0..=255u8).collect();
    b.put(&ctx, Entry::new("bin", binary.clone()))
        .await
        .context("put binary")?;
    expect_value(b, &ctx, "bin", &binary).await?;
    b.delete(&ctx, "bin").await.context("delete binary")?;

    // Parent references never reach storage.
    ensure!(
        b.put(&ctx, Entry::new("foo/../bar", "x")).await.is_err(),
        "put with a parent reference was accepted"
    );
    expect_list(b, &ctx, "", &[]).await?;

    Ok(())
}

/// Listing under nested prefixes.
pub async fn exercise_backend_list_prefix(b: &dyn Backend) -> Result<()> {
    let ctx = Context::background();

    for key in ["foo", "foo/bar", "foo/zip"] {
        b.put(&ctx, Entry::new(key, "test"))
            .await
            .with_context(|| format!("put {}", key))?;
    }

    expect_list(b, &ctx, "", &["foo", "foo/"]).await?;
    expect_list(b, &ctx, "foo/", &["bar", "zip"]).await?;
    expect_list(b, &ctx, "foo/bar/", &[]).await?;

    for key in ["foo", "foo/bar", "foo/zip"] {
        b.delete(&ctx, key)
            .await
            .with_context(|| format!("delete {}", key))?;
    }
    expect_list(b, &ctx, "", &[]).await?;
    Ok(())
}

/// Transactions apply every member and fill Get members in place.
pub async fn exercise_transactional_backend(b: &dyn Backend) -> Result<()> {
    let ctx = Context::background();
    let Some(txn) = b.as_transactional() else {
        bail!("backend is not transactional");
    };

    for (key, value) in [
        ("foo", "bar"),
        ("zip", "zap"),
        ("deleteme", "gone"),
        ("deleteme2", "gone"),
    ] {
        b.put(&ctx, Entry::new(key, value))
            .await
            .with_context(|| format!("seed {}", key))?;
    }

    let mut txns = vec![
        TxnEntry::get("zip"),
        TxnEntry::put("foo", "bar2"),
        TxnEntry::delete("deleteme"),
        TxnEntry::put("foo", "bar3"),
        TxnEntry::delete("deleteme2"),
        TxnEntry::put("zip", "zap3"),
    ];
    txn.transaction(&ctx, &mut txns)
        .await
        .context("transaction")?;

    ensure!(
        txns[0].entry.value == b"zap",
        "get in transaction: want \"zap\", got {:?}",
        String::from_utf8_lossy(&txns[0].entry.value)
    );
    expect_value(b, &ctx, "foo", b"bar3").await?;
    expect_value(b, &ctx, "zip", b"zap3").await?;
    expect_missing(b, &ctx, "deleteme").await?;
    expect_missing(b, &ctx, "deleteme2").await?;

    // An empty transaction is a no-op.
    txn.transaction(&ctx, &mut [])
        .await
        .context("empty transaction")?;

    for key in ["foo", "zip"] {
        b.delete(&ctx, key)
            .await
            .with_context(|| format!("delete {}", key))?;
    }
    expect_list(b, &ctx, "", &[]).await?;
    Ok(())
}

/// Lock handoff between two handles on the same lock store.
pub async fn exercise_ha_backend(b: &dyn Backend, b2: &dyn Backend) -> Result<()> {
    let Some(ha) = b.as_ha() else {
        bail!("first backend has no HA support");
    };
    let Some(ha2) = b2.as_ha() else {
        bail!("second backend has no HA support");
    };
    ensure!(ha.ha_enabled(), "HA is not enabled");

    let lock = ha.lock_with("foo", "bar").context("lock_with")?;
    let lost = lock
        .lock(CancellationToken::new())
        .await
        .context("lock")?;
    ensure!(lost.is_some(), "lock returned without acquiring");

    let (held, value) = lock.value().await.context("value")?;
    ensure!(held && value == "bar", "value: got ({}, {:?})", held, value);

    // A contender gives up when stopped.
    let lock2 = ha2.lock_with("foo", "baz").context("second lock_with")?;
    let stop = CancellationToken::new();
    let stopper = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper.cancel();
    });
    let attempt = lock2.lock(stop).await.context("contended lock")?;
    ensure!(attempt.is_none(), "contender acquired a held lock");

    let (held, value) = lock2.value().await.context("value from contender")?;
    ensure!(held && value == "bar", "value: got ({}, {:?})", held, value);

    lock.unlock().await.context("unlock")?;

    let lost2 = lock2
        .lock(CancellationToken::new())
        .await
        .context("lock after release")?;
    ensure!(lost2.is_some(), "second lock returned without acquiring");

    let (held, value) = lock.value().await.context("value after handoff")?;
    ensure!(held && value == "baz", "value: got ({}, {:?})", held, value);

    lock2.unlock().await.context("second unlock")?;
    lock2.unlock().await.context("unlock is idempotent")?;
    let (held, _) = lock2.value().await.context("value after unlock")?;
    ensure!(!held, "lock still held after unlock");
    Ok(())
}
