//! Diagnose command: smoke-test the configured storage.

use crate::core::context::Context as OpContext;
use crate::ops::observability::InmemSink;
use crate::physical::{Backend, Entry, TxnEntry};
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Smoke-test the configured storage.
#[derive(Args, Debug)]
pub struct DiagnoseArgs {
    /// Also acquire and release an HA lock when the backend supports it.
    #[arg(long)]
    pub ha: bool,

    /// Give up on the HA lock after this many seconds.
    #[arg(long, default_value_t = 5)]
    pub lock_timeout: u64,
}

/// Run the diagnose command.
pub async fn run_diagnose(
    config_path: &Path,
    log_level: Option<&str>,
    args: DiagnoseArgs,
) -> Result<()> {
    let sink = Arc::new(InmemSink::new());
    let storage = super::open_storage(config_path, log_level, sink.clone()).await?;
    let backend = storage.stack;
    println!("Storage: {}", storage.config.storage.kind);

    let ctx = OpContext::background();
    let base = format!("diagnose/{}", uuid::Uuid::new_v4());
    let key = format!("{}/probe", base);
    let value = b"stratum diagnose".to_vec();

    let start = Instant::now();
    backend
        .put(&ctx, Entry::new(key.clone(), value.clone()))
        .await
        .context("put failed")?;
    println!("✓ put ({:?})", start.elapsed());

    let start = Instant::now();
    let got = backend.get(&ctx, &key).await.context("get failed")?;
    match got {
        Some(entry) if entry.value == value => println!("✓ get ({:?})", start.elapsed()),
        Some(_) => anyhow::bail!("get returned a different value than was written"),
        None => anyhow::bail!("get did not find the key just written"),
    }

    let start = Instant::now();
    let listed = backend
        .list(&ctx, &format!("{}/", base))
        .await
        .context("list failed")?;
    if listed != vec!["probe".to_string()] {
        anyhow::bail!("list returned {:?}, expected [\"probe\"]", listed);
    }
    println!("✓ list ({:?})", start.elapsed());

    if let Some(txn) = backend.as_transactional() {
        let start = Instant::now();
        let mut txns = vec![
            TxnEntry::get(key.clone()),
            TxnEntry::put(format!("{}/txn", base), "1"),
            TxnEntry::delete(format!("{}/txn", base)),
        ];
        txn.transaction(&ctx, &mut txns)
            .await
            .context("transaction failed")?;
        if txns[0].entry.value != value {
            anyhow::bail!("transaction get did not observe the probe value");
        }
        println!("✓ transaction ({:?})", start.elapsed());
    } else {
        println!("- transaction: not supported");
    }

    let start = Instant::now();
    backend.delete(&ctx, &key).await.context("delete failed")?;
    if backend.get(&ctx, &key).await?.is_some() {
        anyhow::bail!("key still present after delete");
    }
    println!("✓ delete ({:?})", start.elapsed());

    if args.ha {
        let timeout = Duration::from_secs(args.lock_timeout);
        match storage.ha {
            Some(ha) => diagnose_ha(ha.as_ref(), &base, timeout).await?,
            None => println!("- ha: not supported"),
        }
    }

    for name in sink.names() {
        if let Some(samples) = sink.samples(&name) {
            println!(
                "  {}: {} samples, mean {:.2}ms",
                name,
                samples.count,
                samples.mean()
            );
        }
    }
    println!("✓ Diagnosis complete");
    Ok(())
}

async fn diagnose_ha(
    backend: &dyn Backend,
    base: &str,
    timeout: Duration,
) -> Result<()> {
    let Some(ha) = backend.as_ha().filter(|ha| ha.ha_enabled()) else {
        println!("- ha: not enabled");
        return Ok(());
    };

    let lock = ha
        .lock_with(&format!("{}/lock", base), "diagnose")
        .context("lock_with failed")?;
    let stop = CancellationToken::new();
    let stopper = stop.clone();
    let timer = tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        stopper.cancel();
    });

    let start = Instant::now();
    let lost = lock.lock(stop).await.context("lock failed")?;
    timer.abort();
    if lost.is_none() {
        anyhow::bail!("could not acquire HA lock within {:?}", timeout);
    }
    let (held, value) = lock.value().await.context("lock value failed")?;
    if !held || value != "diagnose" {
        anyhow::bail!("lock value mismatch: ({}, {:?})", held, value);
    }
    lock.unlock().await.context("unlock failed")?;
    println!("✓ ha lock ({:?})", start.elapsed());
    Ok(())
}
