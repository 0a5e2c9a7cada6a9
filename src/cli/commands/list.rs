//! List command: print the immediate children of a prefix.

use crate::core::context::Context as OpContext;
use crate::ops::observability::noop_sink;
use crate::physical::Backend;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

/// List keys under a prefix.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Prefix to list; empty lists the root.
    #[arg(default_value = "")]
    pub prefix: String,

    /// Descend into every child directory.
    #[arg(short, long)]
    pub recursive: bool,
}

/// Run the list command.
pub async fn run_list(config_path: &Path, log_level: Option<&str>, args: ListArgs) -> Result<()> {
    let backend = super::open_storage(config_path, log_level, noop_sink())
        .await?
        .stack;
    let ctx = OpContext::background();

    if args.recursive {
        for key in walk(backend.as_ref(), &ctx, &args.prefix).await? {
            println!("{}", key);
        }
    } else {
        let keys = backend
            .list(&ctx, &args.prefix)
            .await
            .with_context(|| format!("list {:?} failed", args.prefix))?;
        for key in keys {
            println!("{}", key);
        }
    }
    Ok(())
}

/// Every leaf key under `prefix`, depth first.
async fn walk(backend: &dyn Backend, ctx: &OpContext, prefix: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut pending = vec![prefix.to_string()];
    while let Some(dir) = pending.pop() {
        let children = backend
            .list(ctx, &dir)
            .await
            .with_context(|| format!("list {:?} failed", dir))?;
        for child in children.into_iter().rev() {
            let full = format!("{}{}", dir, child);
            if child.ends_with('/') {
                pending.push(full);
            } else {
                out.push(full);
            }
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InmemBackend;
    use crate::physical::Entry;

    #[tokio::test]
    async fn walk_finds_every_leaf() {
        let backend = InmemBackend::default();
        let ctx = OpContext::background();
        for key in ["a", "a/b", "a/c/d", "z"] {
            backend.put(&ctx, Entry::new(key, "v")).await.unwrap();
        }
        assert_eq!(
            walk(&backend, &ctx, "").await.unwrap(),
            vec!["a", "a/b", "a/c/d", "z"]
        );
        assert_eq!(walk(&backend, &ctx, "a/").await.unwrap(), vec!["a/b", "a/c/d"]);
    }
}
