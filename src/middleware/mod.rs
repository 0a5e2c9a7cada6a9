//! Composable backend wrappers.
//!
//! - [`view`] - Prefix-scoped view
//! - [`encoding`] - Value codecs and printable-key enforcement
//! - [`cache`] - Write-through LRU cache
//! - [`inject`] - Latency and error injection
//! - [`batcher`] - Write coalescing into transactions
//!
//! Every wrapper is generic over its inner [`Backend`] and forwards exactly
//! the capabilities the inner backend advertises.

pub mod batcher;
pub mod cache;
pub mod encoding;
pub mod inject;
pub mod view;

pub use batcher::Batcher;
pub use cache::Cache;
pub use encoding::{Codec, Encoding};
pub use inject::{ErrorInjector, LatencyInjector};
pub use view::View;

use crate::core::config::MiddlewareConfig;
use crate::core::error::PhysicalResult;
use crate::ops::observability::MetricSink;
use crate::physical::Backend;
use std::sync::Arc;

/// Wrap `backend` in the layers `config` asks for:
/// `View -> Encoding -> Cache -> backend`.
pub fn layer(
    backend: Arc<dyn Backend>,
    config: &MiddlewareConfig,
    sink: Arc<dyn MetricSink>,
) -> PhysicalResult<Arc<dyn Backend>> {
    let mut stack = backend;

    if config.cache_enabled {
        stack = Arc::new(
            Cache::new(stack, config.cache_size, sink)
                .with_exclusions(config.cache_exclude_prefixes.iter().cloned()),
        );
    }

    let codec = Codec::from_name(&config.codec)?;
    stack = Arc::new(Encoding::new(stack, codec));

    if !config.view_prefix.is_empty() {
        stack = Arc::new(View::new(stack, config.view_prefix.clone()));
    }

    tracing::debug!(
        cache = config.cache_enabled,
        codec = codec.name(),
        view_prefix = %config.view_prefix,
        "middleware stack assembled"
    );
    Ok(stack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InmemBackend;
    use crate::core::context::Context;
    use crate::ops::observability::noop_sink;
    use crate::physical::Entry;

    #[tokio::test]
    async fn default_stack_is_purgeable() {
        let inner: Arc<dyn Backend> = Arc::new(InmemBackend::default());
        let config = MiddlewareConfig {
            view_prefix: "core/".to_string(),
            codec: "md5".to_string(),
            ..MiddlewareConfig::default()
        };
        let stack = layer(inner.clone(), &config, noop_sink()).unwrap();
        let ctx = Context::background();

        stack.put(&ctx, Entry::new("k", "v")).await.unwrap();
        assert_eq!(stack.get(&ctx, "k").await.unwrap().unwrap().value, b"v");
        assert_eq!(inner.list(&ctx, "").await.unwrap(), vec!["core/"]);
        assert!(stack.as_purgeable().is_some());
    }

    #[tokio::test]
    async fn default_stack_rejects_unprintable_keys() {
        let stack = layer(
            Arc::new(InmemBackend::default()),
            &MiddlewareConfig::default(),
            noop_sink(),
        )
        .unwrap();
        let ctx = Context::background();
        assert!(matches!(
            stack.put(&ctx, Entry::new("a\x01b", "v")).await,
            Err(crate::core::error::PhysicalError::NonPrintableKey { .. })
        ));
        stack.put(&ctx, Entry::new("ab", "v")).await.unwrap();
    }
}
