//! Operations and observability.
//!
//! - [`observability`] - Metric sinks and per-driver metric names
//! - [`telemetry`] - Tracing subscriber installation

pub mod observability;
pub mod telemetry;
