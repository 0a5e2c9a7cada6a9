//! Stratum - physical storage layer for a secrets manager.
//!
//! Stratum is the bottom of the storage stack: a small key/value contract
//! ([`physical::Backend`]) with opt-in capabilities, a set of drivers that
//! implement it, and middleware that composes on top of any driver.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Callers                                │
//! │        barrier / mounts / CLI       │     ServiceRegistrar      │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Middleware                             │
//! │   View │ Encoding │ Cache │ Batcher │ Latency/Error injection   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Backend contract                            │
//! │  put/get/delete/list │ Transactional │ HABackend │ PermitPool   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Drivers                                │
//! │      inmem │ inmem_ha │ file │ sql │ object │ pathkv            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::context`] - Per-call cancellation and flags
//! - [`core::error`] - Error taxonomy
//!
//! ## Contract
//! - [`physical`] - Backend traits, key helpers, transactions
//! - [`physical::permit`] - Bounded parallelism
//!
//! ## Drivers
//! - [`backends`] - Driver registry and implementations
//!
//! ## High availability
//! - [`ha::lease`] - Lease-on-key locks
//! - [`ha::fencing`] - Write fencing for the active node
//!
//! ## Middleware
//! - [`middleware`] - Composable backend wrappers
//!
//! ## Service registration
//! - [`registration`] - Node-state publishing to a service catalog
//!
//! ## Operations
//! - [`ops::observability`] - Metric sinks
//! - [`ops::telemetry`] - Tracing setup
//!
//! ## Testing
//! - [`testing`] - Conformance harness shared by every driver
//!
//! # Key Invariants
//!
//! - List returns only immediate children; directories end with `/`
//! - Keys containing `..` are rejected before reaching a driver
//! - A failed transaction leaves no partial writes behind
//! - At most one lock holder per key at any time

// Core infrastructure
pub mod core;

// Backend contract
pub mod physical;

// Drivers
pub mod backends;

// High availability
pub mod ha;

// Middleware
pub mod middleware;

// Service registration
pub mod registration;

// Operations and observability
pub mod ops;

// Conformance harness
pub mod testing;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, context, error};
pub use ops::{observability, telemetry};
pub use physical::{Backend, Entry, HABackend, Lock, PermitPool, Transactional, TxnEntry};
