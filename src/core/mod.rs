//! Core infrastructure shared by every backend.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`context`] - Per-call cancellation and flags
//! - [`error`] - Error taxonomy
//! - [`parseutil`] - Coercions for dynamic configuration values

pub mod config;
pub mod context;
pub mod error;
pub mod parseutil;
