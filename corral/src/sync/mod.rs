//! Lightweight atomic primitives shared across the crate.
//!
//! This module provides the small synchronization pieces the pools and the
//! registry build on:
//!
//! - A set-once cancellation token threaded through blocking operations
//! - A concurrency gauge tracking current and peak parallelism

pub mod atomic;

// Re-export key types from atomic
pub use atomic::{CancelToken, ConcurrencyGauge, GaugeGuard};
