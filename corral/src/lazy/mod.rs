//! Keyed once-only lazy initialization with per-key locking.
//!
//! This module provides the registry that guarantees each named component is
//! constructed exactly once under concurrent first access:
//!
//! - Per-key state machines, so unrelated keys never contend
//! - Cached results and cached failures, re-surfaced to every caller
//! - Fast-fail cycle detection for re-entrant initialization

pub mod registry;

// Re-export key types from registry
pub use registry::{LazyError, LazyRegistry, RegistryConfig, RegistryStats};
