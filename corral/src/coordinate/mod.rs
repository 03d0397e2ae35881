//! Deadlock-avoidance policy composing pools, registry, and workers.
//!
//! This module provides the coordinator that owns the acquisition
//! discipline:
//!
//! - Resolve a task's lazily-constructed components before checking out a
//!   pooled handle, or
//! - Hold the handle through initialization only when pool capacity covers
//!   every worker
//!
//! Either discipline keeps the fixed worker pool from reaching the state
//! where every worker waits on a resource only another blocked worker can
//! release.

pub mod coordinator;

// Re-export key types from coordinator
pub use coordinator::{AcquireOrder, CoordError, Coordinator, CoordinatorConfig, TaskSpec};
