#![deny(warnings)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

//! # Corral
//!
//! Deadlock-aware coordination of bounded resource pools, once-only
//! initialization, and fixed worker pools.
//!
//! This crate provides the coordination layer for a classic hazard: a
//! fixed-size worker pool in which every task needs both a handle from a
//! bounded resource pool and one or more lazily-constructed shared
//! components. When the acquisition order is inconsistent across workers,
//! the system can deadlock with every worker blocked on a resource that only
//! another blocked worker can release. Corral provides:
//!
//! - Bounded resource pooling with blocking checkout and FIFO fairness
//! - A keyed once-only initialization registry with per-key locking
//! - A fixed-size worker pool with bounded queueing and cancellation
//! - A coordinator enforcing the acquisition order that keeps the three
//!   deadlock-free, with timeouts that turn any residual stall into an
//!   observable error
//!
//! ## Picking an acquisition order
//!
//! The coordinator supports two disciplines:
//!
//! - [`AcquireOrder::InitializeFirst`] resolves every component a task
//!   declares *before* checking out a pooled handle. Safe at any pool
//!   capacity.
//! - [`AcquireOrder::ResourceFirst`] checks out first and initializes while
//!   holding the handle. Safe only when pool capacity is at least the worker
//!   count, because an initialization in flight must never wait on a handle
//!   that only another stalled worker can release.

/// Deadlock-avoidance policy composing pools, registry, and workers
pub mod coordinate;

/// Keyed once-only lazy initialization with per-key locking
pub mod lazy;

/// Bounded resource pooling with blocking checkout and FIFO fairness
pub mod pool;

/// Lightweight atomic primitives shared across the crate
pub mod sync;

/// Fixed-size worker pool with bounded task queueing
pub mod worker;

// Re-export key types for easier access
pub use coordinate::coordinator::{
    AcquireOrder, CoordError, Coordinator, CoordinatorConfig, TaskSpec,
};
pub use lazy::registry::{LazyError, LazyRegistry};
pub use pool::resource::{PoolError, ResourceHandle, ResourcePool};
pub use worker::pool::{SubmitError, TaskHandle, TaskStatus, WorkerPool};
