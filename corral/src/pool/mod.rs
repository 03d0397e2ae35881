//! Bounded resource pooling with blocking checkout and FIFO fairness.
//!
//! This module provides the bounded pool of interchangeable resource
//! handles:
//!
//! - Blocking checkout with a deadline and explicit checkin
//! - First-in-first-out service order among blocked waiters
//! - A fixed capacity invariant: free + outstanding handles never exceed it

pub mod resource;

// Re-export key types from resource
pub use resource::{PoolConfig, PoolError, PoolStats, ResourceHandle, ResourcePool};
