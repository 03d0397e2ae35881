//! Fixed-size worker pool with bounded task queueing.
//!
//! This module provides the execution units of the system:
//!
//! - A fixed number of named worker threads pulling from a bounded queue
//! - Per-task status observation through task handles
//! - Graceful shutdown that drains or cancels queued tasks

pub mod pool;

// Re-export key types from pool
pub use pool::{
    SubmitError, TaskHandle, TaskStatus, WorkerPool, WorkerPoolConfig, WorkerPoolStats,
};
