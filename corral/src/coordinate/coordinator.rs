//! Coordinated execution of tasks needing pooled handles and lazy components.
//!
//! A task declares up front which named components it needs; the coordinator
//! resolves them through the registry and checks a handle out of the pool in
//! an order that cannot produce the circular wait of the classic worker-pool
//! stall. Timeouts on both acquisition paths turn any residual stall into an
//! observable, diagnosable error instead of a hang.

use crate::lazy::registry::{LazyError, LazyRegistry, RegistryConfig};
use crate::pool::resource::{PoolConfig, PoolError, ResourceHandle, ResourcePool};
use crate::sync::CancelToken;
use crate::worker::pool::{SubmitError, TaskHandle, WorkerPool, WorkerPoolConfig};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error surfaced by coordinated task execution
#[derive(Error, Debug, Clone)]
pub enum CoordError {
    /// Checking a pooled handle out or in failed
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Resolving a lazily-constructed component failed
    #[error(transparent)]
    Init(#[from] LazyError),

    /// The task's own work closure failed
    #[error("task failed: {0}")]
    Task(String),

    /// The task could not be queued
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// Order in which a task acquires its pooled handle and its components
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOrder {
    /// Resolve every declared component, then check out a handle.
    ///
    /// Safe at any pool capacity: no task ever holds a pooled handle while
    /// blocked on an initialization owned by another worker.
    InitializeFirst,

    /// Check out a handle, then resolve components while holding it.
    ///
    /// Safe only when pool capacity covers the worker count; otherwise an
    /// initialization in flight can wait on a handle that only another
    /// stalled worker can release.
    ResourceFirst,
}

impl Default for AcquireOrder {
    fn default() -> Self {
        Self::InitializeFirst
    }
}

/// Configuration for a coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Number of worker threads
    pub workers: usize,

    /// Resource pool capacity
    pub capacity: usize,

    /// Acquisition discipline for every task
    pub acquire_order: AcquireOrder,

    /// Deadline for pooled handle checkouts
    pub checkout_timeout: Duration,

    /// Deadline for waiting on another worker's initialization
    pub init_timeout: Duration,

    /// Maximum number of queued tasks
    pub queue_size: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let workers = num_cpus::get();

        Self {
            workers,
            // Capacity covering every worker keeps both disciplines safe.
            capacity: workers,
            acquire_order: AcquireOrder::default(),
            checkout_timeout: Duration::from_secs(5),
            init_timeout: Duration::from_secs(10),
            queue_size: 256,
        }
    }
}

/// Component initializer supplied by the embedding application
type Initializer<T> = Box<dyn FnOnce() -> Result<T, String> + Send + 'static>;

/// Work closure receiving the checked-out handle and resolved components
type Work<T> = Box<dyn FnOnce(&ResourceHandle, &[Arc<T>]) -> Result<(), String> + Send + 'static>;

/// A declared unit of work: the components it needs plus its work closure.
///
/// Components are resolved in declaration order; each initializer runs at
/// most once per key across all tasks sharing the coordinator's registry.
pub struct TaskSpec<T> {
    /// Component keys and their initializers, in resolution order
    components: Vec<(String, Initializer<T>)>,

    /// The work to run once the handle and components are acquired
    work: Work<T>,
}

impl<T> TaskSpec<T> {
    /// Declare a task from its work closure.
    pub fn new<W>(work: W) -> Self
    where
        W: FnOnce(&ResourceHandle, &[Arc<T>]) -> Result<(), String> + Send + 'static,
    {
        Self {
            components: Vec::new(),
            work: Box::new(work),
        }
    }

    /// Declare a named component this task needs.
    ///
    /// The initializer is used only if the key has not been constructed yet;
    /// it may itself resolve further keys through the registry.
    pub fn with_component<F>(mut self, key: impl Into<String>, init: F) -> Self
    where
        F: FnOnce() -> Result<T, String> + Send + 'static,
    {
        self.components.push((key.into(), Box::new(init)));
        self
    }
}

/// Composition of a resource pool, a lazy registry, and a worker pool under
/// one acquisition discipline.
pub struct Coordinator<T: Send + Sync + 'static> {
    /// The bounded handle pool tasks check out of
    pool: Arc<ResourcePool>,

    /// The once-only component registry tasks resolve through
    registry: Arc<LazyRegistry<T>>,

    /// The fixed execution units running submitted tasks
    workers: WorkerPool,

    /// Cancellation signal threaded through blocking acquisitions
    cancel: Arc<CancelToken>,

    /// Configuration for this coordinator
    config: CoordinatorConfig,
}

impl<T: Send + Sync + 'static> Coordinator<T> {
    /// Create a coordinator with the specified configuration.
    ///
    /// A [`AcquireOrder::ResourceFirst`] configuration whose capacity does
    /// not cover the worker count is permitted but logged: it is safe only
    /// if no initializer ever waits on pool checkout, and the configured
    /// timeouts are the backstop if that assumption breaks.
    pub fn new(config: CoordinatorConfig) -> Self {
        if config.acquire_order == AcquireOrder::ResourceFirst && config.capacity < config.workers
        {
            warn!(
                "resource-first acquisition with capacity {} < {} workers can stall; \
                 timeouts will surface it as errors",
                config.capacity, config.workers
            );
        }

        info!(
            "Creating coordinator: {} workers, capacity {}, {:?}",
            config.workers, config.capacity, config.acquire_order
        );

        let pool = ResourcePool::new(PoolConfig {
            capacity: config.capacity,
            checkout_timeout: config.checkout_timeout,
        });

        let registry = Arc::new(LazyRegistry::with_config(RegistryConfig {
            init_timeout: config.init_timeout,
        }));

        let workers = WorkerPool::with_config(WorkerPoolConfig {
            workers: config.workers,
            queue_size: config.queue_size,
            ..Default::default()
        });

        Self {
            pool,
            registry,
            workers,
            cancel: Arc::new(CancelToken::new()),
            config,
        }
    }

    /// Execute a task on the calling thread, returning its typed outcome.
    pub fn run(&self, task: TaskSpec<T>) -> Result<(), CoordError> {
        Self::execute_plan(
            &self.pool,
            &self.registry,
            self.config.acquire_order,
            &self.cancel,
            task,
        )
    }

    /// Queue a task on the worker pool, returning a handle for observing
    /// its completion or failure.
    pub fn submit(&self, task: TaskSpec<T>) -> Result<TaskHandle, CoordError> {
        let pool = Arc::clone(&self.pool);
        let registry = Arc::clone(&self.registry);
        let cancel = Arc::clone(&self.cancel);
        let order = self.config.acquire_order;

        let handle = self.workers.submit(move || {
            Self::execute_plan(&pool, &registry, order, &cancel, task).map_err(|e| e.to_string())
        })?;

        Ok(handle)
    }

    /// Shut the coordinator down.
    ///
    /// With `drain` set, queued tasks finish first. Otherwise queued tasks
    /// are cancelled, blocked checkouts wake with [`PoolError::Cancelled`],
    /// and in-flight initializations observe the cancellation signal.
    pub fn shutdown(self, drain: bool) {
        info!("Shutting down coordinator (drain: {})", drain);

        if drain {
            self.workers.shutdown_and_join(true);
            self.pool.shutdown();
        } else {
            self.cancel.cancel();
            self.pool.shutdown();
            self.workers.shutdown_and_join(false);
        }
    }

    /// The coordinator's resource pool.
    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    /// The coordinator's component registry.
    pub fn registry(&self) -> &Arc<LazyRegistry<T>> {
        &self.registry
    }

    /// The configuration this coordinator was built with.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Acquire in the configured order and run the task's work
    fn execute_plan(
        pool: &Arc<ResourcePool>,
        registry: &LazyRegistry<T>,
        order: AcquireOrder,
        cancel: &CancelToken,
        task: TaskSpec<T>,
    ) -> Result<(), CoordError> {
        let TaskSpec { components, work } = task;

        match order {
            AcquireOrder::InitializeFirst => {
                // Every component is resolved before the scarce handle is
                // taken, so no task holds a handle while blocked on another
                // worker's initialization.
                let mut resolved = Vec::with_capacity(components.len());
                for (key, init) in components {
                    resolved.push(registry.get_or_init_cancellable(&key, cancel, init)?);
                }

                let handle = pool.checkout()?;
                debug!("task acquired slot {} after initialization", handle.slot());

                let outcome = work(&handle, &resolved);
                pool.checkin(handle)?;
                outcome.map_err(CoordError::Task)
            }
            AcquireOrder::ResourceFirst => {
                let handle = pool.checkout()?;
                debug!("task acquired slot {} before initialization", handle.slot());

                // On a failed resolution the handle returns to the pool as
                // it drops.
                let mut resolved = Vec::with_capacity(components.len());
                for (key, init) in components {
                    resolved.push(registry.get_or_init_cancellable(&key, cancel, init)?);
                }

                let outcome = work(&handle, &resolved);
                pool.checkin(handle)?;
                outcome.map_err(CoordError::Task)
            }
        }
    }
}
