//! Fixed-size pool of worker threads executing submitted tasks.
//!
//! Workers dequeue tasks from a bounded channel and run each to completion
//! before taking the next; a task that blocks on a resource or an
//! initialization occupies its worker for that duration. Task outcomes are
//! observable through [`TaskHandle`], and a panicking task never takes its
//! worker down with it.

use crate::sync::{CancelToken, ConcurrencyGauge};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, trace};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error when submitting a task to the worker pool
#[derive(Error, Debug, Clone)]
pub enum SubmitError {
    /// The pool no longer accepts tasks
    #[error("worker pool is shutting down")]
    ShuttingDown,

    /// The bounded task queue is full
    #[error("task queue is full")]
    QueueFull,
}

/// Observable lifecycle of a submitted task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// Queued, not yet picked up by a worker
    Pending,

    /// A worker is executing the task
    Running,

    /// The task finished successfully
    Completed,

    /// The task returned an error or panicked
    Failed(String),

    /// The task was cancelled before a worker ran it
    Cancelled,
}

impl TaskStatus {
    /// Whether the task has reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed(_) | TaskStatus::Cancelled
        )
    }
}

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads
    pub workers: usize,

    /// Maximum number of queued tasks
    pub queue_size: usize,

    /// Name prefix for worker threads
    pub thread_name_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            queue_size: 256,
            thread_name_prefix: "corral-worker".to_string(),
        }
    }
}

/// Point-in-time snapshot of worker pool counters
#[derive(Debug, Default, Clone)]
pub struct WorkerPoolStats {
    /// Tasks accepted into the queue
    pub queued: usize,

    /// Tasks that completed successfully
    pub completed: usize,

    /// Tasks that returned an error
    pub failed: usize,

    /// Tasks that panicked
    pub panicked: usize,

    /// Tasks cancelled without running
    pub cancelled: usize,

    /// Highest number of tasks observed running concurrently
    pub peak_concurrency: usize,
}

/// A handle for observing one submitted task
pub struct TaskHandle {
    /// Identifier of the task
    id: u64,

    /// Shared status cell, written by the executing worker
    status: Arc<Mutex<TaskStatus>>,

    /// When the task was submitted
    created_at: Instant,
}

impl TaskHandle {
    /// Identifier of the task.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current status of the task.
    pub fn status(&self) -> TaskStatus {
        self.status.lock().clone()
    }

    /// Time since the task was submitted.
    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Block until the task reaches a terminal state, up to `timeout`.
    ///
    /// Returns `None` if the task is still pending or running when the
    /// timeout elapses.
    pub fn wait_with_timeout(&self, timeout: Duration) -> Option<TaskStatus> {
        let start = Instant::now();

        loop {
            let status = self.status();
            if status.is_terminal() {
                return Some(status);
            }

            if start.elapsed() >= timeout {
                return None;
            }

            thread::sleep(Duration::from_millis(10));
        }
    }
}

/// A queued unit of work with its status cell
struct Task {
    /// Identifier of the task
    id: u64,

    /// The closure to execute
    func: Box<dyn FnOnce() -> Result<(), String> + Send + 'static>,

    /// Status cell shared with the task's handle
    status: Arc<Mutex<TaskStatus>>,

    /// When the task was enqueued
    enqueued_at: Instant,
}

impl Task {
    fn mark(&self, status: TaskStatus) {
        *self.status.lock() = status;
    }
}

/// Shared state handed to each worker thread
struct WorkerContext {
    receiver: Receiver<Task>,
    shutting_down: Arc<CancelToken>,
    cancel_pending: Arc<CancelToken>,
    active: Arc<ConcurrencyGauge>,
    tasks_completed: Arc<AtomicUsize>,
    tasks_failed: Arc<AtomicUsize>,
    tasks_panicked: Arc<AtomicUsize>,
    tasks_cancelled: Arc<AtomicUsize>,
}

/// A fixed-size set of worker threads pulling tasks from a bounded queue.
pub struct WorkerPool {
    /// Channel for handing tasks to workers
    task_sender: Sender<Task>,

    /// Receiver kept for the post-join cancellation sweep
    task_receiver: Receiver<Task>,

    /// Worker threads
    workers: Vec<JoinHandle<()>>,

    /// Set once the pool stops accepting tasks
    shutting_down: Arc<CancelToken>,

    /// Set when queued tasks should be cancelled instead of run
    cancel_pending: Arc<CancelToken>,

    /// Tracks current and peak task concurrency
    active: Arc<ConcurrencyGauge>,

    /// Next task identifier
    next_task_id: AtomicU64,

    /// Tasks accepted into the queue
    tasks_queued: AtomicUsize,

    /// Tasks that completed successfully
    tasks_completed: Arc<AtomicUsize>,

    /// Tasks that returned an error
    tasks_failed: Arc<AtomicUsize>,

    /// Tasks that panicked
    tasks_panicked: Arc<AtomicUsize>,

    /// Tasks cancelled without running
    tasks_cancelled: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Create a worker pool with `workers` threads and default queueing.
    pub fn new(workers: usize) -> Self {
        Self::with_config(WorkerPoolConfig {
            workers,
            ..Default::default()
        })
    }

    /// Create a worker pool with the specified configuration.
    pub fn with_config(config: WorkerPoolConfig) -> Self {
        let (task_sender, task_receiver) = bounded(config.queue_size);
        let shutting_down = Arc::new(CancelToken::new());
        let cancel_pending = Arc::new(CancelToken::new());
        let active = Arc::new(ConcurrencyGauge::new());

        let tasks_completed = Arc::new(AtomicUsize::new(0));
        let tasks_failed = Arc::new(AtomicUsize::new(0));
        let tasks_panicked = Arc::new(AtomicUsize::new(0));
        let tasks_cancelled = Arc::new(AtomicUsize::new(0));

        info!(
            "Creating worker pool with {} workers and queue size {}",
            config.workers, config.queue_size
        );

        let mut workers = Vec::with_capacity(config.workers);

        for id in 0..config.workers {
            let thread_name = format!("{}-{}", config.thread_name_prefix, id);

            let ctx = WorkerContext {
                receiver: task_receiver.clone(),
                shutting_down: Arc::clone(&shutting_down),
                cancel_pending: Arc::clone(&cancel_pending),
                active: Arc::clone(&active),
                tasks_completed: Arc::clone(&tasks_completed),
                tasks_failed: Arc::clone(&tasks_failed),
                tasks_panicked: Arc::clone(&tasks_panicked),
                tasks_cancelled: Arc::clone(&tasks_cancelled),
            };

            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || Self::worker_loop(id, ctx))
                .expect("failed to spawn worker thread");

            workers.push(handle);
        }

        Self {
            task_sender,
            task_receiver,
            workers,
            shutting_down,
            cancel_pending,
            active,
            next_task_id: AtomicU64::new(1),
            tasks_queued: AtomicUsize::new(0),
            tasks_completed,
            tasks_failed,
            tasks_panicked,
            tasks_cancelled,
        }
    }

    /// Worker thread main loop
    fn worker_loop(id: usize, ctx: WorkerContext) {
        debug!("Worker {}: starting", id);

        loop {
            match ctx.receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(task) => {
                    if ctx.cancel_pending.is_cancelled() {
                        trace!("Worker {}: cancelling task {}", id, task.id);
                        task.mark(TaskStatus::Cancelled);
                        ctx.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }

                    let Task {
                        id: task_id,
                        func,
                        status,
                        enqueued_at,
                    } = task;

                    trace!(
                        "Worker {}: executing task {} (queue time: {:.2}ms)",
                        id,
                        task_id,
                        enqueued_at.elapsed().as_secs_f64() * 1000.0
                    );

                    *status.lock() = TaskStatus::Running;
                    let _running = ctx.active.enter();

                    match catch_unwind(AssertUnwindSafe(func)) {
                        Ok(Ok(())) => {
                            *status.lock() = TaskStatus::Completed;
                            ctx.tasks_completed.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Err(message)) => {
                            trace!("Worker {}: task {} failed: {}", id, task_id, message);
                            *status.lock() = TaskStatus::Failed(message);
                            ctx.tasks_failed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(panic) => {
                            error!(
                                "Worker {}: task {} panicked: {:?}",
                                id,
                                task_id,
                                panic.downcast_ref::<&str>().unwrap_or(&"<unknown panic>")
                            );
                            *status.lock() = TaskStatus::Failed("task panicked".to_string());
                            ctx.tasks_panicked.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if ctx.shutting_down.is_cancelled() && ctx.receiver.is_empty() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        debug!("Worker {}: stopped", id);
    }

    /// Submit a task for execution.
    ///
    /// Non-blocking: fails with [`SubmitError::QueueFull`] when the bounded
    /// queue is full and [`SubmitError::ShuttingDown`] after shutdown.
    pub fn submit<F>(&self, f: F) -> Result<TaskHandle, SubmitError>
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        if self.shutting_down.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }

        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let status = Arc::new(Mutex::new(TaskStatus::Pending));

        let task = Task {
            id,
            func: Box::new(f),
            status: Arc::clone(&status),
            enqueued_at: Instant::now(),
        };

        match self.task_sender.try_send(task) {
            Ok(()) => {
                self.tasks_queued.fetch_add(1, Ordering::Relaxed);
                trace!("task {} queued", id);
                Ok(TaskHandle {
                    id,
                    status,
                    created_at: Instant::now(),
                })
            }
            Err(TrySendError::Full(_)) => Err(SubmitError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(SubmitError::ShuttingDown),
        }
    }

    /// Submit a task, blocking until queue space is available.
    pub fn submit_blocking<F>(&self, f: F) -> Result<TaskHandle, SubmitError>
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        if self.shutting_down.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }

        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let status = Arc::new(Mutex::new(TaskStatus::Pending));

        let task = Task {
            id,
            func: Box::new(f),
            status: Arc::clone(&status),
            enqueued_at: Instant::now(),
        };

        match self.task_sender.send(task) {
            Ok(()) => {
                self.tasks_queued.fetch_add(1, Ordering::Relaxed);
                trace!("task {} queued (blocking)", id);
                Ok(TaskHandle {
                    id,
                    status,
                    created_at: Instant::now(),
                })
            }
            Err(_) => Err(SubmitError::ShuttingDown),
        }
    }

    /// Stop accepting new tasks.
    ///
    /// Workers keep draining the queue; use
    /// [`shutdown_and_join`](Self::shutdown_and_join) to wait for them.
    pub fn shutdown(&self) {
        info!("Shutting down worker pool");
        self.shutting_down.cancel();
    }

    /// Shut down and wait for every worker to stop.
    ///
    /// With `drain` set, queued tasks finish first; otherwise
    /// queued-but-not-started tasks are marked [`TaskStatus::Cancelled`]
    /// without running. In-flight tasks run to completion either way.
    pub fn shutdown_and_join(mut self, drain: bool) {
        if !drain {
            self.cancel_pending.cancel();
        }
        self.shutdown();

        for worker in self.workers.drain(..) {
            worker.join().unwrap_or_else(|e| {
                error!("Worker thread panicked during shutdown: {:?}", e);
            });
        }

        // Tasks that slipped into the queue as intake closed
        while let Ok(task) = self.task_receiver.try_recv() {
            task.mark(TaskStatus::Cancelled);
            self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
        }

        info!("Worker pool shutdown complete");
    }

    /// Whether the pool has stopped accepting tasks.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.is_cancelled()
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Point-in-time snapshot of pool counters.
    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            queued: self.tasks_queued.load(Ordering::Relaxed),
            completed: self.tasks_completed.load(Ordering::Relaxed),
            failed: self.tasks_failed.load(Ordering::Relaxed),
            panicked: self.tasks_panicked.load(Ordering::Relaxed),
            cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            peak_concurrency: self.active.peak(),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.shutting_down.is_cancelled() {
            self.shutdown();
        }

        // Workers exit when they next check the shutdown flag.
        debug!("Worker pool dropped");
    }
}
