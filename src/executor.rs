// src/executor.rs - Worker pools and repeating timers
//!
//! Components never reach for process-wide thread pools. Each one receives an
//! [`Executor`] at construction: a bounded [`WorkerPool`] in production, or an
//! [`InlineExecutor`] when a test needs deterministic, synchronous dispatch.
//! Periodic work runs as a [`RepeatingTask`] with an explicit stop.

use crate::error::{Result, VigilError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Unit of work handed to an executor
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Accepts independent units of work.
///
/// `submit` never blocks: a saturated or stopped executor refuses the task
/// with [`VigilError::Rejected`] and the caller decides what to do with it.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    fn submit(&self, task: Task) -> Result<()>;

    /// Stop accepting work, wait up to `timeout` for in-flight tasks, then
    /// abandon whatever is still queued.
    async fn shutdown(&self, timeout: Duration);
}

// ============================================================================
// WORKER POOL
// ============================================================================

/// Bounded pool running blocking tasks on the tokio runtime.
///
/// At most `workers` tasks run at once; at most `workers + queue_capacity`
/// tasks are admitted (running or waiting) at any moment.
pub struct WorkerPool {
    name: String,
    handle: Handle,
    admission: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
    accepting: AtomicBool,
    capacity: usize,
}

impl WorkerPool {
    /// Create a pool on the runtime of the calling context
    pub fn new(name: impl Into<String>, workers: usize, queue_capacity: usize) -> Result<Self> {
        let name = name.into();
        let handle = Handle::try_current().map_err(|e| {
            VigilError::Runtime(format!("worker pool '{}' needs a tokio runtime: {}", name, e))
        })?;
        Ok(Self::with_handle(name, workers, queue_capacity, handle))
    }

    /// Create a pool on an explicit runtime handle
    pub fn with_handle(
        name: impl Into<String>,
        workers: usize,
        queue_capacity: usize,
        handle: Handle,
    ) -> Self {
        let workers = workers.max(1);
        let capacity = workers + queue_capacity;
        Self {
            name: name.into(),
            handle,
            admission: Arc::new(Semaphore::new(capacity)),
            workers: Arc::new(Semaphore::new(workers)),
            tracker: TaskTracker::new(),
            accepting: AtomicBool::new(true),
            capacity,
        }
    }

    /// Tasks admitted and not yet finished
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Executor for WorkerPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, task: Task) -> Result<()> {
        if !self.is_accepting() {
            return Err(VigilError::Rejected(format!("{} is shut down", self.name)));
        }

        let admission = match self.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                return Err(VigilError::Rejected(format!(
                    "{} saturated ({} tasks admitted)",
                    self.name, self.capacity
                )));
            }
            Err(TryAcquireError::Closed) => {
                return Err(VigilError::Rejected(format!("{} is shut down", self.name)));
            }
        };

        let workers = self.workers.clone();
        let name = self.name.clone();
        self.tracker.spawn_on(
            async move {
                let _admission = admission;
                let Ok(_worker) = workers.acquire_owned().await else {
                    debug!("{}: dropping queued task after forced termination", name);
                    return;
                };
                if let Err(e) = tokio::task::spawn_blocking(task).await {
                    error!("{}: task failed: {}", name, e);
                }
            },
            &self.handle,
        );
        Ok(())
    }

    async fn shutdown(&self, timeout: Duration) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down worker pool {} ({} tasks in flight)", self.name, self.in_flight());

        self.admission.close();
        self.tracker.close();

        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!(
                "{}: {} task(s) still pending after {:?}, forcing termination",
                self.name,
                self.in_flight(),
                timeout
            );
            self.workers.close();
        }
    }
}

// ============================================================================
// INLINE EXECUTOR
// ============================================================================

/// Runs every task immediately on the submitting thread.
#[derive(Debug)]
pub struct InlineExecutor {
    name: String,
    accepting: AtomicBool,
    executed: AtomicU64,
}

impl InlineExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            accepting: AtomicBool::new(true),
            executed: AtomicU64::new(0),
        }
    }

    /// Number of tasks run so far
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }
}

impl Default for InlineExecutor {
    fn default() -> Self {
        Self::new("inline")
    }
}

#[async_trait]
impl Executor for InlineExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, task: Task) -> Result<()> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(VigilError::Rejected(format!("{} is shut down", self.name)));
        }
        task();
        self.executed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn shutdown(&self, _timeout: Duration) {
        self.accepting.store(false, Ordering::Release);
    }
}

// ============================================================================
// REPEATING TASKS
// ============================================================================

/// Cancellable periodic task on the tokio runtime.
///
/// The first tick fires after `initial_delay`, then every `period`. A slow
/// tick delays the following ones instead of bursting to catch up.
pub struct RepeatingTask {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl RepeatingTask {
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        initial_delay: Duration,
        period: Duration,
        mut tick: F,
    ) -> Result<Self>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let runtime = Handle::try_current().map_err(|e| {
            VigilError::Runtime(format!("timer '{}' needs a tokio runtime: {}", name, e))
        })?;

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let task_name = name.clone();
        let period = period.max(Duration::from_millis(1));

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => tick().await,
                }
            }
            debug!("Timer {} stopped", task_name);
        });

        debug!("Timer {} scheduled every {:?} after {:?}", name, period, initial_delay);
        Ok(Self {
            name,
            token,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request cancellation without waiting
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel and wait for the current tick to finish
    pub async fn stop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("Timer {} panicked: {}", self.name, e);
                }
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Holder giving a timer an idempotent start/stop lifecycle
#[derive(Default)]
pub struct TimerSlot {
    task: Mutex<Option<RepeatingTask>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the timer built by `spawn` unless one is already running.
    ///
    /// Returns `false` when the slot was already occupied.
    pub fn start_with<F>(&self, spawn: F) -> Result<bool>
    where
        F: FnOnce() -> Result<RepeatingTask>,
    {
        let mut slot = self.task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(false);
        }
        *slot = Some(spawn()?);
        Ok(true)
    }

    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            task.stop().await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|task| !task.is_finished())
    }
}
