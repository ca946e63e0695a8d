//! Shared Thread Pool Manager
//!
//! One instance is built by the process entry point and handed down to every
//! component that needs to run work off its own thread:
//!
//! - the dispatchers schedule `on_disconnect` callbacks here so application
//!   teardown never blocks a reactor thread
//! - the application schedules one-shot and periodic housekeeping
//! - the deadlock monitor runs as a background task on the same runtime
//!
//! Tasks are closures run on the runtime's blocking pool. A panicking task is
//! logged and does not affect other tasks.
//!
//! ## Shutdown
//!
//! After [`ThreadPoolManager::shutdown`] every scheduling call returns `None`
//! instead of failing. Disconnection callbacks are the exception: those still
//! waiting for their delay run on the thread calling `shutdown`, and those
//! scheduled afterwards run inline.

use crate::config::ThreadPoolConfig;
use crate::threadpool::{describe_panic, DeadLockDetector};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Errors raised while building the thread pool.
#[derive(Debug, Error)]
pub enum ThreadPoolError {
    #[error("failed to build runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Converts a signed millisecond delay into a `Duration`, clamping negative
/// values to zero.
pub fn delay_from_millis(delay_ms: i64) -> Duration {
    Duration::from_millis(delay_ms.max(0) as u64)
}

/// Handle to a scheduled task.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: AbortHandle,
}

impl ScheduledTask {
    /// Cancels the task. A run already in progress completes.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Whether the task finished or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

type PendingTask = Box<dyn FnOnce() + Send>;

/// Disconnection callbacks not yet started, by id.
///
/// Whoever removes an entry runs it: the delayed task on the blocking pool or
/// `shutdown`, whichever comes first.
#[derive(Default)]
struct PendingDisconnections {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, PendingTask>>,
}

impl PendingDisconnections {
    /// Adds `task` unless `shutdown` is set, in which case it is handed back.
    fn insert(&self, task: PendingTask, shutdown: &AtomicBool) -> Result<u64, PendingTask> {
        let mut tasks = self.tasks.lock();
        if shutdown.load(Ordering::Acquire) {
            return Err(task);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tasks.insert(id, task);
        Ok(id)
    }

    fn take(&self, id: u64) -> Option<PendingTask> {
        self.tasks.lock().remove(&id)
    }

    fn drain(&self) -> Vec<PendingTask> {
        self.tasks.lock().drain().map(|(_, task)| task).collect()
    }

    fn len(&self) -> usize {
        self.tasks.lock().len()
    }
}

/// Process-wide executor and scheduler.
pub struct ThreadPoolManager {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    shutdown: AtomicBool,
    shutdown_timeout: Duration,
    detector: Mutex<Option<DeadLockDetector>>,
    disconnections: Arc<PendingDisconnections>,
}

impl ThreadPoolManager {
    /// Builds the runtime and, if enabled, starts the deadlock monitor.
    pub fn new(config: &ThreadPoolConfig) -> Result<Arc<Self>, ThreadPoolError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("gsnet-pool")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        let detector = config
            .deadlock
            .enabled
            .then(|| DeadLockDetector::start(&handle, config.deadlock.clone()));

        info!(
            workers = config.worker_threads.max(1),
            deadlock_monitor = detector.is_some(),
            "Thread pool manager started"
        );

        Ok(Arc::new(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            shutdown: AtomicBool::new(false),
            shutdown_timeout: config.shutdown_timeout,
            detector: Mutex::new(detector),
            disconnections: Arc::new(PendingDisconnections::default()),
        }))
    }

    /// Runtime handle, e.g. for `block_on` from the main thread.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Runs `task` as soon as a thread is free.
    pub fn execute<F>(&self, task: F) -> Option<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            return None;
        }
        Some(self.handle.spawn_blocking(move || run_guarded(task)))
    }

    /// Runs `task` once after `delay`.
    pub fn schedule<F>(&self, task: F, delay: Duration) -> Option<ScheduledTask>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            return None;
        }

        let join = self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = tokio::task::spawn_blocking(move || run_guarded(task)).await;
        });

        Some(ScheduledTask {
            handle: join.abort_handle(),
        })
    }

    /// Schedules the teardown callback of a closed connection.
    ///
    /// Unlike [`schedule`](Self::schedule) the callback is never lost and
    /// cannot be cancelled. If the pool shuts down before the delay expires,
    /// `shutdown` runs it; once the pool is shut down it runs immediately on
    /// the calling thread.
    pub fn schedule_disconnection<F>(&self, task: F, delay: Duration)
    where
        F: FnOnce() + Send + 'static,
    {
        let pending = Arc::clone(&self.disconnections);
        let id = match pending.insert(Box::new(task), &self.shutdown) {
            Ok(id) => id,
            Err(task) => {
                warn!("Thread pool is shut down, running disconnection inline");
                run_guarded(task);
                return;
            }
        };
        self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = tokio::task::spawn_blocking(move || {
                if let Some(task) = pending.take(id) {
                    run_guarded(task);
                }
            })
            .await;
        });
    }

    /// Number of disconnection callbacks waiting for their delay.
    pub fn pending_disconnections(&self) -> usize {
        self.disconnections.len()
    }

    /// Runs `task` every `period`, starting after `initial_delay`.
    ///
    /// Runs are never concurrent. Late runs are caught up back to back to keep
    /// the fixed rate.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        task: F,
        initial_delay: Duration,
        period: Duration,
    ) -> Option<ScheduledTask>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.is_shutdown() || period.is_zero() {
            return None;
        }

        let task = Arc::new(task);
        let join = self.handle.spawn(async move {
            let start = tokio::time::Instant::now() + initial_delay;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Burst);

            loop {
                interval.tick().await;
                let task = Arc::clone(&task);
                let _ = tokio::task::spawn_blocking(move || run_guarded(|| task())).await;
            }
        });

        Some(ScheduledTask {
            handle: join.abort_handle(),
        })
    }

    /// Number of deadlocks seen by the monitor, if it runs.
    pub fn deadlocks_detected(&self) -> Option<usize> {
        self.detector.lock().as_ref().map(DeadLockDetector::detections)
    }

    /// Stops the deadlock monitor and the runtime.
    ///
    /// Disconnection callbacks still waiting for their delay run first, on the
    /// calling thread. Then waits up to the configured timeout for running
    /// tasks. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(detector) = self.detector.lock().take() {
            detector.stop();
        }

        let pending = self.disconnections.drain();
        if !pending.is_empty() {
            info!(count = pending.len(), "Running pending disconnections before shutdown");
            for task in pending {
                run_guarded(task);
            }
        }

        if let Some(runtime) = self.runtime.lock().take() {
            info!("Shutting down thread pool manager");
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(self.shutdown_timeout);
            }
        }
        debug!("Thread pool manager stopped");
    }
}

impl Drop for ThreadPoolManager {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

/// Runs a task, logging instead of propagating a panic.
fn run_guarded<F: FnOnce()>(task: F) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(task)) {
        error!(panic = %describe_panic(panic.as_ref()), "Scheduled task panicked");
    }
}
