//! Elastic Packet Processor
//!
//! A FIFO queue drained by a pool of worker threads. Each worker takes the
//! first queued packet whose target it can lock, so packets of one connection
//! run one at a time and in order while other connections keep flowing.
//!
//! ## Pool Sizing
//!
//! The pool starts with `min_threads` workers. When `min_threads` and
//! `max_threads` differ, a checker thread samples the queue depth every
//! `check_interval` and compares it with the previous sample:
//!
//! | Depth trend | Condition                    | Action                  |
//! |-------------|------------------------------|-------------------------|
//! | falling     | below `kill_threshold`       | stop one worker         |
//! | rising      | above `spawn_threshold`      | start one worker        |
//! | rising      | at `max_threads`, > 3× spawn | log a lag warning       |
//!
//! Workers are never stopped below `min_threads` or started above
//! `max_threads`.

use crate::config::PacketProcessorConfig;
use crate::processor::{AffinityLock, DirectExecutor, Packet, PacketExecutor};
use crate::threadpool::describe_panic;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors raised while starting the pool.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Outcome of one pool size check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// One worker was added
    Grow,
    /// One worker was asked to stop
    Shrink,
    /// The queue keeps growing and the pool is already at its maximum
    Lagging,
    /// Nothing to do
    Unchanged,
}

impl ScaleDecision {
    /// Decides how the pool should change between two depth samples.
    pub fn evaluate(
        config: &PacketProcessorConfig,
        threads: usize,
        last_depth: usize,
        depth: usize,
    ) -> Self {
        if depth < last_depth && depth < config.kill_threshold {
            if threads > config.min_threads {
                return ScaleDecision::Shrink;
            }
        } else if depth > last_depth && depth > config.spawn_threshold {
            if threads < config.max_threads {
                return ScaleDecision::Grow;
            }
            if depth > config.spawn_threshold.saturating_mul(3) {
                return ScaleDecision::Lagging;
            }
        }
        ScaleDecision::Unchanged
    }
}

struct Worker {
    id: usize,
    interrupted: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// State shared by the processor handle, its workers and the checker.
struct Shared<P: Packet> {
    queue: Mutex<VecDeque<P>>,
    not_empty: Condvar,
    executor: Box<dyn PacketExecutor<P>>,
    workers: Mutex<Vec<Worker>>,
    next_worker_id: AtomicUsize,
    config: PacketProcessorConfig,
    /// Set once at shutdown, wakes the checker
    stopped: Mutex<bool>,
    stop_signal: Condvar,
}

/// Bounded, elastically sized pool executing packets.
pub struct PacketProcessor<P: Packet> {
    shared: Arc<Shared<P>>,
    checker: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Packet> PacketProcessor<P> {
    /// Starts a pool that runs packets with [`Packet::run`].
    pub fn new(config: PacketProcessorConfig) -> Result<Self, ProcessorError> {
        Self::with_executor(config, DirectExecutor)
    }

    /// Starts a pool that hands every dequeued packet to `executor`.
    pub fn with_executor<E>(config: PacketProcessorConfig, executor: E) -> Result<Self, ProcessorError>
    where
        E: PacketExecutor<P>,
    {
        let config = config.normalized();
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            executor: Box::new(executor),
            workers: Mutex::new(Vec::with_capacity(config.max_threads)),
            next_worker_id: AtomicUsize::new(0),
            config,
            stopped: Mutex::new(false),
            stop_signal: Condvar::new(),
        });

        for _ in 0..shared.config.min_threads {
            spawn_worker(&shared)?;
        }

        let checker = if shared.config.min_threads != shared.config.max_threads {
            let checker_shared = Arc::clone(&shared);
            Some(
                thread::Builder::new()
                    .name("packet-pool-checker".into())
                    .spawn(move || checker_loop(checker_shared))?,
            )
        } else {
            None
        };

        info!(
            min_threads = shared.config.min_threads,
            max_threads = shared.config.max_threads,
            elastic = checker.is_some(),
            "Packet processor started"
        );

        Ok(Self {
            shared,
            checker: Mutex::new(checker),
        })
    }

    /// Queues a packet for execution.
    ///
    /// Packets queued after [`shutdown`](Self::shutdown) are dropped.
    pub fn execute_packet(&self, packet: P) {
        if *self.shared.stopped.lock() {
            debug!("Packet processor is shut down, dropping packet");
            return;
        }
        self.shared.queue.lock().push_back(packet);
        self.shared.not_empty.notify_one();
    }

    /// Number of packets waiting for a worker.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Number of live workers.
    pub fn thread_count(&self) -> usize {
        self.shared.workers.lock().len()
    }

    /// Runs one pool size check as the checker would.
    pub fn rescale(&self, last_depth: usize, depth: usize) -> ScaleDecision {
        rescale(&self.shared, last_depth, depth)
    }

    /// Stops the checker and every worker, waiting for running packets.
    ///
    /// Packets still queued are dropped. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut stopped = self.shared.stopped.lock();
            if *stopped {
                return;
            }
            *stopped = true;
        }
        self.shared.stop_signal.notify_all();

        if let Some(checker) = self.checker.lock().take() {
            let _ = checker.join();
        }

        let workers = std::mem::take(&mut *self.shared.workers.lock());
        {
            let _queue = self.shared.queue.lock();
            for worker in &workers {
                worker.interrupted.store(true, Ordering::Release);
            }
        }
        self.shared.not_empty.notify_all();

        let current = thread::current().id();
        for mut worker in workers {
            if let Some(handle) = worker.handle.take() {
                if handle.thread().id() != current {
                    let _ = handle.join();
                }
            }
        }

        let dropped = {
            let mut queue = self.shared.queue.lock();
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        info!(dropped, "Packet processor stopped");
    }
}

impl<P: Packet> Drop for PacketProcessor<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker<P: Packet>(shared: &Arc<Shared<P>>) -> io::Result<()> {
    let id = shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
    let interrupted = Arc::new(AtomicBool::new(false));

    let worker_shared = Arc::clone(shared);
    let worker_flag = Arc::clone(&interrupted);
    let handle = thread::Builder::new()
        .name(format!("packet-worker-{}", id))
        .spawn(move || worker_loop(worker_shared, worker_flag))?;

    shared.workers.lock().push(Worker {
        id,
        interrupted,
        handle: Some(handle),
    });
    debug!(worker = id, "Packet worker started");
    Ok(())
}

/// Interrupts the most recently started worker.
///
/// The worker finishes the packet it is running, if any, then exits. It is
/// not joined here.
fn stop_one_worker<P: Packet>(shared: &Shared<P>) {
    let Some(worker) = shared.workers.lock().pop() else {
        return;
    };
    {
        let _queue = shared.queue.lock();
        worker.interrupted.store(true, Ordering::Release);
    }
    shared.not_empty.notify_all();
    debug!(worker = worker.id, "Packet worker interrupted");
}

fn worker_loop<P: Packet>(shared: Arc<Shared<P>>, interrupted: Arc<AtomicBool>) {
    let mut previous: Option<Arc<P::Target>> = None;

    loop {
        let packet = {
            let mut queue = shared.queue.lock();
            if let Some(target) = previous.take() {
                target.unlock();
            }
            match next_runnable(&shared, &mut queue, &interrupted) {
                Some(packet) => packet,
                None => {
                    drop(queue);
                    shared.not_empty.notify_one();
                    return;
                }
            }
        };

        previous = Some(Arc::clone(packet.target()));
        let executor = &shared.executor;
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(packet))) {
            error!(panic = %describe_panic(panic.as_ref()), "Packet execution panicked");
        }
    }
}

/// Waits for the first queued packet whose target can be locked.
///
/// Returns `None` once the worker is interrupted.
fn next_runnable<P: Packet>(
    shared: &Shared<P>,
    queue: &mut MutexGuard<'_, VecDeque<P>>,
    interrupted: &AtomicBool,
) -> Option<P> {
    loop {
        if interrupted.load(Ordering::Acquire) {
            return None;
        }
        if let Some(index) = queue.iter().position(|packet| packet.target().try_lock()) {
            return queue.remove(index);
        }
        shared.not_empty.wait(queue);
    }
}

fn checker_loop<P: Packet>(shared: Arc<Shared<P>>) {
    let mut last_depth = 0;
    let mut stopped = shared.stopped.lock();

    loop {
        let deadline = Instant::now() + shared.config.check_interval;
        while !*stopped {
            if shared.stop_signal.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        if *stopped {
            return;
        }

        let depth = MutexGuard::unlocked(&mut stopped, || {
            let depth = shared.queue.lock().len();
            rescale(&shared, last_depth, depth);
            depth
        });
        last_depth = depth;
    }
}

fn rescale<P: Packet>(shared: &Arc<Shared<P>>, last_depth: usize, depth: usize) -> ScaleDecision {
    let threads = shared.workers.lock().len();
    let decision = ScaleDecision::evaluate(&shared.config, threads, last_depth, depth);

    match decision {
        ScaleDecision::Grow => {
            if let Err(e) = spawn_worker(shared) {
                error!(error = %e, "Failed to start packet worker");
                return ScaleDecision::Unchanged;
            }
            info!(threads = threads + 1, queue = depth, "Packet pool grown");
        }
        ScaleDecision::Shrink => {
            stop_one_worker(shared);
            info!(threads = threads - 1, queue = depth, "Packet pool shrunk");
        }
        ScaleDecision::Lagging => {
            warn!(
                threads,
                queue = depth,
                "Lag detected: packet queue keeps growing at maximum pool size"
            );
        }
        ScaleDecision::Unchanged => {}
    }
    decision
}
