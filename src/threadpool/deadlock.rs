//! Background Deadlock Detector
//!
//! This module implements a background task that periodically inspects the
//! lock graph for cycles of threads waiting on each other.
//!
//! ## How It Works
//!
//! Every lock in the crate is a `parking_lot` lock. With the
//! `deadlock_detection` feature enabled, parking_lot records which thread
//! holds and waits for which lock, and `check_deadlock` reports every cycle in
//! that graph along with each thread's backtrace.
//!
//! ## Design
//!
//! The detector runs as a Tokio task and:
//! 1. Sleeps for the configured interval
//! 2. Wakes up and checks the lock graph on the blocking pool
//! 3. On the first detection logs the full diagnostics
//! 4. Applies the configured policy: keep running, or exit with
//!    [`RESTART_EXIT_CODE`] so the process supervisor restarts the server

use crate::config::{DeadlockConfig, DeadlockPolicy};
use parking_lot::deadlock;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Exit code asking the supervisor to restart the process.
pub const RESTART_EXIT_CODE: i32 = 2;

/// A handle to the running deadlock detector.
///
/// When this handle is dropped, the detector task is stopped.
#[derive(Debug)]
pub struct DeadLockDetector {
    /// Sender to signal shutdown
    shutdown_tx: watch::Sender<bool>,
    /// Number of checks that found at least one cycle
    detections: Arc<AtomicUsize>,
}

impl DeadLockDetector {
    /// Starts the detector as a background task on `runtime`.
    pub fn start(runtime: &Handle, config: DeadlockConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let detections = Arc::new(AtomicUsize::new(0));

        info!(
            interval_ms = config.interval.as_millis() as u64,
            policy = ?config.policy,
            "Deadlock detector started"
        );
        runtime.spawn(detector_loop(config, Arc::clone(&detections), shutdown_rx));

        Self {
            shutdown_tx,
            detections,
        }
    }

    /// Number of checks that found a deadlock so far.
    pub fn detections(&self) -> usize {
        self.detections.load(Ordering::Relaxed)
    }

    /// Stops the detector.
    ///
    /// This is called automatically when the handle is dropped.
    pub fn stop(&self) {
        if !*self.shutdown_tx.borrow() {
            let _ = self.shutdown_tx.send(true);
            info!("Deadlock detector stopped");
        }
    }
}

impl Drop for DeadLockDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The main detector loop.
async fn detector_loop(
    config: DeadlockConfig,
    detections: Arc<AtomicUsize>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut reported = false;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Deadlock detector received shutdown signal");
                    return;
                }
            }
        }

        let cycles = match tokio::task::spawn_blocking(deadlock::check_deadlock).await {
            Ok(cycles) => cycles,
            Err(e) => {
                error!(error = %e, "Deadlock check failed");
                continue;
            }
        };
        if cycles.is_empty() {
            continue;
        }

        detections.fetch_add(1, Ordering::Relaxed);

        if !reported {
            reported = true;
            let mut report = String::new();
            for (i, threads) in cycles.iter().enumerate() {
                let _ = writeln!(report, "Cycle #{} ({} threads)", i + 1, threads.len());
                for thread in threads {
                    let _ = writeln!(report, "  Thread {:?}:", thread.thread_id());
                    let _ = writeln!(report, "{:?}", thread.backtrace());
                }
            }
            error!(cycles = cycles.len(), "Deadlock detected!\n{}", report);
        }

        if config.policy == DeadlockPolicy::Restart {
            error!(code = RESTART_EXIT_CODE, "Exiting so the server can be restarted");
            std::process::exit(RESTART_EXIT_CODE);
        }
    }
}
