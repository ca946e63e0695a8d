//! NIO Server
//!
//! Wires listeners and dispatchers together and drives the orderly shutdown.
//!
//! ## Topology
//!
//! ```text
//!   read_write_threads < 1                 read_write_threads = N
//!
//!  ┌────────────────────────┐         ┌──────────────────────┐
//!  │ accept + read/write    │         │ accept only          │
//!  │ dispatcher             │         │ dispatcher           │
//!  │  listeners             │         │  listeners           │
//!  │  connections           │         └──────────┬───────────┘
//!  └────────────────────────┘                    │ round-robin
//!                                     ┌──────────┼──────────┐
//!                                     ▼          ▼          ▼
//!                                  ┌──────┐   ┌──────┐   ┌──────┐
//!                                  │ rw 0 │   │ rw 1 │...│ rw N │
//!                                  └──────┘   └──────┘   └──────┘
//! ```
//!
//! ## Shutdown Sequence
//!
//! 1. Cancel every listener
//! 2. Call `on_server_close` on every live connection
//! 3. Wait `shutdown_grace` so handlers can say goodbye
//! 4. Force-close every remaining connection
//! 5. Wait `shutdown_grace` again
//! 6. Stop the dispatcher threads

use crate::config::{NioConfig, ServerCfg};
use crate::connection::{Connection, ConnectionStats};
use crate::dispatcher::{Acceptor, Dispatcher, DispatcherError, DispatcherGroup, DispatcherKind};
use crate::threadpool::{describe_panic, ThreadPoolManager};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tracing::{error, info};

/// Errors raised while starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {name} on {addr}: {source}")]
    Bind {
        name: String,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("dispatcher error: {0}")]
    Dispatcher(#[from] DispatcherError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The connection-handling core of a server process.
pub struct NioServer {
    configs: Vec<ServerCfg>,
    config: NioConfig,
    accept_dispatcher: Arc<Dispatcher>,
    workers: Arc<DispatcherGroup>,
    /// Every distinct dispatcher, accepting one first
    dispatchers: Vec<Arc<Dispatcher>>,
    acceptors: Mutex<Vec<Arc<Acceptor>>>,
    stats: Arc<ConnectionStats>,
}

impl NioServer {
    /// Creates the dispatchers. Nothing is bound until [`connect`](Self::connect).
    pub fn new(
        configs: Vec<ServerCfg>,
        config: NioConfig,
        thread_pool: Arc<ThreadPoolManager>,
    ) -> Result<Self, ServerError> {
        let stats = Arc::new(ConnectionStats::new());

        let (accept_dispatcher, workers, dispatchers) = if config.read_write_threads < 1 {
            let combined = Dispatcher::new(
                "dispatcher",
                DispatcherKind::AcceptReadWrite,
                &config,
                Arc::clone(&thread_pool),
                Arc::clone(&stats),
            )?;
            let group = DispatcherGroup::new(vec![Arc::clone(&combined)]);
            (Arc::clone(&combined), group, vec![combined])
        } else {
            let accept = Dispatcher::new(
                "accept-dispatcher",
                DispatcherKind::AcceptOnly,
                &config,
                Arc::clone(&thread_pool),
                Arc::clone(&stats),
            )?;
            let read_write = (0..config.read_write_threads)
                .map(|i| {
                    Dispatcher::new(
                        format!("rw-dispatcher-{}", i),
                        DispatcherKind::AcceptReadWrite,
                        &config,
                        Arc::clone(&thread_pool),
                        Arc::clone(&stats),
                    )
                })
                .collect::<io::Result<Vec<_>>>()?;

            let mut all = Vec::with_capacity(read_write.len() + 1);
            all.push(Arc::clone(&accept));
            all.extend(read_write.iter().cloned());
            (accept, DispatcherGroup::new(read_write), all)
        };

        Ok(Self {
            configs,
            config,
            accept_dispatcher,
            workers: Arc::new(workers),
            dispatchers,
            acceptors: Mutex::new(Vec::new()),
            stats,
        })
    }

    /// Starts the dispatcher threads, then binds and registers every
    /// configured endpoint.
    pub fn connect(&self) -> Result<(), ServerError> {
        for dispatcher in &self.dispatchers {
            dispatcher.start()?;
        }

        for cfg in &self.configs {
            let token = self.accept_dispatcher.next_token();
            let acceptor = Acceptor::bind(cfg, token, Arc::clone(&self.workers)).map_err(|source| {
                ServerError::Bind {
                    name: cfg.name.clone(),
                    addr: cfg.bind_address(),
                    source,
                }
            })?;
            self.accept_dispatcher.register_listener(&acceptor)?;

            info!(
                server = %cfg.name,
                addr = %acceptor.local_addr(),
                dispatchers = self.workers.len(),
                "Listening"
            );
            self.acceptors.lock().push(acceptor);
        }
        Ok(())
    }

    /// Addresses actually bound by [`connect`](Self::connect), in
    /// configuration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.acceptors.lock().iter().map(|a| a.local_addr()).collect()
    }

    /// Number of live connections across all dispatchers.
    pub fn active_connections(&self) -> usize {
        self.dispatchers.iter().map(|d| d.connection_count()).sum()
    }

    /// Counters shared by every dispatcher of this server.
    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        self.dispatchers
            .iter()
            .flat_map(|d| d.connections())
            .collect()
    }

    /// Runs the shutdown sequence. Blocks for about twice the grace period.
    pub fn shutdown(&self) {
        info!(
            active = self.active_connections(),
            "Server shutdown: cancelling listeners"
        );
        self.accept_dispatcher.cancel_listeners();

        info!("Server shutdown: notifying connections");
        for conn in self.connections() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| conn.handler().on_server_close(&conn)));
            if let Err(panic) = result {
                error!(
                    client = %conn.peer_addr(),
                    panic = %describe_panic(panic.as_ref()),
                    "on_server_close panicked"
                );
            }
        }
        thread::sleep(self.config.shutdown_grace);

        info!(
            remaining = self.active_connections(),
            "Server shutdown: closing connections"
        );
        for conn in self.connections() {
            conn.close(true);
        }
        thread::sleep(self.config.shutdown_grace);

        for dispatcher in &self.dispatchers {
            dispatcher.stop();
        }
        info!(
            accepted = self.stats.connections_accepted.load(Ordering::Relaxed),
            "Server shutdown complete"
        );
    }
}

impl std::fmt::Debug for NioServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NioServer")
            .field("configs", &self.configs)
            .field("dispatchers", &self.dispatchers.len())
            .finish_non_exhaustive()
    }
}
