//! Server Configuration
//!
//! Plain configuration structs with sensible defaults. They are built once at
//! startup (usually from command-line arguments) and never mutated afterwards.
//!
//! ## Overview
//!
//! - [`ServerCfg`]: one listening endpoint and the factory for its connections
//! - [`NioConfig`]: dispatcher threads, buffer sizes, shutdown grace period
//! - [`PacketProcessorConfig`]: worker pool bounds and scaling thresholds
//! - [`ThreadPoolConfig`]: shared executor sizing and deadlock monitoring

use crate::connection::ConnectionFactory;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// Default size of each connection's read and write buffer (8 KB)
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Describes one listening endpoint.
#[derive(Clone)]
pub struct ServerCfg {
    /// Address to bind to, `None` binds the wildcard address
    pub host: Option<IpAddr>,
    /// Port to listen on
    pub port: u16,
    /// Name used in logs
    pub name: String,
    /// Builds connections for sockets accepted on this endpoint
    pub factory: Arc<dyn ConnectionFactory>,
}

impl ServerCfg {
    pub fn new(
        host: Option<IpAddr>,
        port: u16,
        name: impl Into<String>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            host,
            port,
            name: name.into(),
            factory,
        }
    }

    /// Returns the socket address to bind.
    pub fn bind_address(&self) -> SocketAddr {
        let ip = self.host.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.port)
    }
}

impl fmt::Debug for ServerCfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCfg")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Configuration for the I/O layer.
#[derive(Debug, Clone)]
pub struct NioConfig {
    /// Number of read/write dispatchers. Below 1 means a single dispatcher
    /// handles accepting, reading and writing.
    pub read_write_threads: usize,
    /// Capacity of each connection's read buffer, also the largest frame accepted
    pub read_buffer_size: usize,
    /// Capacity of each connection's write buffer
    pub write_buffer_size: usize,
    /// Number of readiness events fetched per poll
    pub events_capacity: usize,
    /// How long shutdown waits after each drain phase
    pub shutdown_grace: Duration,
}

impl Default for NioConfig {
    fn default() -> Self {
        Self {
            read_write_threads: 0,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            events_capacity: 1024,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Configuration for the packet processing pool.
#[derive(Debug, Clone)]
pub struct PacketProcessorConfig {
    /// Workers kept alive at all times
    pub min_threads: usize,
    /// Upper bound on workers
    pub max_threads: usize,
    /// Queue depth above which a worker is added
    pub spawn_threshold: usize,
    /// Queue depth below which a worker is removed
    pub kill_threshold: usize,
    /// How often the pool size is reconsidered
    pub check_interval: Duration,
}

impl Default for PacketProcessorConfig {
    fn default() -> Self {
        Self {
            min_threads: 4,
            max_threads: 8,
            spawn_threshold: 50,
            kill_threshold: 3,
            check_interval: Duration::from_secs(60),
        }
    }
}

impl PacketProcessorConfig {
    /// Returns a copy with thread bounds made consistent.
    ///
    /// At least one worker is always kept and `max_threads` never drops
    /// below `min_threads`.
    pub fn normalized(&self) -> Self {
        let min_threads = self.min_threads.max(1);
        Self {
            min_threads,
            max_threads: self.max_threads.max(min_threads),
            ..self.clone()
        }
    }
}

/// What to do once a deadlock has been detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeadlockPolicy {
    /// Log diagnostics and keep running
    #[default]
    LogOnly,
    /// Log diagnostics and exit with the restart code so a supervisor restarts us
    Restart,
}

/// Configuration for the deadlock monitor.
#[derive(Debug, Clone)]
pub struct DeadlockConfig {
    /// Enables the monitor
    pub enabled: bool,
    /// Time between two lock graph checks
    pub interval: Duration,
    /// Reaction to a detected deadlock
    pub policy: DeadlockPolicy,
}

impl Default for DeadlockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            policy: DeadlockPolicy::LogOnly,
        }
    }
}

/// Configuration for the shared thread pool manager.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Worker threads of the shared runtime
    pub worker_threads: usize,
    /// How long shutdown waits for running tasks
    pub shutdown_timeout: Duration,
    /// Deadlock monitor settings
    pub deadlock: DeadlockConfig,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            shutdown_timeout: Duration::from_secs(5),
            deadlock: DeadlockConfig::default(),
        }
    }
}
