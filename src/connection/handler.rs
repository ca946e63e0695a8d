//! Connection Hooks
//!
//! The I/O core knows nothing about the game protocol. Everything that gives
//! bytes a meaning lives behind the two traits in this module:
//!
//! - [`ConnectionFactory`] decides whether an accepted socket becomes a
//!   connection and builds its handler
//! - [`ConnectionHandler`] receives decoded frames, supplies outgoing bytes and
//!   is told about lifecycle changes
//!
//! ## Threading
//!
//! `process_data` and `write_data` run on the dispatcher thread that owns the
//! connection and must not block. Hand real work to the packet processor.
//! `on_disconnect` runs on the shared thread pool, so it may block (saving a
//! character, for instance).

use crate::connection::Connection;
use crate::dispatcher::Dispatcher;
use crate::protocol::FrameError;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Application side of a connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called once the connection is registered with its dispatcher.
    fn initialized(&self, _conn: &Arc<Connection>) {}

    /// Handles one decoded frame payload.
    ///
    /// Returning `false` marks the payload as a protocol violation and the
    /// connection is closed.
    fn process_data(&self, conn: &Arc<Connection>, data: Bytes) -> bool;

    /// Fills `buf` with the next chunk of outgoing bytes.
    ///
    /// `buf` is empty on entry and its spare capacity is the budget for this
    /// call. Return `false` when there is nothing more to send right now.
    fn write_data(&self, conn: &Arc<Connection>, buf: &mut BytesMut) -> bool;

    /// Called once after the connection has been closed.
    fn on_disconnect(&self, conn: &Arc<Connection>);

    /// Called when the server is about to shut down.
    fn on_server_close(&self, conn: &Arc<Connection>);

    /// Delay before `on_disconnect` runs (e.g. to let a character log out
    /// gracefully).
    fn disconnection_delay(&self) -> Duration {
        Duration::ZERO
    }
}

/// Builds connection handlers for freshly accepted sockets.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Returns the handler for a new connection, or `None` to reject the
    /// socket. Rejected sockets are dropped silently.
    fn create(
        &self,
        stream: &mio::net::TcpStream,
        peer: SocketAddr,
        dispatcher: &Dispatcher,
    ) -> Option<Box<dyn ConnectionHandler>>;
}

/// Reasons a dispatcher drops a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Malformed frame
    #[error("Frame error: {0}")]
    FrameError(#[from] FrameError),

    /// The handler refused a payload
    #[error("Payload rejected by handler")]
    Rejected,

    /// Client disconnected
    #[error("Client disconnected")]
    ClientDisconnected,
}

impl ConnectionError {
    /// Whether this is a protocol violation rather than a transport failure.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ConnectionError::FrameError(_) | ConnectionError::Rejected
        )
    }
}

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total frames handed to handlers
    pub frames_processed: AtomicU64,
    /// Connections dropped for protocol violations
    pub protocol_violations: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn frame_processed(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}
