//! Connection Module
//!
//! This module manages individual client connections. Connections do not own
//! a thread: a dispatcher multiplexes many of them and calls into their
//! handlers when bytes arrive or the socket can take more output.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Dispatcher thread                          │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!          readable      │      writable
//!        ┌───────────────┴────────────────┐
//!        ▼                                ▼
//! ┌─────────────┐                  ┌─────────────┐
//! │ read buffer │                  │ write buffer│
//! └──────┬──────┘                  └──────▲──────┘
//!        │ frames                         │ bytes
//!        ▼                                │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │     process_data()                     write_data()         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Fixed Buffers**: Each connection reads and writes through bounded buffers
//! - **Close State Machine**: `Open -> PendingClose -> Closed`, forward only
//! - **Affinity Lock**: At most one packet per connection executes at a time
//! - **Statistics**: Tracks connection, frame and byte counters
//!
//! ## Example
//!
//! ```ignore
//! use gsnet::connection::{Connection, ConnectionHandler};
//! use bytes::{Bytes, BytesMut};
//! use std::sync::Arc;
//!
//! struct Discard;
//!
//! impl ConnectionHandler for Discard {
//!     fn process_data(&self, _conn: &Arc<Connection>, _data: Bytes) -> bool { true }
//!     fn write_data(&self, _conn: &Arc<Connection>, _buf: &mut BytesMut) -> bool { false }
//!     fn on_disconnect(&self, _conn: &Arc<Connection>) {}
//!     fn on_server_close(&self, conn: &Arc<Connection>) { conn.close(false) }
//! }
//! ```

pub mod conn;
pub mod handler;
pub mod state;

// Re-export commonly used types
pub use conn::Connection;
pub use handler::{ConnectionError, ConnectionFactory, ConnectionHandler, ConnectionStats};
pub use state::ConnectionState;
