//! # gsnet - Reactor-Style Connection Core for Game Servers
//!
//! gsnet multiplexes many TCP connections over a handful of OS threads,
//! frames a length-prefixed binary protocol and hands decoded packets to an
//! elastically sized worker pool that preserves per-connection ordering.
//!
//! ## Features
//!
//! - **Reactor I/O**: `mio`-driven dispatchers, one thread each
//! - **Framing**: 2-byte little-endian length prefix, header included
//! - **Ordered Packets**: at most one packet per connection runs at a time
//! - **Elastic Pool**: workers are added or removed with the queue depth
//! - **Deadlock Monitor**: periodic lock graph inspection via `parking_lot`
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               NioServer                                 │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────────┐         │
//! │  │  Acceptor   │───>│ Dispatcher  │───>│  ConnectionHandler   │         │
//! │  │ (listener)  │    │ (mio Poll)  │    │  process_data()      │         │
//! │  └─────────────┘    └──────┬──────┘    └──────────┬───────────┘         │
//! │                            │                      │ packets             │
//! │                            │ on_disconnect        ▼                     │
//! │                            ▼            ┌──────────────────────┐        │
//! │                  ┌──────────────────┐   │   PacketProcessor    │        │
//! │                  │ThreadPoolManager │   │  ┌──────┐ ┌──────┐   │        │
//! │                  │  + DeadLock      │   │  │ wkr 0│ │ wkr N│   │        │
//! │                  │    Detector      │   │  └──────┘ └──────┘   │        │
//! │                  └──────────────────┘   └──────────────────────┘        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use gsnet::config::{NioConfig, ServerCfg, ThreadPoolConfig};
//! use gsnet::server::NioServer;
//! use gsnet::threadpool::ThreadPoolManager;
//! use std::sync::Arc;
//!
//! let pool = ThreadPoolManager::new(&ThreadPoolConfig::default())?;
//! let cfg = ServerCfg::new(None, 7777, "game", Arc::new(MyFactory));
//! let server = NioServer::new(vec![cfg], NioConfig::default(), Arc::clone(&pool))?;
//! server.connect()?;
//!
//! // ... run until asked to stop ...
//!
//! server.shutdown();
//! pool.shutdown();
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: Endpoint, I/O, pool and deadlock settings
//! - [`connection`]: Connection state, buffers and application hooks
//! - [`dispatcher`]: Selector threads, accept, read and write paths
//! - [`processor`]: Elastic packet processing pool
//! - [`protocol`]: Frame parsing and encoding
//! - [`server`]: Server assembly and shutdown sequence
//! - [`threadpool`]: Shared scheduler and deadlock monitor
//!
//! ## Design Highlights
//!
//! ### Single Owner per Connection
//!
//! A connection is read, written and finalized only by the dispatcher it was
//! registered with. Other threads request a close or announce output, and the
//! dispatcher picks the request up after being woken.
//!
//! ### Affinity Lock
//!
//! Workers skip queued packets whose connection is already busy, so a slow
//! client never stalls the whole queue.

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod processor;
pub mod protocol;
pub mod server;
pub mod threadpool;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types for convenience
pub use config::{NioConfig, PacketProcessorConfig, ServerCfg, ThreadPoolConfig};
pub use connection::{Connection, ConnectionFactory, ConnectionHandler, ConnectionStats};
pub use dispatcher::{Dispatcher, DispatcherKind};
pub use processor::{Packet, PacketProcessor};
pub use protocol::{encode_frame, write_frame, FrameError, FrameParser};
pub use server::{NioServer, ServerError};
pub use threadpool::{ScheduledTask, ThreadPoolManager};

/// The default port the demo server listens on
pub const DEFAULT_PORT: u16 = 7777;

/// Version of gsnet
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
