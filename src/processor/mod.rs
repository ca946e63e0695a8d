//! Packet Processor Module
//!
//! Decoded packets are executed on a pool of worker threads that grows and
//! shrinks with the queue depth. Packets that belong to the same connection
//! are never executed concurrently and keep their arrival order.
//!
//! ## Architecture
//!
//! ```text
//!   dispatcher threads                     worker threads
//!  ┌──────────────────┐                ┌──────────────────────┐
//!  │ process_data()   │ execute_packet │ 1. unlock previous   │
//!  │  builds a packet │───────┐        │ 2. take first packet │
//!  └──────────────────┘       │        │    whose try_lock()  │
//!                             ▼        │    succeeds, run it  │
//!                   ┌──────────────┐   └──────────┬───────────┘
//!                   │  FIFO queue  │◀─────────────┘
//!                   └──────────────┘
//!                             ▲
//!                             │ samples depth every check_interval
//!                   ┌──────────────────┐
//!                   │   pool checker   │ grow / shrink / lag warning
//!                   └──────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use gsnet::processor::{Packet, PacketProcessor};
//! use gsnet::config::PacketProcessorConfig;
//!
//! let processor = PacketProcessor::new(PacketProcessorConfig::default())?;
//! processor.execute_packet(my_packet);
//! ```

pub mod packet_processor;

pub use packet_processor::{PacketProcessor, ProcessorError, ScaleDecision};

use std::sync::Arc;

/// Per-target exclusion used to run one packet per target at a time.
///
/// `try_lock` must never block.
pub trait AffinityLock: Send + Sync {
    /// Takes the lock if it is free. Returns whether it was taken.
    fn try_lock(&self) -> bool;

    /// Releases a lock taken with `try_lock`.
    fn unlock(&self);
}

/// A unit of work bound to the target it arrived on (usually a connection).
pub trait Packet: Send + 'static {
    type Target: AffinityLock + 'static;

    /// The target whose affinity lock serializes this packet.
    fn target(&self) -> &Arc<Self::Target>;

    /// Executes the packet.
    fn run(self);
}

/// Runs dequeued packets on the worker thread.
pub trait PacketExecutor<P>: Send + Sync + 'static {
    fn execute(&self, packet: P);
}

/// Executor that simply calls [`Packet::run`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectExecutor;

impl<P: Packet> PacketExecutor<P> for DirectExecutor {
    fn execute(&self, packet: P) {
        packet.run();
    }
}
