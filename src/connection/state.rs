//! Connection Close State Machine
//!
//! A connection only ever moves forward through its lifecycle:
//!
//! ```text
//!   Open ──close(false)──> PendingClose { forced: false } ──┐
//!    │                              │                        │
//!    │                         close(true)                   │
//!    │                              ▼                        │
//!    └──close(true)───> PendingClose { forced: true } ───────┤
//!                                                            ▼
//!                                                         Closed
//! ```
//!
//! `PendingClose` means closing was requested and the owning dispatcher will
//! finalize it; `Closed` means the socket is gone and every further I/O
//! operation is a no-op.

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Reading and writing normally
    #[default]
    Open,
    /// Close requested. Unforced closes flush pending output first.
    PendingClose { forced: bool },
    /// Socket released, registration cancelled
    Closed,
}

impl ConnectionState {
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    #[inline]
    pub fn is_pending_close(&self) -> bool {
        matches!(self, ConnectionState::PendingClose { .. })
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    /// Whether the pending close skips flushing output.
    #[inline]
    pub fn is_forced_closing(&self) -> bool {
        matches!(self, ConnectionState::PendingClose { forced: true })
    }

    /// Applies a close request.
    ///
    /// Returns `true` when the request changed the state, meaning the owning
    /// dispatcher has to look at the connection again. An unforced request
    /// never downgrades a forced one.
    pub fn request_close(&mut self, forced: bool) -> bool {
        match *self {
            ConnectionState::Open => {
                *self = ConnectionState::PendingClose { forced };
                true
            }
            ConnectionState::PendingClose { forced: false } if forced => {
                *self = ConnectionState::PendingClose { forced: true };
                true
            }
            _ => false,
        }
    }

    /// Moves to `Closed`. Returns `false` if the connection was already closed.
    pub fn finish_close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        *self = ConnectionState::Closed;
        true
    }
}
