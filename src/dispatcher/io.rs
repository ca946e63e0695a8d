//! Connection Read and Write Paths
//!
//! Both paths run on the dispatcher thread that owns the connection.
//!
//! ## Read
//!
//! The socket is drained into the connection's read buffer until it would
//! block. After every successful read, all complete frames are cut from the
//! front of the buffer and handed to the handler. A partial frame stays at the
//! start of the buffer until the rest of it arrives.
//!
//! ## Write
//!
//! ```text
//!   flush leftovers ──would block──> keep WRITABLE interest, retry later
//!         │
//!         ▼
//!   write_data() ──bytes──> flush ──> write_data() ...
//!         │
//!    nothing more
//!         ▼
//!   drop WRITABLE interest ──pending close?──> finalize
//! ```

use crate::connection::{Connection, ConnectionError};
use crate::dispatcher::Dispatcher;
use bytes::{Buf, BytesMut};
use std::io::{self, ErrorKind};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

impl Dispatcher {
    /// Reads everything available on `conn` and processes complete frames.
    pub(super) fn read(&self, conn: &Arc<Connection>) {
        if let Err(e) = self.read_frames(conn) {
            self.drop_connection(conn, &e);
        }
    }

    fn read_frames(&self, conn: &Arc<Connection>) -> Result<(), ConnectionError> {
        let mut buf = conn.read_buffer();

        loop {
            match conn.fill_read_buffer(&mut buf) {
                Ok(0) => return Err(ConnectionError::ClientDisconnected),
                Ok(n) => {
                    self.stats().bytes_read(n);
                    trace!(client = %conn.peer_addr(), bytes = n, buffered = buf.len(), "Read");
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            self.process_frames(conn, &mut buf)?;
        }
    }

    fn process_frames(&self, conn: &Arc<Connection>, buf: &mut BytesMut) -> Result<(), ConnectionError> {
        loop {
            let payload = match self.parser().next_frame(buf) {
                Ok(Some(payload)) => payload,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(
                        client = %conn.peer_addr(),
                        error = %e,
                        available = buf.len(),
                        "Malformed frame"
                    );
                    return Err(e.into());
                }
            };

            if !conn.state().is_open() {
                trace!(client = %conn.peer_addr(), "Dropping frame of closing connection");
                continue;
            }

            self.stats().frame_processed();
            trace!(client = %conn.peer_addr(), len = payload.len(), "Frame received");
            if !conn.handler().process_data(conn, payload) {
                return Err(ConnectionError::Rejected);
            }
        }
    }

    /// Flushes pending output of `conn` and pulls more from its handler.
    ///
    /// Finalizes the connection once everything is written and a close is
    /// pending. A forced close skips the output and finalizes right away.
    pub(super) fn write(&self, conn: &Arc<Connection>) {
        if conn.state().is_forced_closing() {
            self.close_now(conn);
            return;
        }

        match self.drain_output(conn) {
            Ok(true) => {
                if conn.is_pending_close() {
                    self.close_now(conn);
                }
            }
            Ok(false) => {}
            Err(e) => self.drop_connection(conn, &ConnectionError::from(e)),
        }
    }

    /// Returns `Ok(true)` once the handler has nothing more to send and the
    /// buffer is empty, `Ok(false)` if the socket stopped taking bytes.
    fn drain_output(&self, conn: &Arc<Connection>) -> io::Result<bool> {
        let mut buf = conn.write_buffer();
        let mut more = true;

        loop {
            if !self.flush(conn, &mut buf)? {
                conn.ensure_write_interest()?;
                return Ok(false);
            }

            if conn.take_write_request() {
                more = true;
            }
            if more {
                buf.clear();
                buf.reserve(conn.write_capacity());
                more = conn.handler().write_data(conn, &mut buf);
                if !buf.is_empty() {
                    continue;
                }
            }

            if conn.finish_writing()? {
                return Ok(true);
            }
            more = true;
        }
    }

    /// Writes the buffered bytes. Returns `Ok(false)` if the socket is full.
    fn flush(&self, conn: &Arc<Connection>, buf: &mut BytesMut) -> io::Result<bool> {
        while buf.has_remaining() {
            match conn.write_from(&buf[..]) {
                Ok(0) => {
                    trace!(client = %conn.peer_addr(), remaining = buf.len(), "Zero-byte write, retrying later");
                    return Ok(false);
                }
                Ok(n) => {
                    buf.advance(n);
                    self.stats().bytes_written(n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    trace!(client = %conn.peer_addr(), remaining = buf.len(), "Socket full, retrying later");
                    return Ok(false);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn drop_connection(&self, conn: &Arc<Connection>, reason: &ConnectionError) {
        match reason {
            ConnectionError::ClientDisconnected => {
                debug!(client = %conn.peer_addr(), "Client disconnected");
            }
            e if e.is_protocol_violation() => {
                self.stats().protocol_violation();
                warn!(client = %conn.peer_addr(), error = %e, "Protocol violation, closing connection");
            }
            ConnectionError::IoError(e) if is_disconnect(e) => {
                debug!(client = %conn.peer_addr(), error = %e, "Connection reset by peer");
            }
            e => {
                error!(client = %conn.peer_addr(), error = %e, "Connection error");
            }
        }
        self.close_now(conn);
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
    )
}
