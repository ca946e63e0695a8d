//! Connection
//!
//! A `Connection` wraps one accepted socket together with its fixed-size read
//! and write buffers, its close state machine and the affinity lock the packet
//! processor uses to run at most one packet per connection at a time.
//!
//! ## Ownership
//!
//! The dispatcher that registered the connection is the only thread that
//! reads, writes or finalizes it. Other threads interact through three
//! thread-safe entry points:
//!
//! - [`Connection::close`] requests a close
//! - [`Connection::enable_write_interest`] announces pending output
//! - the affinity lock (via [`AffinityLock`])
//!
//! Locks are split so handler callbacks may call those entry points while the
//! dispatcher is inside `process_data` or `write_data`.

use crate::connection::{ConnectionHandler, ConnectionState};
use crate::dispatcher::{Dispatcher, DispatcherError};
use crate::processor::AffinityLock;
use crate::threadpool::describe_panic;
use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Socket plus its registration bookkeeping.
struct Transport {
    /// `None` once the connection is closed
    stream: Option<TcpStream>,
    /// Whether WRITABLE is part of the registered interest
    write_interest: bool,
    /// Set by `enable_write_interest`, consumed by the write path
    write_requested: bool,
}

/// One client connection.
pub struct Connection {
    token: Token,
    peer: SocketAddr,
    remote_address: String,
    state: Mutex<ConnectionState>,
    transport: Mutex<Transport>,
    read_buf: Mutex<BytesMut>,
    write_buf: Mutex<BytesMut>,
    read_capacity: usize,
    write_capacity: usize,
    locked: AtomicBool,
    handler: Box<dyn ConnectionHandler>,
    dispatcher: Arc<Dispatcher>,
}

impl Connection {
    fn new(
        stream: TcpStream,
        peer: SocketAddr,
        handler: Box<dyn ConnectionHandler>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let read_capacity = dispatcher.read_buffer_size();
        let write_capacity = dispatcher.write_buffer_size();

        Self {
            token: dispatcher.next_token(),
            peer,
            remote_address: peer.ip().to_string(),
            state: Mutex::new(ConnectionState::Open),
            transport: Mutex::new(Transport {
                stream: Some(stream),
                write_interest: false,
                write_requested: false,
            }),
            read_buf: Mutex::new(BytesMut::with_capacity(read_capacity)),
            write_buf: Mutex::new(BytesMut::with_capacity(write_capacity)),
            read_capacity,
            write_capacity,
            locked: AtomicBool::new(false),
            handler,
            dispatcher,
        }
    }

    /// Wraps an accepted socket, registers it for reading with `dispatcher`
    /// and runs the handler's `initialized` hook.
    ///
    /// If `initialized` panics, the connection is force-closed on its
    /// dispatcher and `HandlerPanicked` is returned.
    pub(crate) fn open(
        stream: TcpStream,
        peer: SocketAddr,
        handler: Box<dyn ConnectionHandler>,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<Arc<Self>, DispatcherError> {
        let conn = Arc::new(Self::new(stream, peer, handler, Arc::clone(dispatcher)));
        dispatcher.register_connection(&conn)?;
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| conn.handler.initialized(&conn))) {
            conn.close(true);
            return Err(DispatcherError::HandlerPanicked(describe_panic(panic.as_ref())));
        }
        Ok(conn)
    }

    /// Registration token, unique within the owning dispatcher.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Remote socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Remote IP address as text.
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().is_closed()
    }

    pub fn is_pending_close(&self) -> bool {
        self.state.lock().is_pending_close()
    }

    pub fn handler(&self) -> &dyn ConnectionHandler {
        self.handler.as_ref()
    }

    /// Dispatcher owning this connection's registration.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Requests the connection to be closed. Safe to call from any thread.
    ///
    /// The close completes asynchronously on the owning dispatcher. An
    /// unforced close first flushes everything the handler still wants to
    /// write; a forced close drops pending output.
    pub fn close(&self, forced: bool) {
        let mut state = self.state.lock();
        if state.request_close(forced) {
            debug!(client = %self.peer, forced, "Close requested");
            self.dispatcher.close_connection(self.token);
        }
    }

    /// Tells the dispatcher that the handler has output to send.
    ///
    /// Does nothing once the connection is closed.
    pub fn enable_write_interest(&self) -> io::Result<()> {
        let mut transport = self.transport.lock();
        transport.write_requested = true;
        self.set_write_interest(&mut transport, true)
    }

    fn set_write_interest(&self, transport: &mut Transport, enabled: bool) -> io::Result<()> {
        if transport.write_interest == enabled {
            return Ok(());
        }
        let Some(stream) = transport.stream.as_mut() else {
            return Ok(());
        };

        let interest = if enabled {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        self.dispatcher
            .registry()
            .reregister(stream, self.token, interest)?;
        transport.write_interest = enabled;
        Ok(())
    }

    pub(crate) fn register(&self, registry: &Registry) -> io::Result<()> {
        let mut transport = self.transport.lock();
        match transport.stream.as_mut() {
            Some(stream) => registry.register(stream, self.token, Interest::READABLE),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub(crate) fn read_buffer(&self) -> MutexGuard<'_, BytesMut> {
        self.read_buf.lock()
    }

    pub(crate) fn write_buffer(&self) -> MutexGuard<'_, BytesMut> {
        self.write_buf.lock()
    }

    pub(crate) fn write_capacity(&self) -> usize {
        self.write_capacity
    }

    /// Reads from the socket into the spare capacity of `buf`.
    ///
    /// Returns `Ok(0)` on end of stream, and also once the connection is
    /// closed.
    pub(crate) fn fill_read_buffer(&self, buf: &mut BytesMut) -> io::Result<usize> {
        let mut transport = self.transport.lock();
        let Some(stream) = transport.stream.as_mut() else {
            return Ok(0);
        };

        let filled = buf.len();
        buf.resize(self.read_capacity, 0);
        let result = stream.read(&mut buf[filled..]);
        let n = *result.as_ref().unwrap_or(&0);
        buf.truncate(filled + n);
        result
    }

    /// Writes as much of `data` as the socket accepts.
    pub(crate) fn write_from(&self, data: &[u8]) -> io::Result<usize> {
        let mut transport = self.transport.lock();
        match transport.stream.as_mut() {
            Some(stream) => stream.write(data),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Consumes a pending write request. Returns whether one was pending.
    pub(crate) fn take_write_request(&self) -> bool {
        std::mem::take(&mut self.transport.lock().write_requested)
    }

    /// Keeps WRITABLE registered while output is stuck in the write buffer.
    pub(crate) fn ensure_write_interest(&self) -> io::Result<()> {
        let mut transport = self.transport.lock();
        self.set_write_interest(&mut transport, true)
    }

    /// Drops write interest unless a new write request arrived meanwhile.
    ///
    /// Returns `false` if output was requested and the write path must run
    /// again.
    pub(crate) fn finish_writing(&self) -> io::Result<bool> {
        let mut transport = self.transport.lock();
        if transport.write_requested {
            return Ok(false);
        }
        self.set_write_interest(&mut transport, false)?;
        Ok(true)
    }

    /// Releases the socket and cancels its registration.
    ///
    /// Only the owning dispatcher calls this. Returns `true` on the first call
    /// and `false` afterwards, so teardown happens exactly once.
    pub(crate) fn only_close(&self) -> bool {
        if !self.state.lock().finish_close() {
            return false;
        }

        let mut transport = self.transport.lock();
        if let Some(mut stream) = transport.stream.take() {
            if let Err(e) = self.dispatcher.registry().deregister(&mut stream) {
                trace!(client = %self.peer, error = %e, "Deregister failed");
            }
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                trace!(client = %self.peer, error = %e, "Socket shutdown failed");
            }
        }
        transport.write_interest = false;
        transport.write_requested = false;
        true
    }
}

impl AffinityLock for Connection {
    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
