//! Dispatcher Module
//!
//! A dispatcher is one OS thread driving one `mio::Poll`. It multiplexes the
//! listeners and connections registered with it and performs accept, read and
//! write work as readiness events arrive.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────────────────┐
//!                 │                 Dispatcher                   │
//!   register() ──▶│  gate ──┐                                    │
//!                 │         ▼                                    │
//!   close() ─────▶│  pending close ──▶ poll() ──▶ ready events   │
//!      (waker)    │                               │              │
//!                 │            ┌──────────────────┼─────────┐    │
//!                 │            ▼                  ▼         ▼    │
//!                 │         accept()            read()   write() │
//!                 └──────────────────────────────────────────────┘
//! ```
//!
//! ## Variants
//!
//! - [`DispatcherKind::AcceptOnly`]: only owns listeners and hands accepted
//!   sockets to read/write dispatchers
//! - [`DispatcherKind::AcceptReadWrite`]: owns connections (and possibly
//!   listeners) and processes their close requests
//!
//! ## Threading
//!
//! Registration and close requests may come from any thread. They take the
//! gate or the pending-close list and wake the poll. Reads, writes and the
//! finalization of a connection only ever happen on the dispatcher thread.

pub mod acceptor;
mod io;

pub use acceptor::Acceptor;

use crate::config::NioConfig;
use crate::connection::{Connection, ConnectionState, ConnectionStats};
use crate::protocol::FrameParser;
use crate::threadpool::{describe_panic, ThreadPoolManager};
use mio::event::Event;
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io as stdio;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Token reserved for the poll waker.
pub const WAKE_TOKEN: Token = Token(0);

/// Pause after a failed poll before trying again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Errors raised by dispatcher registration.
#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("I/O error: {0}")]
    Io(#[from] stdio::Error),

    #[error("dispatcher {0} does not own connections")]
    AcceptOnly(String),

    #[error("dispatcher {0} is stopped")]
    Stopped(String),

    #[error("connection handler panicked: {0}")]
    HandlerPanicked(String),
}

/// What a dispatcher does with its registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherKind {
    /// Accepts sockets only, never owns connections
    AcceptOnly,
    /// Accepts, reads and writes
    AcceptReadWrite,
}

/// Something registered with a dispatcher's poll.
#[derive(Clone)]
pub(crate) enum Registration {
    Listener(Arc<Acceptor>),
    Connection(Arc<Connection>),
}

/// One selector thread.
pub struct Dispatcher {
    name: String,
    kind: DispatcherKind,
    registry: Registry,
    waker: Waker,
    /// Serializes registration against event lookup
    gate: Mutex<HashMap<Token, Registration>>,
    pending_close: Mutex<Vec<Token>>,
    next_token: AtomicUsize,
    running: AtomicBool,
    stopped: AtomicBool,
    poll: Mutex<Option<Poll>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    parser: FrameParser,
    read_buffer_size: usize,
    write_buffer_size: usize,
    events_capacity: usize,
    thread_pool: Arc<ThreadPoolManager>,
    stats: Arc<ConnectionStats>,
}

impl Dispatcher {
    /// Creates a dispatcher. Its thread is started by [`start`](Self::start).
    pub fn new(
        name: impl Into<String>,
        kind: DispatcherKind,
        config: &NioConfig,
        thread_pool: Arc<ThreadPoolManager>,
        stats: Arc<ConnectionStats>,
    ) -> stdio::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        Ok(Arc::new(Self {
            name: name.into(),
            kind,
            registry,
            waker,
            gate: Mutex::new(HashMap::new()),
            pending_close: Mutex::new(Vec::new()),
            next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            poll: Mutex::new(Some(poll)),
            thread: Mutex::new(None),
            parser: FrameParser::new(config.read_buffer_size),
            read_buffer_size: config.read_buffer_size,
            write_buffer_size: config.write_buffer_size,
            events_capacity: config.events_capacity.max(1),
            thread_pool,
            stats,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DispatcherKind {
        self.kind
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    pub fn thread_pool(&self) -> &Arc<ThreadPoolManager> {
        &self.thread_pool
    }

    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }

    pub fn write_buffer_size(&self) -> usize {
        self.write_buffer_size
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn parser(&self) -> &FrameParser {
        &self.parser
    }

    /// Allocates a token unique within this dispatcher.
    pub(crate) fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Starts the dispatcher thread. Calling it again does nothing.
    pub fn start(self: &Arc<Self>) -> stdio::Result<()> {
        let Some(poll) = self.poll.lock().take() else {
            return Ok(());
        };

        self.running.store(true, Ordering::Release);
        let dispatcher = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || dispatcher.run(poll))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    fn run(self: Arc<Self>, mut poll: Poll) {
        let mut events = Events::with_capacity(self.events_capacity);
        info!(dispatcher = %self.name, kind = ?self.kind, "Dispatcher started");

        while self.running.load(Ordering::Acquire) {
            match panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(&mut poll, &mut events))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(dispatcher = %self.name, error = %e, "Poll failed");
                    thread::sleep(POLL_ERROR_BACKOFF);
                }
                Err(panic) => {
                    error!(
                        dispatcher = %self.name,
                        panic = %describe_panic(panic.as_ref()),
                        "Dispatcher iteration panicked"
                    );
                }
            }
        }

        info!(dispatcher = %self.name, "Dispatcher stopped");
    }

    /// Runs one iteration: wait for readiness, process close requests, then
    /// every ready registration.
    fn dispatch(&self, poll: &mut Poll, events: &mut Events) -> stdio::Result<()> {
        if let Err(e) = poll.poll(events, None) {
            if e.kind() == stdio::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }

        if self.kind == DispatcherKind::AcceptReadWrite {
            self.process_pending_close();
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }

            let registration = self.gate.lock().get(&event.token()).cloned();
            match registration {
                Some(Registration::Listener(acceptor)) => acceptor.accept(),
                Some(Registration::Connection(conn)) => {
                    self.isolate(&conn, || self.handle_connection_event(&conn, event))
                }
                None => trace!(dispatcher = %self.name, token = event.token().0, "Event for unknown token"),
            }
        }
        Ok(())
    }

    fn handle_connection_event(&self, conn: &Arc<Connection>, event: &Event) {
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            self.read(conn);
        }
        if event.is_writable() && !conn.is_closed() {
            self.write(conn);
        }
    }

    /// Runs handler-facing work for `conn`. A panic closes that connection
    /// and nothing else.
    fn isolate(&self, conn: &Arc<Connection>, work: impl FnOnce()) {
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(work)) {
            error!(
                dispatcher = %self.name,
                client = %conn.peer_addr(),
                panic = %describe_panic(panic.as_ref()),
                "Connection handler panicked, closing connection"
            );
            self.close_now(conn);
        }
    }

    /// Registers a connection for reading.
    pub(crate) fn register_connection(&self, conn: &Arc<Connection>) -> Result<(), DispatcherError> {
        if self.kind == DispatcherKind::AcceptOnly {
            return Err(DispatcherError::AcceptOnly(self.name.clone()));
        }

        let mut gate = self.gate.lock();
        if self.stopped.load(Ordering::Acquire) {
            return Err(DispatcherError::Stopped(self.name.clone()));
        }
        self.waker.wake()?;
        conn.register(&self.registry)?;
        gate.insert(conn.token(), Registration::Connection(Arc::clone(conn)));
        drop(gate);

        self.stats.connection_opened();
        debug!(
            dispatcher = %self.name,
            client = %conn.peer_addr(),
            token = conn.token().0,
            "Connection registered"
        );
        Ok(())
    }

    /// Registers a listener for accepting.
    pub fn register_listener(&self, acceptor: &Arc<Acceptor>) -> Result<(), DispatcherError> {
        let mut gate = self.gate.lock();
        if self.stopped.load(Ordering::Acquire) {
            return Err(DispatcherError::Stopped(self.name.clone()));
        }
        self.waker.wake()?;
        acceptor.register(&self.registry)?;
        gate.insert(acceptor.token(), Registration::Listener(Arc::clone(acceptor)));
        Ok(())
    }

    /// Stops accepting on every listener of this dispatcher.
    pub fn cancel_listeners(&self) {
        let mut gate = self.gate.lock();
        gate.retain(|_, registration| match registration {
            Registration::Listener(acceptor) => {
                acceptor.deregister(&self.registry);
                info!(dispatcher = %self.name, server = %acceptor.name(), "Listener cancelled");
                false
            }
            Registration::Connection(_) => true,
        });
    }

    /// Queues a close request for a connection owned by this dispatcher.
    pub(crate) fn close_connection(&self, token: Token) {
        if self.kind == DispatcherKind::AcceptOnly {
            error!(
                dispatcher = %self.name,
                token = token.0,
                "Close requested on a dispatcher that owns no connections"
            );
            debug_assert!(false, "accept-only dispatcher asked to close a connection");
            return;
        }

        self.pending_close.lock().push(token);
        if let Err(e) = self.waker.wake() {
            warn!(dispatcher = %self.name, error = %e, "Failed to wake dispatcher");
        }
    }

    fn process_pending_close(&self) {
        let pending = std::mem::take(&mut *self.pending_close.lock());

        for token in pending {
            let Some(conn) = self.connection(token) else {
                continue;
            };
            self.isolate(&conn, || self.finish_pending_close(&conn));
        }
    }

    fn finish_pending_close(&self, conn: &Arc<Connection>) {
        match conn.state() {
            ConnectionState::PendingClose { forced: true } => self.close_now(conn),
            ConnectionState::PendingClose { forced: false } => {
                if let Err(e) = conn.enable_write_interest() {
                    debug!(client = %conn.peer_addr(), error = %e, "Cannot flush before close");
                    self.close_now(conn);
                    return;
                }
                self.write(conn);
            }
            ConnectionState::Open | ConnectionState::Closed => {}
        }
    }

    /// Finalizes a connection and schedules its `on_disconnect` callback.
    ///
    /// Only the first call for a connection has an effect.
    pub(crate) fn close_now(&self, conn: &Arc<Connection>) {
        if !conn.only_close() {
            return;
        }

        self.gate.lock().remove(&conn.token());
        self.stats.connection_closed();
        debug!(
            dispatcher = %self.name,
            client = %conn.peer_addr(),
            token = conn.token().0,
            "Connection closed"
        );

        let delay = panic::catch_unwind(AssertUnwindSafe(|| conn.handler().disconnection_delay()))
            .unwrap_or_else(|panic| {
                error!(
                    client = %conn.peer_addr(),
                    panic = %describe_panic(panic.as_ref()),
                    "disconnection_delay panicked, disconnecting now"
                );
                Duration::ZERO
            });
        let closed = Arc::clone(conn);
        self.thread_pool.schedule_disconnection(
            move || closed.handler().on_disconnect(&closed),
            delay,
        );
    }

    fn connection(&self, token: Token) -> Option<Arc<Connection>> {
        match self.gate.lock().get(&token) {
            Some(Registration::Connection(conn)) => Some(Arc::clone(conn)),
            _ => None,
        }
    }

    /// Snapshot of the live connections owned by this dispatcher.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.gate
            .lock()
            .values()
            .filter_map(|registration| match registration {
                Registration::Connection(conn) => Some(Arc::clone(conn)),
                Registration::Listener(_) => None,
            })
            .collect()
    }

    /// Number of live connections owned by this dispatcher.
    pub fn connection_count(&self) -> usize {
        self.gate
            .lock()
            .values()
            .filter(|registration| matches!(registration, Registration::Connection(_)))
            .count()
    }

    /// Number of close requests not yet processed.
    pub fn pending_close_count(&self) -> usize {
        self.pending_close.lock().len()
    }

    /// Stops the thread, then finalizes whatever is still registered.
    ///
    /// Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(dispatcher = %self.name, error = %e, "Failed to wake dispatcher");
        }

        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        let leftovers: Vec<Registration> = self.gate.lock().drain().map(|(_, r)| r).collect();
        for registration in leftovers {
            match registration {
                Registration::Listener(acceptor) => acceptor.deregister(&self.registry),
                Registration::Connection(conn) => self.close_now(&conn),
            }
        }
        self.pending_close.lock().clear();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Read/write dispatchers receiving accepted sockets in round-robin order.
#[derive(Debug)]
pub struct DispatcherGroup {
    dispatchers: Vec<Arc<Dispatcher>>,
    next: AtomicUsize,
}

impl DispatcherGroup {
    pub fn new(dispatchers: Vec<Arc<Dispatcher>>) -> Self {
        Self {
            dispatchers,
            next: AtomicUsize::new(0),
        }
    }

    /// Picks the dispatcher for the next connection.
    pub fn next(&self) -> Option<&Arc<Dispatcher>> {
        if self.dispatchers.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.dispatchers.len();
        self.dispatchers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Dispatcher>> {
        self.dispatchers.iter()
    }

    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_frame;
    use crate::test_support::{self, Event as Seen, Fault, Recorder, RecordingHandler};
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        conn: Arc<Connection>,
        client: StdTcpStream,
        recorder: Arc<Recorder>,
    }

    fn started(handler: impl FnOnce(Arc<Recorder>) -> RecordingHandler) -> Harness {
        let dispatcher = test_support::dispatcher(DispatcherKind::AcceptReadWrite);
        dispatcher.start().unwrap();

        let recorder = Arc::new(Recorder::default());
        let (server, client) = test_support::socket_pair();
        let peer = client.local_addr().unwrap();
        let conn = Connection::open(server, peer, Box::new(handler(Arc::clone(&recorder))), &dispatcher)
            .unwrap();

        Harness {
            dispatcher,
            conn,
            client,
            recorder,
        }
    }

    /// Opens a connection on `dispatcher` with its own recorder.
    fn open_on(dispatcher: &Arc<Dispatcher>, fault: Fault) -> (Arc<Connection>, StdTcpStream, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let (server, client) = test_support::socket_pair();
        let peer = client.local_addr().unwrap();
        let handler = RecordingHandler::faulty(Arc::clone(&recorder), fault);
        let conn = Connection::open(server, peer, Box::new(handler), dispatcher).unwrap();
        (conn, client, recorder)
    }

    fn expect_eof(client: &mut StdTcpStream) {
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 64];
        loop {
            match client.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    }

    #[test]
    fn test_frames_split_across_writes() {
        let mut h = started(RecordingHandler::new);

        h.client.write_all(&[0x07, 0x00, b'H', b'E']).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(h.recorder.payloads().is_empty());

        h.client.write_all(&[b'L', b'L', b'O', 0x01, 0x00]).unwrap();
        assert!(test_support::wait_until(Duration::from_secs(2), || {
            h.recorder.payloads().len() == 2
        }));
        assert_eq!(h.recorder.payloads(), vec![b"HELLO".to_vec(), Vec::new()]);
        assert_eq!(h.dispatcher.stats().frames_processed.load(Ordering::Relaxed), 2);
        h.dispatcher.stop();
    }

    #[test]
    fn test_incomplete_frame_waits() {
        let mut h = started(RecordingHandler::new);

        h.client
            .write_all(&[0x09, 0x00, b'H', b'E', b'L', b'L', b'O'])
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(h.recorder.payloads().is_empty());

        h.client.write_all(b"!!").unwrap();
        assert!(test_support::wait_until(Duration::from_secs(2), || {
            h.recorder.payloads() == vec![b"HELLO!!".to_vec()]
        }));
        h.dispatcher.stop();
    }

    #[test]
    fn test_rejected_payload_closes_connection() {
        let mut h = started(RecordingHandler::new);

        h.client.write_all(&encode_frame(b"BAD").unwrap()).unwrap();

        expect_eof(&mut h.client);
        assert!(test_support::wait_until(Duration::from_secs(2), || {
            h.recorder.disconnects() == 1
        }));
        assert!(h.conn.is_closed());
        assert_eq!(h.dispatcher.connection_count(), 0);
        h.dispatcher.stop();
    }

    #[test]
    fn test_zero_length_is_protocol_violation() {
        let mut h = started(RecordingHandler::new);

        h.client.write_all(&[0x00, 0x00, 0xAA]).unwrap();

        expect_eof(&mut h.client);
        assert!(test_support::wait_until(Duration::from_secs(2), || {
            h.recorder.disconnects() == 1
        }));
        assert!(h.recorder.payloads().is_empty());
        assert_eq!(h.dispatcher.stats().protocol_violations.load(Ordering::Relaxed), 1);
        h.dispatcher.stop();
    }

    #[test]
    fn test_peer_disconnect_finalizes() {
        let h = started(RecordingHandler::new);

        drop(h.client);

        assert!(test_support::wait_until(Duration::from_secs(2), || {
            h.recorder.disconnects() == 1
        }));
        assert_eq!(h.dispatcher.connection_count(), 0);
        assert_eq!(h.dispatcher.stats().active_connections.load(Ordering::Relaxed), 0);
        h.dispatcher.stop();
    }

    #[test]
    fn test_echo_response_is_written() {
        let mut h = started(RecordingHandler::echoing);

        h.client.write_all(&encode_frame(b"PING").unwrap()).unwrap();

        let frame = test_support::read_frame(&mut h.client).unwrap();
        assert_eq!(frame, b"PING");
        assert!(h.conn.state().is_open());
        h.dispatcher.stop();
    }

    #[test]
    fn test_unforced_close_flushes_output_first() {
        let mut h = started(RecordingHandler::new);

        h.recorder.queue_output(b"BYE");
        h.conn.close(false);

        let frame = test_support::read_frame(&mut h.client).unwrap();
        assert_eq!(frame, b"BYE");
        expect_eof(&mut h.client);
        assert!(test_support::wait_until(Duration::from_secs(2), || {
            h.recorder.disconnects() == 1
        }));
        h.dispatcher.stop();
    }

    #[test]
    fn test_forced_close_drops_output() {
        let mut h = started(RecordingHandler::new);

        h.recorder.queue_output(b"LOST");
        h.conn.close(true);

        assert!(test_support::wait_until(Duration::from_secs(2), || {
            h.recorder.disconnects() == 1
        }));
        h.client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(h.client.read(&mut buf), Ok(0) | Err(_)));
        assert_eq!(h.recorder.queued_output(), 1);
        h.dispatcher.stop();
    }

    #[test]
    fn test_finalize_runs_disconnect_once() {
        let h = started(RecordingHandler::new);

        h.dispatcher.close_now(&h.conn);
        h.dispatcher.close_now(&h.conn);
        h.conn.close(true);

        assert!(test_support::wait_until(Duration::from_secs(2), || {
            h.recorder.disconnects() == 1
        }));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(h.recorder.disconnects(), 1);
        assert_eq!(
            h.recorder
                .events()
                .iter()
                .filter(|e| **e == Seen::Disconnect)
                .count(),
            1
        );
        h.dispatcher.stop();
    }

    #[test]
    fn test_handler_panic_closes_only_its_connection() {
        let dispatcher = test_support::dispatcher(DispatcherKind::AcceptReadWrite);
        let (a, mut a_client, a_seen) = open_on(&dispatcher, Fault::None);
        let (b, mut b_client, b_seen) = open_on(&dispatcher, Fault::None);

        // Both frames are buffered before the first poll, so they arrive in
        // one batch of events.
        a_client.write_all(&encode_frame(b"PANIC").unwrap()).unwrap();
        b_client.write_all(&encode_frame(b"HELLO").unwrap()).unwrap();
        thread::sleep(Duration::from_millis(50));
        dispatcher.start().unwrap();

        assert!(test_support::wait_until(Duration::from_secs(2), || {
            b_seen.payloads() == vec![b"HELLO".to_vec()]
        }));
        expect_eof(&mut a_client);
        assert!(test_support::wait_until(Duration::from_secs(2), || {
            a_seen.disconnects() == 1
        }));
        assert!(a.is_closed());
        assert!(b.state().is_open());
        assert_eq!(dispatcher.connection_count(), 1);

        // The dispatcher keeps serving the surviving connection
        b_client.write_all(&encode_frame(b"AGAIN").unwrap()).unwrap();
        assert!(test_support::wait_until(Duration::from_secs(2), || {
            b_seen.payloads().len() == 2
        }));
        assert_eq!(b_seen.disconnects(), 0);
        dispatcher.stop();
    }

    #[test]
    fn test_pending_close_survives_panicking_flush() {
        let dispatcher = test_support::dispatcher(DispatcherKind::AcceptReadWrite);
        let (a, _a_client, a_seen) = open_on(&dispatcher, Fault::WriteData);
        let (b, _b_client, b_seen) = open_on(&dispatcher, Fault::None);

        a.close(false);
        b.close(true);
        assert_eq!(dispatcher.pending_close_count(), 2);
        dispatcher.start().unwrap();

        assert!(test_support::wait_until(Duration::from_secs(2), || {
            a_seen.disconnects() == 1 && b_seen.disconnects() == 1
        }));
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(dispatcher.connection_count(), 0);
        dispatcher.stop();
    }

    #[test]
    fn test_accept_only_refuses_connections() {
        let dispatcher = test_support::dispatcher(DispatcherKind::AcceptOnly);
        let (server, client) = test_support::socket_pair();
        let peer = client.local_addr().unwrap();
        let handler = RecordingHandler::new(Arc::new(Recorder::default()));

        let result = Connection::open(server, peer, Box::new(handler), &dispatcher);
        assert!(matches!(result, Err(DispatcherError::AcceptOnly(_))));
        assert_eq!(dispatcher.connection_count(), 0);
    }

    #[test]
    fn test_stop_finalizes_leftovers() {
        let h = started(RecordingHandler::new);
        assert_eq!(h.dispatcher.connection_count(), 1);

        h.dispatcher.stop();
        h.dispatcher.stop();

        assert!(h.conn.is_closed());
        assert_eq!(h.dispatcher.connection_count(), 0);
        assert!(test_support::wait_until(Duration::from_secs(2), || {
            h.recorder.disconnects() == 1
        }));
    }

    #[test]
    fn test_group_round_robin() {
        let a = test_support::dispatcher(DispatcherKind::AcceptReadWrite);
        let b = test_support::dispatcher(DispatcherKind::AcceptReadWrite);
        let group = DispatcherGroup::new(vec![Arc::clone(&a), Arc::clone(&b)]);

        assert!(Arc::ptr_eq(group.next().unwrap(), &a));
        assert!(Arc::ptr_eq(group.next().unwrap(), &b));
        assert!(Arc::ptr_eq(group.next().unwrap(), &a));
        assert!(DispatcherGroup::new(Vec::new()).next().is_none());
    }
}
