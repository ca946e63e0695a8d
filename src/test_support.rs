//! Shared fixtures for unit tests.

use crate::config::{DeadlockConfig, NioConfig, ThreadPoolConfig};
use crate::connection::{Connection, ConnectionFactory, ConnectionHandler, ConnectionStats};
use crate::dispatcher::{Dispatcher, DispatcherKind};
use crate::protocol::{write_frame, HEADER_LEN};
use crate::threadpool::ThreadPoolManager;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A hook call seen by [`RecordingHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Initialized,
    Data(Vec<u8>),
    ServerClose,
    Disconnect,
}

/// Collects what handlers observed, shared between test and handlers.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    outbox: Mutex<VecDeque<Bytes>>,
    disconnects: AtomicUsize,
    rejected: AtomicUsize,
}

impl Recorder {
    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Data(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn initialized(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| **e == Event::Initialized)
            .count()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    /// Queues a payload the handler will send framed from `write_data`.
    pub fn queue_output(&self, payload: &[u8]) {
        self.outbox.lock().push_back(Bytes::copy_from_slice(payload));
    }

    pub fn queued_output(&self) -> usize {
        self.outbox.lock().len()
    }
}

/// Hook a [`RecordingHandler`] panics in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    Initialized,
    WriteData,
}

/// Handler recording every hook call.
///
/// Payload `BAD` is rejected and payload `PANIC` panics. In echo mode every
/// payload is sent back.
pub struct RecordingHandler {
    recorder: Arc<Recorder>,
    echo: bool,
    fault: Fault,
}

impl RecordingHandler {
    pub fn new(recorder: Arc<Recorder>) -> Self {
        Self {
            recorder,
            echo: false,
            fault: Fault::None,
        }
    }

    pub fn echoing(recorder: Arc<Recorder>) -> Self {
        Self {
            echo: true,
            ..Self::new(recorder)
        }
    }

    pub fn faulty(recorder: Arc<Recorder>, fault: Fault) -> Self {
        Self {
            fault,
            ..Self::new(recorder)
        }
    }
}

impl ConnectionHandler for RecordingHandler {
    fn initialized(&self, _conn: &Arc<Connection>) {
        self.recorder.record(Event::Initialized);
        if self.fault == Fault::Initialized {
            panic!("initialized failed");
        }
    }

    fn process_data(&self, conn: &Arc<Connection>, data: Bytes) -> bool {
        self.recorder.record(Event::Data(data.to_vec()));
        match &data[..] {
            b"BAD" => return false,
            b"PANIC" => panic!("process_data failed"),
            _ => {}
        }
        if self.echo {
            self.recorder.outbox.lock().push_back(data);
            let _ = conn.enable_write_interest();
        }
        true
    }

    fn write_data(&self, _conn: &Arc<Connection>, buf: &mut BytesMut) -> bool {
        if self.fault == Fault::WriteData {
            panic!("write_data failed");
        }
        let Some(payload) = self.recorder.outbox.lock().pop_front() else {
            return false;
        };
        write_frame(buf, &payload).is_ok()
    }

    fn on_disconnect(&self, _conn: &Arc<Connection>) {
        self.recorder.record(Event::Disconnect);
        self.recorder.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_server_close(&self, _conn: &Arc<Connection>) {
        self.recorder.record(Event::ServerClose);
    }
}

/// Factory building [`RecordingHandler`]s, or refusing every socket.
///
/// Refused sockets are counted as rejected, also when the factory panics.
pub struct RecordingFactory {
    recorder: Arc<Recorder>,
    echo: bool,
    reject: bool,
    panic: bool,
}

impl RecordingFactory {
    pub fn new(recorder: Arc<Recorder>) -> Self {
        Self {
            recorder,
            echo: false,
            reject: false,
            panic: false,
        }
    }

    pub fn echoing(recorder: Arc<Recorder>) -> Self {
        Self {
            echo: true,
            ..Self::new(recorder)
        }
    }

    pub fn rejecting(recorder: Arc<Recorder>) -> Self {
        Self {
            reject: true,
            ..Self::new(recorder)
        }
    }

    pub fn panicking(recorder: Arc<Recorder>) -> Self {
        Self {
            panic: true,
            ..Self::new(recorder)
        }
    }
}

impl ConnectionFactory for RecordingFactory {
    fn create(
        &self,
        _stream: &mio::net::TcpStream,
        _peer: SocketAddr,
        _dispatcher: &Dispatcher,
    ) -> Option<Box<dyn ConnectionHandler>> {
        if self.reject || self.panic {
            self.recorder.rejected.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("factory failed");
            }
            return None;
        }
        let recorder = Arc::clone(&self.recorder);
        Some(Box::new(if self.echo {
            RecordingHandler::echoing(recorder)
        } else {
            RecordingHandler::new(recorder)
        }))
    }
}

/// Thread pool without the deadlock monitor.
pub fn thread_pool() -> Arc<ThreadPoolManager> {
    ThreadPoolManager::new(&ThreadPoolConfig {
        worker_threads: 2,
        shutdown_timeout: Duration::from_secs(1),
        deadlock: DeadlockConfig {
            enabled: false,
            ..Default::default()
        },
    })
    .unwrap()
}

/// A dispatcher with default buffers. Its thread is not started.
pub fn dispatcher(kind: DispatcherKind) -> Arc<Dispatcher> {
    Dispatcher::new(
        "test-dispatcher",
        kind,
        &NioConfig::default(),
        thread_pool(),
        Arc::new(ConnectionStats::new()),
    )
    .unwrap()
}

/// A connected loopback pair: the non-blocking server side and a blocking
/// client.
pub fn socket_pair() -> (mio::net::TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();
    (mio::net::TcpStream::from_std(server), client)
}

/// Reads one frame from a blocking client, failing after two seconds.
pub fn read_frame(client: &mut TcpStream) -> io::Result<Vec<u8>> {
    client.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut header = [0u8; HEADER_LEN];
    client.read_exact(&mut header)?;
    let declared = u16::from_le_bytes(header) as usize;
    let mut payload = vec![0u8; declared.saturating_sub(HEADER_LEN)];
    client.read_exact(&mut payload)?;
    Ok(payload)
}

/// Polls `condition` until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
