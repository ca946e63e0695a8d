//! Listening Socket
//!
//! An `Acceptor` owns the listening socket of one [`ServerCfg`] and lives on
//! an accepting dispatcher. On every readable event it accepts until the
//! backlog is empty, asks the endpoint's [`ConnectionFactory`] for a handler
//! and registers the new connection with the next read/write dispatcher.

use crate::config::ServerCfg;
use crate::connection::{Connection, ConnectionFactory};
use crate::dispatcher::DispatcherGroup;
use crate::threadpool::describe_panic;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// One listening endpoint.
pub struct Acceptor {
    name: String,
    token: Token,
    local_addr: SocketAddr,
    listener: Mutex<TcpListener>,
    factory: Arc<dyn ConnectionFactory>,
    targets: Arc<DispatcherGroup>,
}

impl Acceptor {
    /// Binds the endpoint described by `cfg`.
    ///
    /// # Arguments
    ///
    /// * `cfg` - Address, display name and connection factory
    /// * `token` - Registration token on the accepting dispatcher
    /// * `targets` - Dispatchers that receive the accepted connections
    pub fn bind(cfg: &ServerCfg, token: Token, targets: Arc<DispatcherGroup>) -> io::Result<Arc<Self>> {
        let listener = TcpListener::bind(cfg.bind_address())?;
        let local_addr = listener.local_addr()?;

        Ok(Arc::new(Self {
            name: cfg.name.clone(),
            token,
            local_addr,
            listener: Mutex::new(listener),
            factory: Arc::clone(&cfg.factory),
            targets,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn register(&self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut *self.listener.lock(), self.token, Interest::READABLE)
    }

    pub(crate) fn deregister(&self, registry: &Registry) {
        if let Err(e) = registry.deregister(&mut *self.listener.lock()) {
            trace!(server = %self.name, error = %e, "Listener deregister failed");
        }
    }

    /// Accepts every pending socket.
    ///
    /// A panic while handing off one socket drops that socket only.
    pub(crate) fn accept(&self) {
        loop {
            let accepted = self.listener.lock().accept();
            match accepted {
                Ok((stream, peer)) => {
                    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| self.on_accept(stream, peer))) {
                        error!(
                            server = %self.name,
                            client = %peer,
                            panic = %describe_panic(panic.as_ref()),
                            "Connection handoff panicked"
                        );
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset) => {
                    warn!(server = %self.name, error = %e, "Accepted socket failed before handoff");
                }
                Err(e) => {
                    error!(server = %self.name, error = %e, "Accept failed");
                    return;
                }
            }
        }
    }

    fn on_accept(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            trace!(client = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let Some(dispatcher) = self.targets.next() else {
            error!(server = %self.name, "No dispatcher available for accepted connection");
            return;
        };

        let Some(handler) = self.factory.create(&stream, peer, dispatcher) else {
            debug!(server = %self.name, client = %peer, "Connection rejected by factory");
            return;
        };

        match Connection::open(stream, peer, handler, dispatcher) {
            Ok(conn) => debug!(
                server = %self.name,
                client = %peer,
                dispatcher = %dispatcher.name(),
                token = conn.token().0,
                "Connection accepted"
            ),
            Err(e) => warn!(server = %self.name, client = %peer, error = %e, "Failed to register connection"),
        }
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("name", &self.name)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherKind;
    use crate::test_support::{self, Recorder, RecordingFactory};
    use std::time::Duration;

    fn acceptor(factory: RecordingFactory) -> (Arc<Acceptor>, Arc<crate::dispatcher::Dispatcher>) {
        let dispatcher = test_support::dispatcher(DispatcherKind::AcceptReadWrite);
        let group = Arc::new(DispatcherGroup::new(vec![Arc::clone(&dispatcher)]));
        let cfg = ServerCfg::new(
            Some("127.0.0.1".parse().unwrap()),
            0,
            "test",
            Arc::new(factory),
        );
        let acceptor = Acceptor::bind(&cfg, dispatcher.next_token(), group).unwrap();
        (acceptor, dispatcher)
    }

    #[test]
    fn test_bind_reports_local_addr() {
        let (acceptor, _dispatcher) = acceptor(RecordingFactory::new(Arc::new(Recorder::default())));
        assert_ne!(acceptor.local_addr().port(), 0);
        assert_eq!(acceptor.name(), "test");
    }

    #[test]
    fn test_accept_hands_off_to_dispatcher() {
        let recorder = Arc::new(Recorder::default());
        let (acceptor, dispatcher) = acceptor(RecordingFactory::new(Arc::clone(&recorder)));

        let _a = std::net::TcpStream::connect(acceptor.local_addr()).unwrap();
        let _b = std::net::TcpStream::connect(acceptor.local_addr()).unwrap();

        assert!(test_support::wait_until(Duration::from_secs(2), || {
            acceptor.accept();
            dispatcher.connection_count() == 2
        }));
        assert_eq!(recorder.initialized(), 2);
    }

    #[test]
    fn test_rejected_sockets_are_dropped() {
        let recorder = Arc::new(Recorder::default());
        let (acceptor, dispatcher) = acceptor(RecordingFactory::rejecting(Arc::clone(&recorder)));

        let mut client = std::net::TcpStream::connect(acceptor.local_addr()).unwrap();
        assert!(test_support::wait_until(Duration::from_secs(2), || {
            acceptor.accept();
            recorder.rejected() == 1
        }));

        assert_eq!(dispatcher.connection_count(), 0);
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(std::io::Read::read(&mut client, &mut buf), Ok(0) | Err(_)));
    }

    #[test]
    fn test_panicking_factory_drops_only_that_socket() {
        let recorder = Arc::new(Recorder::default());
        let (acceptor, dispatcher) = acceptor(RecordingFactory::panicking(Arc::clone(&recorder)));

        let _a = std::net::TcpStream::connect(acceptor.local_addr()).unwrap();
        let _b = std::net::TcpStream::connect(acceptor.local_addr()).unwrap();

        assert!(test_support::wait_until(Duration::from_secs(2), || {
            acceptor.accept();
            recorder.rejected() == 2
        }));
        assert_eq!(dispatcher.connection_count(), 0);
    }
}
