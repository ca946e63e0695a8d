//! gsnet - Framed Echo Server
//!
//! This is the demo entry point for gsnet. It wires every component together:
//! the factory builds a handler per connection, the handler turns frames into
//! packets, the packet processor runs them and the response goes back through
//! the connection's write path.

use bytes::{Bytes, BytesMut};
use gsnet::config::{DeadlockConfig, DeadlockPolicy, NioConfig, PacketProcessorConfig, ServerCfg, ThreadPoolConfig};
use gsnet::connection::{Connection, ConnectionFactory, ConnectionHandler};
use gsnet::dispatcher::Dispatcher;
use gsnet::processor::{Packet, PacketProcessor};
use gsnet::protocol::write_frame;
use gsnet::server::NioServer;
use gsnet::threadpool::ThreadPoolManager;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// How often connection statistics are logged
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Server configuration
struct Config {
    /// Host to bind to, wildcard if unset
    host: Option<IpAddr>,
    /// Port to listen on
    port: u16,
    /// Read/write dispatcher threads
    rw_threads: usize,
    /// Minimum packet workers
    min_workers: usize,
    /// Maximum packet workers
    max_workers: usize,
    /// Exit with the restart code on deadlock
    deadlock_restart: bool,
}

impl Default for Config {
    fn default() -> Self {
        let pool = PacketProcessorConfig::default();
        Self {
            host: None,
            port: gsnet::DEFAULT_PORT,
            rw_threads: 0,
            min_workers: pool.min_threads,
            max_workers: pool.max_threads,
            deadlock_restart: false,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    config.host = Some(parse_value(&args, i, "--host", "invalid IP address"));
                    i += 2;
                }
                "--port" | "-p" => {
                    config.port = parse_value(&args, i, "--port", "invalid port number");
                    i += 2;
                }
                "--rw-threads" => {
                    config.rw_threads = parse_value(&args, i, "--rw-threads", "invalid thread count");
                    i += 2;
                }
                "--min-workers" => {
                    config.min_workers = parse_value(&args, i, "--min-workers", "invalid worker count");
                    i += 2;
                }
                "--max-workers" => {
                    config.max_workers = parse_value(&args, i, "--max-workers", "invalid worker count");
                    i += 2;
                }
                "--deadlock-restart" => {
                    config.deadlock_restart = true;
                    i += 1;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("gsnet version {}", gsnet::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }

    /// Returns the bind address
    fn bind_address(&self) -> String {
        match self.host {
            Some(host) => SocketAddr::new(host, self.port).to_string(),
            None => format!("*:{}", self.port),
        }
    }
}

/// Parses the value following the flag at `args[i]`, exiting on error
fn parse_value<T: std::str::FromStr>(args: &[String], i: usize, flag: &str, invalid: &str) -> T {
    let Some(raw) = args.get(i + 1) else {
        eprintln!("Error: {} requires a value", flag);
        std::process::exit(1);
    };
    raw.parse().unwrap_or_else(|_| {
        eprintln!("Error: {}", invalid);
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
gsnet - Framed Echo Server

USAGE:
    gsnet [OPTIONS]

OPTIONS:
    -h, --host <HOST>          Address to bind to (default: all interfaces)
    -p, --port <PORT>          Port to listen on (default: 7777)
        --rw-threads <N>       Read/write dispatchers, 0 = one combined (default: 0)
        --min-workers <N>      Minimum packet workers (default: 4)
        --max-workers <N>      Maximum packet workers (default: 8)
        --deadlock-restart     Exit with code 2 when a deadlock is detected
    -v, --version              Print version information
        --help                 Print this help message

ENVIRONMENT:
    RUST_LOG                   Log filter (default: info)

PROTOCOL:
    Every frame starts with a 2-byte little-endian length that includes
    the header itself. Each frame sent is echoed back unchanged.
"#
    );
}

fn print_banner(config: &Config) {
    println!(
        r#"
gsnet v{} - Framed Echo Server
──────────────────────────────────────────────────────────────
Listening on {}
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        gsnet::VERSION,
        config.bind_address()
    );
}

/// Responses waiting for the write path
type Outbox = Arc<Mutex<VecDeque<Bytes>>>;

/// One received frame to echo back.
struct EchoPacket {
    conn: Arc<Connection>,
    outbox: Outbox,
    payload: Bytes,
}

impl Packet for EchoPacket {
    type Target = Connection;

    fn target(&self) -> &Arc<Connection> {
        &self.conn
    }

    fn run(self) {
        if self.conn.is_closed() {
            return;
        }
        self.outbox.lock().push_back(self.payload);
        if let Err(e) = self.conn.enable_write_interest() {
            debug!(client = %self.conn.peer_addr(), error = %e, "Cannot schedule echo");
        }
    }
}

struct EchoHandler {
    processor: Arc<PacketProcessor<EchoPacket>>,
    outbox: Outbox,
}

impl ConnectionHandler for EchoHandler {
    fn initialized(&self, conn: &Arc<Connection>) {
        info!(client = %conn.peer_addr(), "Client connected");
    }

    fn process_data(&self, conn: &Arc<Connection>, data: Bytes) -> bool {
        self.processor.execute_packet(EchoPacket {
            conn: Arc::clone(conn),
            outbox: Arc::clone(&self.outbox),
            payload: data,
        });
        true
    }

    fn write_data(&self, conn: &Arc<Connection>, buf: &mut BytesMut) -> bool {
        let mut outbox = self.outbox.lock();
        let Some(payload) = outbox.pop_front() else {
            return false;
        };
        match write_frame(buf, &payload) {
            Ok(()) => true,
            Err(e) => {
                warn!(client = %conn.peer_addr(), error = %e, "Dropping oversized echo");
                !outbox.is_empty()
            }
        }
    }

    fn on_disconnect(&self, conn: &Arc<Connection>) {
        info!(client = %conn.peer_addr(), "Client disconnected");
    }

    fn on_server_close(&self, conn: &Arc<Connection>) {
        self.outbox
            .lock()
            .push_back(Bytes::from_static(b"server shutting down"));
        conn.close(false);
    }
}

struct EchoFactory {
    processor: Arc<PacketProcessor<EchoPacket>>,
}

impl ConnectionFactory for EchoFactory {
    fn create(
        &self,
        _stream: &mio::net::TcpStream,
        _peer: SocketAddr,
        _dispatcher: &Dispatcher,
    ) -> Option<Box<dyn ConnectionHandler>> {
        Some(Box::new(EchoHandler {
            processor: Arc::clone(&self.processor),
            outbox: Arc::new(Mutex::new(VecDeque::new())),
        }))
    }
}

fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_names(true)
        .init();

    print_banner(&config);

    // Shared scheduler and deadlock monitor
    let pool = ThreadPoolManager::new(&ThreadPoolConfig {
        deadlock: DeadlockConfig {
            policy: if config.deadlock_restart {
                DeadlockPolicy::Restart
            } else {
                DeadlockPolicy::LogOnly
            },
            ..Default::default()
        },
        ..Default::default()
    })?;

    let processor = Arc::new(PacketProcessor::new(PacketProcessorConfig {
        min_threads: config.min_workers,
        max_threads: config.max_workers,
        ..Default::default()
    })?);

    let endpoint = ServerCfg::new(
        config.host,
        config.port,
        "echo",
        Arc::new(EchoFactory {
            processor: Arc::clone(&processor),
        }),
    );
    let server = NioServer::new(
        vec![endpoint],
        NioConfig {
            read_write_threads: config.rw_threads,
            ..Default::default()
        },
        Arc::clone(&pool),
    )?;
    server.connect()?;

    let stats = Arc::clone(server.stats());
    let reporter = pool.schedule_at_fixed_rate(
        move || {
            info!(
                active = stats.active_connections.load(Ordering::Relaxed),
                accepted = stats.connections_accepted.load(Ordering::Relaxed),
                frames = stats.frames_processed.load(Ordering::Relaxed),
                violations = stats.protocol_violations.load(Ordering::Relaxed),
                "Connection stats"
            );
        },
        STATS_INTERVAL,
        STATS_INTERVAL,
    );

    // Wait for Ctrl+C
    pool.handle().block_on(tokio::signal::ctrl_c())?;
    info!("Shutdown signal received, stopping server...");

    if let Some(reporter) = reporter {
        reporter.cancel();
    }
    server.shutdown();
    processor.shutdown();
    pool.shutdown();

    info!("Server shutdown complete");
    Ok(())
}
