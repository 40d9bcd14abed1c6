//! TCP and UDP listeners.
//!
//! The TCP [`Listener`] accepts client connections, selects a backend for
//! each one and hands the pair to a [`TcpRelay`] task. The
//! [`DatagramListener`] binds the client-facing datagram socket and drives an
//! [`InboundDatagramRelay`] on it.
//!
//! Connection-level limits:
//! - at most `max_connections` relayed sessions at once, extra clients are dropped
//! - a client whose backend cannot be selected is closed without relaying a byte

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strait_balancer::BalancingStrategy;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use super::error::RelayError;
use super::idle::IdleConfig;
use super::lifecycle::DatagramHandle;
use super::shaper::TrafficShaper;
use super::tcp::TcpRelay;
use super::transport::{self, TransportKind};
use super::udp::{DatagramStats, InboundDatagramRelay, DEFAULT_REPLY_TIMEOUT};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for a TCP listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Idle probing of client connections.
    pub idle: IdleConfig,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle: IdleConfig::default(),
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Connections dropped because no backend could be selected.
    pub selection_failures: AtomicU64,
    /// Backend connection successes.
    pub backend_connected: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Bytes relayed to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed from backends.
    pub bytes_from_backend: AtomicU64,
}

/// A TCP listener for the relay.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// Backend selection.
    strategy: Arc<dyn BalancingStrategy>,
    /// Session relay shared by every connection.
    relay: TcpRelay,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Create a new listener.
    pub async fn bind(
        config: ListenerConfig,
        strategy: Arc<dyn BalancingStrategy>,
        transport: TransportKind,
    ) -> io::Result<Self> {
        let listener = transport::bind_tcp_listener(transport, config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            transport = ?transport,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            relay: TcpRelay::new(Arc::clone(&strategy), transport, config.idle),
            listener,
            config,
            strategy,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(
            bind_addr = %local_addr,
            backends = self.strategy.backends().len(),
            idle_flush = self.config.idle.is_enabled(),
            "Listener started"
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    // Try to acquire a permit
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            listener.handle_connection(stream, peer_addr).await;

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle a single connection.
    async fn handle_connection(&self, client: TcpStream, peer_addr: SocketAddr) {
        let key = peer_addr.ip().to_string();

        let Some(backend) = self.strategy.select_backend(&key) else {
            self.stats.selection_failures.fetch_add(1, Ordering::Relaxed);
            error!(peer_addr = %peer_addr, error = %RelayError::NoBackend, "All down?");
            // Dropping the stream closes the client.
            return;
        };

        debug!(backend = %backend, "Backend selected");

        let summary = self.relay.run(client, backend).await;

        if summary.connected {
            self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.stats
            .bytes_to_backend
            .fetch_add(summary.bytes_to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(summary.bytes_from_backend, Ordering::Relaxed);

        debug!(
            backend = %summary.backend,
            bytes_to_backend = summary.bytes_to_backend,
            bytes_from_backend = summary.bytes_from_backend,
            final_state = ?summary.final_state,
            "Session finished"
        );
    }
}

/// Configuration for a UDP listener.
#[derive(Debug, Clone)]
pub struct DatagramListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// How long each ephemeral socket waits for a backend reply.
    pub reply_timeout: Duration,
}

impl DatagramListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }
}

/// A UDP listener for the relay.
pub struct DatagramListener {
    relay: InboundDatagramRelay,
}

impl DatagramListener {
    /// Bind the client-facing datagram socket.
    pub async fn bind(
        config: DatagramListenerConfig,
        strategy: Arc<dyn BalancingStrategy>,
        shaper: Option<Arc<dyn TrafficShaper>>,
        transport: TransportKind,
    ) -> io::Result<Self> {
        let socket = transport::bind_udp(transport, config.bind_addr).await?;

        info!(
            bind_addr = %socket.local_addr()?,
            transport = ?transport,
            shaped = shaper.is_some(),
            "Datagram listener bound"
        );

        Ok(Self {
            relay: InboundDatagramRelay::new(
                DatagramHandle::new(socket),
                strategy,
                shaper,
                transport,
                config.reply_timeout,
            ),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.relay.handle().local_addr()
    }

    /// Get relay statistics.
    pub fn stats(&self) -> &DatagramStats {
        self.relay.stats()
    }

    /// Stop receiving.
    pub fn close(&self) {
        self.relay.handle().close();
    }

    /// Relay datagrams until the client-facing socket is closed.
    pub async fn run(&self) -> Result<(), RelayError> {
        info!(bind_addr = %self.local_addr()?, "Datagram listener started");
        let result = self.relay.run().await;
        info!("Datagram listener stopped");
        result
    }
}
