//! UDP relay.
//!
//! Stateless per datagram: every inbound datagram selects a backend, gets a
//! fresh ephemeral socket, is forwarded, and at most one reply from that
//! socket is relayed back to the original sender before the socket is
//! released. There is no session table keyed by client address.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use strait_balancer::{BackendInfo, BalancingStrategy};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error};

use super::error::{report, RelayError};
use super::lifecycle::DatagramHandle;
use super::shaper::TrafficShaper;
use super::transport::{self, TransportKind};

/// Largest datagram the relay accepts.
pub const MAX_DATAGRAM: usize = 65_535;

/// Default time an ephemeral socket waits for the backend's reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one relay unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramOutcome {
    /// The backend replied and `n` bytes were relayed to the sender.
    Relayed(usize),
    /// Nothing came back before the reply timeout.
    NoReply,
}

/// Counters for the datagram relay.
#[derive(Debug, Default)]
pub struct DatagramStats {
    /// Datagrams received on the client-facing socket.
    pub datagrams_received: AtomicU64,
    /// Datagrams forwarded to a backend.
    pub datagrams_forwarded: AtomicU64,
    /// Replies relayed back to clients.
    pub replies_relayed: AtomicU64,
    /// Datagrams dropped because no backend was available.
    pub selection_failures: AtomicU64,
    /// Bind or send failures towards a backend.
    pub forward_failures: AtomicU64,
    /// Ephemeral sockets currently open.
    pub ephemeral_open: AtomicUsize,
}

/// Ephemeral outbound socket, counted while alive.
struct EphemeralSocket {
    socket: UdpSocket,
    stats: Arc<DatagramStats>,
}

impl EphemeralSocket {
    fn new(socket: UdpSocket, stats: Arc<DatagramStats>) -> Self {
        stats.ephemeral_open.fetch_add(1, Ordering::Relaxed);
        Self { socket, stats }
    }
}

impl Drop for EphemeralSocket {
    fn drop(&mut self) {
        self.stats.ephemeral_open.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Client-facing half: receives datagrams and dispatches one relay unit each.
pub struct InboundDatagramRelay {
    client: DatagramHandle,
    strategy: Arc<dyn BalancingStrategy>,
    shaper: Option<Arc<dyn TrafficShaper>>,
    transport: TransportKind,
    reply_timeout: Duration,
    stats: Arc<DatagramStats>,
}

impl InboundDatagramRelay {
    pub fn new(
        client: DatagramHandle,
        strategy: Arc<dyn BalancingStrategy>,
        shaper: Option<Arc<dyn TrafficShaper>>,
        transport: TransportKind,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            client,
            strategy,
            shaper,
            transport,
            reply_timeout,
            stats: Arc::new(DatagramStats::default()),
        }
    }

    pub fn handle(&self) -> &DatagramHandle {
        &self.client
    }

    pub fn stats(&self) -> &Arc<DatagramStats> {
        &self.stats
    }

    /// Receive until the client-facing socket is closed.
    pub async fn run(&self) -> Result<(), RelayError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                biased;
                _ = self.client.closed() => return Ok(()),
                recv = self.client.socket().recv_from(&mut buf) => match recv {
                    Ok((len, sender)) => {
                        self.on_datagram(&buf[..len], sender);
                    }
                    Err(e) => {
                        self.client.close();
                        let err = RelayError::from(e);
                        report(&err);
                        return Err(err);
                    }
                },
            }
        }
    }

    /// Dispatch one datagram. Returns the spawned relay unit, if any.
    pub fn on_datagram(&self, payload: &[u8], sender: SocketAddr) -> Option<JoinHandle<()>> {
        self.stats.datagrams_received.fetch_add(1, Ordering::Relaxed);

        let Some(backend) = self.strategy.select_backend("") else {
            self.stats.selection_failures.fetch_add(1, Ordering::Relaxed);
            self.client.close();
            error!(sender = %sender, error = %RelayError::NoBackend, "All down?");
            return None;
        };

        // The receive buffer is reused for the next datagram.
        let payload = Bytes::copy_from_slice(payload);

        let unit = RelayUnit {
            client: self.client.clone(),
            sender,
            backend,
            shaper: self.shaper.clone(),
            transport: self.transport,
            reply_timeout: self.reply_timeout,
            stats: Arc::clone(&self.stats),
        };

        Some(tokio::spawn(async move {
            match unit.run(payload).await {
                Ok(outcome) => debug!(sender = %sender, ?outcome, "Datagram relayed"),
                Err(e) => report(&e),
            }
        }))
    }
}

/// Everything one datagram needs to be forwarded.
struct RelayUnit {
    client: DatagramHandle,
    sender: SocketAddr,
    backend: Arc<BackendInfo>,
    shaper: Option<Arc<dyn TrafficShaper>>,
    transport: TransportKind,
    reply_timeout: Duration,
    stats: Arc<DatagramStats>,
}

impl RelayUnit {
    async fn run(self, payload: Bytes) -> Result<DatagramOutcome, RelayError> {
        let outbound = match self.open().await {
            Ok(outbound) => outbound,
            Err(e) => {
                self.stats.forward_failures.fetch_add(1, Ordering::Relaxed);
                self.client.close();
                return Err(e);
            }
        };

        if let Err(e) = outbound.forward(&payload).await {
            self.stats.forward_failures.fetch_add(1, Ordering::Relaxed);
            self.client.close();
            return Err(e);
        }
        self.stats.datagrams_forwarded.fetch_add(1, Ordering::Relaxed);

        let outcome = outbound.relay_reply(self.reply_timeout).await?;
        if let DatagramOutcome::Relayed(_) = outcome {
            self.stats.replies_relayed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(outcome)
    }

    /// Bind an ephemeral socket towards the selected backend.
    async fn open(&self) -> Result<OutboundDatagramRelay, RelayError> {
        let target = transport::resolve_backend(&self.backend).await?;
        let socket = transport::bind_udp(self.transport, transport::ephemeral_addr(target)).await?;
        socket.connect(target).await?;

        Ok(OutboundDatagramRelay {
            socket: EphemeralSocket::new(socket, Arc::clone(&self.stats)),
            client: self.client.clone(),
            sender: self.sender,
            backend: Arc::clone(&self.backend),
            shaper: self.shaper.clone(),
        })
    }
}

/// Backend-facing half, bound to one ephemeral socket.
pub struct OutboundDatagramRelay {
    socket: EphemeralSocket,
    client: DatagramHandle,
    sender: SocketAddr,
    backend: Arc<BackendInfo>,
    shaper: Option<Arc<dyn TrafficShaper>>,
}

impl OutboundDatagramRelay {
    /// Send the copied payload to the backend through the shaping stage.
    async fn forward(&self, payload: &[u8]) -> Result<(), RelayError> {
        if let Some(shaper) = &self.shaper {
            shaper.shape_write(payload.len()).await;
        }
        self.socket.socket.send(payload).await?;

        debug!(
            sender = %self.sender,
            backend = %self.backend,
            bytes = payload.len(),
            "Datagram forwarded"
        );
        Ok(())
    }

    /// Wait for the single expected reply and relay it to the original sender.
    /// The ephemeral socket is released when `self` drops.
    async fn relay_reply(self, reply_timeout: Duration) -> Result<DatagramOutcome, RelayError> {
        let reply = match timeout(reply_timeout, self.recv_reply()).await {
            Ok(result) => result?,
            Err(_) => return Ok(DatagramOutcome::NoReply),
        };

        if let Some(shaper) = &self.shaper {
            shaper.shape_read(reply.len()).await;
        }

        self.client.send_to(&reply, self.sender).await?;
        Ok(DatagramOutcome::Relayed(reply.len()))
    }

    /// Receive one datagram. The buffer only exists once the socket is readable.
    async fn recv_reply(&self) -> io::Result<Vec<u8>> {
        let socket = &self.socket.socket;
        loop {
            socket.readable().await?;

            let mut buf = vec![0u8; MAX_DATAGRAM];
            match socket.try_recv(&mut buf) {
                Ok(len) => {
                    buf.truncate(len);
                    return Ok(buf);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
