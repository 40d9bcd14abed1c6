//! TCP relay.
//!
//! One accepted client connection is bridged to one freshly dialed backend
//! connection. Each direction is a pump that reads one chunk, hands it to
//! the peer's writer and waits for that write to complete before reading
//! again, so at most one message per direction is ever in flight. That
//! pairing is the only flow control; there is no buffer threshold.
//!
//! ```text
//!            UpstreamSide                       DownstreamSide
//! client --read--> write --> backend    backend --read--> write --> client
//! ```
//!
//! Session lifecycle:
//!
//! ```text
//! DIALING --connected--> ACTIVE --either side inactive--> CLOSING --> CLOSED
//!    \--dial failed / timed out--------------------------------------^
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use strait_balancer::{BackendInfo, BalancingStrategy};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::error::{report, RelayError};
use super::idle::{IdleConfig, IdleMonitor, IdleState};
use super::lifecycle::{self, ConnectionHandle};
use super::transport::{self, TransportKind};

/// Read buffer reserved before each read request.
const READ_CHUNK: usize = 16 * 1024;

/// Per-session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Dialing = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Dialing,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Whether `self -> to` is a legal transition. Nothing re-enters `Active`.
    pub fn can_transition(self, to: SessionState) -> bool {
        matches!(
            (self, to),
            (Self::Dialing, Self::Active)
                | (Self::Dialing, Self::Closed)
                | (Self::Active, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }
}

/// Session state shared by both sides of a session.
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(SessionState::Dialing as u8))
    }

    fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Apply `to` if legal from the current state.
    fn advance(&self, to: SessionState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                SessionState::from_u8(current)
                    .can_transition(to)
                    .then_some(to as u8)
            })
            .is_ok()
    }
}

/// Outcome of one relayed session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub client: SocketAddr,
    pub backend: Arc<BackendInfo>,
    pub final_state: SessionState,
    /// Whether the backend dial succeeded.
    pub connected: bool,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
    /// High-water mark of unacknowledged writes towards the backend.
    pub max_pending_to_backend: usize,
    /// High-water mark of unacknowledged writes towards the client.
    pub max_pending_to_client: usize,
}

/// Entry point for relaying accepted client connections.
#[derive(Clone)]
pub struct TcpRelay {
    strategy: Arc<dyn BalancingStrategy>,
    transport: TransportKind,
    idle: IdleConfig,
}

impl TcpRelay {
    pub fn new(
        strategy: Arc<dyn BalancingStrategy>,
        transport: TransportKind,
        idle: IdleConfig,
    ) -> Self {
        Self {
            strategy,
            transport,
            idle,
        }
    }

    /// Relay `client` to the already selected `backend` until both sides close.
    pub async fn run(&self, client: TcpStream, backend: Arc<BackendInfo>) -> SessionSummary {
        let client_addr = client
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        let state = StateCell::new();

        // Reads on the client stay disabled until the backend is connected.
        let (client_reader, client_writer) = client.into_split();
        let client_conn = ConnectionHandle::spawn(client_writer, client_addr);

        let mut upstream = UpstreamSide {
            backend_info: Arc::clone(&backend),
            client: client_conn.clone(),
            backend: None,
            strategy: Arc::clone(&self.strategy),
            idle: IdleMonitor::new(self.idle),
            bytes: 0,
            notified: false,
        };

        let Some((backend_reader, backend_conn)) = upstream.on_active(self.transport).await else {
            drop(client_reader);
            state.advance(SessionState::Closed);
            return SessionSummary {
                client: client_addr,
                backend,
                final_state: state.get(),
                connected: false,
                bytes_to_backend: 0,
                bytes_from_backend: 0,
                max_pending_to_backend: 0,
                max_pending_to_client: client_conn.max_pending_writes(),
            };
        };

        state.advance(SessionState::Active);

        let mut downstream = DownstreamSide {
            client: client_conn.clone(),
            backend: backend_conn.clone(),
            bytes: 0,
        };

        tokio::join!(
            upstream.drive(client_reader, &state),
            downstream.drive(backend_reader, &state),
        );

        state.advance(SessionState::Closed);

        SessionSummary {
            client: client_addr,
            backend,
            final_state: state.get(),
            connected: true,
            bytes_to_backend: upstream.bytes,
            bytes_from_backend: downstream.bytes,
            max_pending_to_backend: backend_conn.max_pending_writes(),
            max_pending_to_client: client_conn.max_pending_writes(),
        }
    }
}

/// Client-facing half of a session.
struct UpstreamSide {
    backend_info: Arc<BackendInfo>,
    client: ConnectionHandle,
    /// Set once the dial completes.
    backend: Option<ConnectionHandle>,
    strategy: Arc<dyn BalancingStrategy>,
    idle: IdleMonitor,
    bytes: u64,
    notified: bool,
}

impl UpstreamSide {
    /// Dial the backend. On failure the client is closed right away.
    async fn on_active(
        &mut self,
        transport: TransportKind,
    ) -> Option<(OwnedReadHalf, ConnectionHandle)> {
        match self.dial(transport).await {
            Ok(stream) => {
                let peer = stream
                    .peer_addr()
                    .unwrap_or_else(|_| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
                let (reader, writer) = stream.into_split();
                let backend = ConnectionHandle::spawn(writer, peer);
                self.backend = Some(backend.clone());

                debug!(
                    client = %self.client.peer(),
                    backend = %self.backend_info,
                    "Connected to backend"
                );
                Some((reader, backend))
            }
            Err(e) => {
                warn!(
                    client = %self.client.peer(),
                    backend = %self.backend_info,
                    error = %e,
                    "Backend connection failed"
                );
                lifecycle::close(Some(&self.client));
                self.on_inactive();
                None
            }
        }
    }

    async fn dial(&self, transport: TransportKind) -> Result<TcpStream, RelayError> {
        let connect_timeout = self.backend_info.connect_timeout;
        let attempt = async {
            let addr = transport::resolve_backend(&self.backend_info).await?;
            Ok::<_, RelayError>(transport::dial_tcp(transport, addr, true).await?)
        };

        match timeout(connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::ConnectTimeout {
                backend: self.backend_info.to_string(),
                timeout: connect_timeout,
            }),
        }
    }

    /// Forward one chunk. Returns whether the next read may be issued.
    async fn on_read(&mut self, data: Bytes) -> bool {
        let Some(backend) = self.backend.as_ref().filter(|b| b.is_active()) else {
            // Backend gone or never connected: the chunk is dropped.
            return false;
        };

        let len = data.len() as u64;
        match backend.write(data).await {
            Ok(()) => {
                self.bytes += len;
                true
            }
            Err(e) => {
                debug!(backend = %self.backend_info, error = %e, "Write to backend failed");
                backend.close();
                false
            }
        }
    }

    fn on_idle(&self, state: IdleState) {
        // Wake the connection up; never closes it.
        self.client.flush();
        debug!(client = %self.client.peer(), state = state.name(), "Idle state");
    }

    fn on_fault(&self, err: RelayError) {
        self.client.close_on_flush();
        report(&err);
    }

    /// Client connection is gone: release the backend and tell the strategy, once.
    fn on_inactive(&mut self) {
        lifecycle::close_on_flush(self.backend.as_ref());

        if self.notified {
            return;
        }
        self.notified = true;
        self.strategy.disconnected_from(&self.backend_info);

        debug!(
            client = %self.client.peer(),
            backend = %self.backend_info,
            "Disconnected"
        );
    }

    async fn drive(&mut self, mut reader: OwnedReadHalf, state: &StateCell) {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);

        loop {
            buf.reserve(READ_CHUNK);

            tokio::select! {
                biased;
                _ = self.client.closed() => break,
                idle = self.idle.next_event(&self.client) => self.on_idle(idle),
                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        self.client.close();
                        break;
                    }
                    Ok(_) => {
                        self.client.mark_read();
                        let data = buf.split().freeze();
                        if !self.on_read(data).await {
                            // No further reads; the peer side tears the client down.
                            self.client.closed().await;
                            break;
                        }
                    }
                    Err(e) => {
                        self.on_fault(e.into());
                        break;
                    }
                },
            }
        }

        drop(reader);
        state.advance(SessionState::Closing);
        self.client.closed().await;
        self.on_inactive();
    }
}

/// Backend-facing half of a session; mirrors the upstream discipline.
struct DownstreamSide {
    client: ConnectionHandle,
    backend: ConnectionHandle,
    bytes: u64,
}

impl DownstreamSide {
    async fn on_read(&mut self, data: Bytes) -> bool {
        if !self.client.is_active() {
            return false;
        }

        let len = data.len() as u64;
        match self.client.write(data).await {
            Ok(()) => {
                self.bytes += len;
                true
            }
            Err(e) => {
                debug!(client = %self.client.peer(), error = %e, "Write to client failed");
                self.client.close();
                false
            }
        }
    }

    fn on_fault(&self, err: RelayError) {
        self.backend.close_on_flush();
        report(&err);
    }

    /// Backend connection is gone: let the client drain, then close it.
    fn on_inactive(&self) {
        self.client.close_on_flush();
    }

    async fn drive(&mut self, mut reader: OwnedReadHalf, state: &StateCell) {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);

        loop {
            buf.reserve(READ_CHUNK);

            tokio::select! {
                biased;
                _ = self.backend.closed() => break,
                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        self.backend.close();
                        break;
                    }
                    Ok(_) => {
                        let data = buf.split().freeze();
                        if !self.on_read(data).await {
                            self.backend.closed().await;
                            break;
                        }
                    }
                    Err(e) => {
                        self.on_fault(e.into());
                        break;
                    }
                },
            }
        }

        drop(reader);
        state.advance(SessionState::Closing);
        self.backend.closed().await;
        self.on_inactive();
    }
}
