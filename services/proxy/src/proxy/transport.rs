//! Socket construction for the relay.
//!
//! The relay never builds sockets directly; it asks for a [`TransportKind`]
//! once at startup and passes it to these helpers for the backend dial, the
//! listeners and every ephemeral datagram socket.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use strait_balancer::BackendInfo;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream, UdpSocket};

use super::error::RelayError;

/// Listen backlog for natively built listeners.
const LISTEN_BACKLOG: u32 = 1024;

/// Concrete socket implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Sockets built option-by-option before they are handed to the runtime.
    Native,
    /// Runtime defaults only.
    Portable,
}

/// Pick the transport for this platform.
pub fn resolve_transport(prefer_native: bool) -> TransportKind {
    if prefer_native && cfg!(target_os = "linux") {
        TransportKind::Native
    } else {
        TransportKind::Portable
    }
}

/// Resolve a backend's host to its first socket address.
pub async fn resolve_backend(backend: &BackendInfo) -> Result<SocketAddr, RelayError> {
    let mut addrs = lookup_host((backend.host.as_str(), backend.port)).await?;
    addrs.next().ok_or_else(|| RelayError::Resolve {
        backend: backend.to_string(),
    })
}

/// Wildcard address with an OS-assigned port in the same family as `target`.
pub fn ephemeral_addr(target: SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

/// Dial a TCP connection.
pub async fn dial_tcp(kind: TransportKind, addr: SocketAddr, nodelay: bool) -> io::Result<TcpStream> {
    let stream = match kind {
        TransportKind::Native => {
            let socket = tcp_socket(addr)?;
            socket.set_keepalive(true)?;
            socket.connect(addr).await?
        }
        TransportKind::Portable => TcpStream::connect(addr).await?,
    };
    stream.set_nodelay(nodelay)?;
    Ok(stream)
}

/// Bind a TCP listener.
pub async fn bind_tcp_listener(kind: TransportKind, addr: SocketAddr) -> io::Result<TcpListener> {
    match kind {
        TransportKind::Native => {
            let socket = tcp_socket(addr)?;
            socket.set_reuseaddr(true)?;
            socket.bind(addr)?;
            socket.listen(LISTEN_BACKLOG)
        }
        TransportKind::Portable => TcpListener::bind(addr).await,
    }
}

/// Bind a datagram socket.
pub async fn bind_udp(kind: TransportKind, addr: SocketAddr) -> io::Result<UdpSocket> {
    match kind {
        TransportKind::Native => {
            let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_reuse_address(true)?;
            socket.set_nonblocking(true)?;
            socket.bind(&addr.into())?;
            UdpSocket::from_std(socket.into())
        }
        TransportKind::Portable => UdpSocket::bind(addr).await,
    }
}

fn tcp_socket(addr: SocketAddr) -> io::Result<TcpSocket> {
    match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
}
