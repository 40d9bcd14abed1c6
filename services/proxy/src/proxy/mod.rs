//! L4 relay implementation.
//!
//! This module provides:
//! - TCP and UDP listeners
//! - Per-connection TCP relaying with one-in-flight-write flow control
//! - Stateless per-datagram UDP relaying over ephemeral sockets
//! - Idle probing of client connections
//! - Global traffic shaping for datagram sockets
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> BalancingStrategy -> TcpRelay -> Backend
//!                                              |
//!                              UpstreamSide / DownstreamSide pumps
//!
//! Client -> DatagramListener -> InboundDatagramRelay -> ephemeral socket -> Backend
//!                                                              |
//!                                                  one reply back to the sender
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use strait_balancer::{build_strategy, BackendInfo, StrategyKind};
//! use strait_proxy::{Listener, ListenerConfig, TransportKind};
//!
//! let strategy = build_strategy(StrategyKind::RoundRobin, vec![BackendInfo::new("a", "10.0.0.1", 80)]);
//! let config = ListenerConfig::new("[::]:8080".parse()?);
//! let listener = Listener::bind(config, strategy, TransportKind::Portable).await?;
//! Arc::new(listener).run().await?;
//! ```

mod error;
mod idle;
mod lifecycle;
mod listener;
mod shaper;
mod tcp;
mod transport;
mod udp;

pub use error::RelayError;
pub use idle::{IdleConfig, IdleMonitor, IdleState};
pub use lifecycle::{close, close_on_flush, ConnectionHandle, DatagramHandle};
pub use listener::{
    DatagramListener, DatagramListenerConfig, Listener, ListenerConfig, ListenerStats,
    DEFAULT_MAX_CONNECTIONS,
};
pub use shaper::{GlobalTrafficShaper, TrafficShaper, DEFAULT_CHECK_INTERVAL};
pub use tcp::{SessionState, SessionSummary, TcpRelay};
pub use transport::{
    bind_tcp_listener, bind_udp, dial_tcp, ephemeral_addr, resolve_backend, resolve_transport,
    TransportKind,
};
pub use udp::{
    DatagramOutcome, DatagramStats, InboundDatagramRelay, OutboundDatagramRelay,
    DEFAULT_REPLY_TIMEOUT, MAX_DATAGRAM,
};
