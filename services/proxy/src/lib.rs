pub mod config;
pub mod proxy;

pub use proxy::{
    DatagramListener, DatagramListenerConfig, GlobalTrafficShaper, IdleConfig, Listener,
    ListenerConfig, ListenerStats, RelayError, SessionState, SessionSummary, TcpRelay,
    TrafficShaper, TransportKind,
};
