//! Backend identity and load balancing.
//!
//! This library provides:
//! - `BackendInfo`, the immutable identity of an upstream server
//! - The `BalancingStrategy` interface consumed by the relay
//! - Round-robin, random and least-connections strategies
//!
//! Strategies are shared across every relay task, so each one serializes
//! its own mutations internally and is handed out as
//! `Arc<dyn BalancingStrategy>`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

mod strategy;

pub use strategy::{LeastConnectionsStrategy, RandomStrategy, RoundRobinStrategy};

/// Default connect timeout for backend connections.
///
/// No initial connection should take longer than this.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(4);

/// Balancer errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BalancerError {
    /// Backend entry could not be parsed.
    #[error("invalid backend entry: {0}")]
    InvalidBackend(String),

    /// Backend port is missing or out of range.
    #[error("invalid backend port in '{0}' (must be between 1 and 65535)")]
    InvalidPort(String),

    /// Unknown strategy name.
    #[error("unknown balancing strategy: {0}")]
    UnknownStrategy(String),
}

// ============================================================================
// Backend identity
// ============================================================================

/// Immutable identity of a backend server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendInfo {
    /// Name used in diagnostics.
    pub name: String,
    /// Hostname or IP literal.
    pub host: String,
    /// TCP/UDP port.
    pub port: u16,
    /// Upper bound for dialing this backend.
    pub connect_timeout: Duration,
}

impl BackendInfo {
    /// Create a backend with the default connect timeout.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self::with_timeout(name, host, port, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Create a backend with a custom connect timeout.
    pub fn with_timeout(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            connect_timeout,
        }
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for BackendInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address(), self.name)
    }
}

impl FromStr for BackendInfo {
    type Err = BalancerError;

    /// Parse `name=host:port` or `host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (name, addr) = match s.split_once('=') {
            Some((name, addr)) => (name.trim(), addr.trim()),
            None => ("", s),
        };

        let Some((host, port)) = addr.rsplit_once(':') else {
            return Err(BalancerError::InvalidBackend(s.to_string()));
        };

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(BalancerError::InvalidBackend(s.to_string()));
        }

        let port = match port.parse::<u16>() {
            Ok(0) | Err(_) => return Err(BalancerError::InvalidPort(s.to_string())),
            Ok(port) => port,
        };

        let name = if name.is_empty() { addr } else { name };

        Ok(Self::new(name, host, port))
    }
}

// ============================================================================
// Strategy interface
// ============================================================================

/// Policy choosing a backend per connection or per datagram.
///
/// Implementations are shared between all relay tasks and must serialize
/// their own state changes.
pub trait BalancingStrategy: Send + Sync {
    /// Choose a backend for `key`, or `None` if every backend is unavailable.
    fn select_backend(&self, key: &str) -> Option<Arc<BackendInfo>>;

    /// Health signal: a session to `backend` has terminated.
    fn disconnected_from(&self, backend: &BackendInfo);

    /// Every backend known to the strategy.
    fn backends(&self) -> Vec<Arc<BackendInfo>>;
}

/// Available balancing strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    RoundRobin,
    Random,
    LeastConnections,
}

impl FromStr for StrategyKind {
    type Err = BalancerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "round_robin" | "round-robin" | "rr" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "least_connections" | "least-connections" | "lc" => Ok(Self::LeastConnections),
            _ => Err(BalancerError::UnknownStrategy(s.to_string())),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::LeastConnections => "least_connections",
        };
        f.write_str(name)
    }
}

/// Build a shared strategy over `backends`.
pub fn build_strategy(
    kind: StrategyKind,
    backends: Vec<BackendInfo>,
) -> Arc<dyn BalancingStrategy> {
    match kind {
        StrategyKind::RoundRobin => Arc::new(RoundRobinStrategy::new(backends)),
        StrategyKind::Random => Arc::new(RandomStrategy::new(backends)),
        StrategyKind::LeastConnections => Arc::new(LeastConnectionsStrategy::new(backends)),
    }
}
