//! Relay configuration.
//!
//! Everything is read from `STRAIT_*` environment variables; only the backend
//! list is required.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use strait_balancer::{BackendInfo, StrategyKind, DEFAULT_CONNECT_TIMEOUT};

use crate::proxy::{IdleConfig, DEFAULT_MAX_CONNECTIONS, DEFAULT_REPLY_TIMEOUT};

/// Which protocol the relay serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Tcp,
    Udp,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => bail!("unknown mode '{other}' (expected tcp or udp)"),
        }
    }
}

/// Relay configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP or UDP relaying.
    pub mode: Mode,

    /// Address the listener binds to.
    pub listen_addr: SocketAddr,

    /// Backends to balance over, each with the configured connect timeout.
    pub backends: Vec<BackendInfo>,

    /// Balancing strategy.
    pub strategy: StrategyKind,

    /// Upper bound for dialing a backend.
    pub connect_timeout: Duration,

    /// Maximum concurrent TCP sessions.
    pub max_connections: usize,

    /// Idle probing of client connections.
    pub idle: IdleConfig,

    /// Runtime worker threads.
    pub worker_threads: usize,

    /// Prefer the native transport where the platform has one.
    pub native_transport: bool,

    /// Global write limit in bytes per second, 0 for unlimited.
    pub traffic_write_limit: u64,

    /// Global read limit in bytes per second, 0 for unlimited.
    pub traffic_read_limit: u64,

    /// How long an ephemeral datagram socket waits for the backend's reply.
    pub udp_reply_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mode = lookup("STRAIT_MODE")
            .map(|v| v.parse::<Mode>())
            .transpose()
            .context("STRAIT_MODE must be tcp or udp.")?
            .unwrap_or(Mode::Tcp);

        let listen_addr = lookup("STRAIT_LISTEN")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("STRAIT_LISTEN must be a socket address (example: 0.0.0.0:8080).")?;

        let connect_timeout_ms: u64 = parse_opt(&lookup, "STRAIT_CONNECT_TIMEOUT_MS")
            .context("STRAIT_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT.as_millis() as u64);
        let connect_timeout = Duration::from_millis(connect_timeout_ms.max(1));

        let backends_raw = lookup("STRAIT_BACKENDS")
            .context("Missing backends. Set STRAIT_BACKENDS (example: web-1=10.0.0.1:80,web-2=10.0.0.2:80).")?;
        let backends = parse_backends(&backends_raw, connect_timeout)?;

        let strategy = lookup("STRAIT_STRATEGY")
            .map(|v| v.parse::<StrategyKind>())
            .transpose()
            .context("STRAIT_STRATEGY must be round_robin, random or least_connections.")?
            .unwrap_or(StrategyKind::RoundRobin);

        let max_connections: usize = parse_opt(&lookup, "STRAIT_MAX_CONNECTIONS")
            .context("STRAIT_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let reader_idle = parse_opt::<u64, _>(&lookup, "STRAIT_READ_IDLE_SECS")
            .context("STRAIT_READ_IDLE_SECS must be an integer (seconds).")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let writer_idle = parse_opt::<u64, _>(&lookup, "STRAIT_WRITE_IDLE_SECS")
            .context("STRAIT_WRITE_IDLE_SECS must be an integer (seconds).")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let all_idle = parse_opt::<u64, _>(&lookup, "STRAIT_ALL_IDLE_SECS")
            .context("STRAIT_ALL_IDLE_SECS must be an integer (seconds).")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let worker_threads: usize = parse_opt(&lookup, "STRAIT_WORKER_THREADS")
            .context("STRAIT_WORKER_THREADS must be an integer.")?
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1);

        let native_transport = lookup("STRAIT_NATIVE_TRANSPORT")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(true);

        let traffic_write_limit: u64 = parse_opt(&lookup, "STRAIT_TRAFFIC_WRITE_LIMIT")
            .context("STRAIT_TRAFFIC_WRITE_LIMIT must be an integer (bytes per second).")?
            .unwrap_or(0);
        let traffic_read_limit: u64 = parse_opt(&lookup, "STRAIT_TRAFFIC_READ_LIMIT")
            .context("STRAIT_TRAFFIC_READ_LIMIT must be an integer (bytes per second).")?
            .unwrap_or(0);

        let udp_reply_timeout_ms: u64 = parse_opt(&lookup, "STRAIT_UDP_REPLY_TIMEOUT_MS")
            .context("STRAIT_UDP_REPLY_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(DEFAULT_REPLY_TIMEOUT.as_millis() as u64);
        let udp_reply_timeout = Duration::from_millis(udp_reply_timeout_ms.max(1));

        let log_level = lookup("STRAIT_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            mode,
            listen_addr,
            backends,
            strategy,
            connect_timeout,
            max_connections,
            idle: IdleConfig {
                reader_idle,
                writer_idle,
                all_idle,
            },
            worker_threads,
            native_transport,
            traffic_write_limit,
            traffic_read_limit,
            udp_reply_timeout,
            log_level,
        })
    }
}

fn parse_opt<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    Ok(lookup(key).map(|v| v.trim().parse()).transpose()?)
}

/// Parse a comma-separated backend list, applying `connect_timeout` to each.
fn parse_backends(raw: &str, connect_timeout: Duration) -> Result<Vec<BackendInfo>> {
    let backends = raw
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| -> Result<BackendInfo> {
            let mut backend: BackendInfo = entry
                .parse()
                .with_context(|| format!("STRAIT_BACKENDS entry '{entry}' is invalid."))?;
            backend.connect_timeout = connect_timeout;
            Ok(backend)
        })
        .collect::<Result<Vec<_>>>()?;

    if backends.is_empty() {
        bail!("STRAIT_BACKENDS must name at least one backend.");
    }
    Ok(backends)
}
