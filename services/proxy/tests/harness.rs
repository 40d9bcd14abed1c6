//! Test harness for relay integration tests.
//!
//! Provides helpers to spawn TCP/UDP backends, relay listeners, and a
//! strategy that records health signals.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strait_balancer::{BackendInfo, BalancingStrategy};
use strait_proxy::proxy::{
    DatagramListener, DatagramListenerConfig, IdleConfig, Listener, ListenerConfig, SessionSummary,
    TcpRelay, TrafficShaper, TransportKind,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `check` until it holds or `TEST_TIMEOUT` elapses.
#[allow(dead_code)]
pub async fn wait_until<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ============================================================================
// Backends
// ============================================================================

#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub closed: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TcpEchoBackend {
    /// Echo every chunk back unchanged.
    pub async fn spawn() -> io::Result<Self> {
        Self::spawn_with(|data| data.to_vec(), Duration::ZERO, 8192).await
    }

    /// Answer each chunk with `respond(chunk)`, optionally sleeping before
    /// every read of at most `read_size` bytes.
    pub async fn spawn_with<F>(respond: F, read_delay: Duration, read_size: usize) -> io::Result<Self>
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let closed = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));
        let respond = Arc::new(respond);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let closed_clone = Arc::clone(&closed);
        let bytes_clone = Arc::clone(&bytes_received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let bytes = Arc::clone(&bytes_clone);
                                let closed = Arc::clone(&closed_clone);
                                let respond = Arc::clone(&respond);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; read_size];
                                    loop {
                                        if !read_delay.is_zero() {
                                            tokio::time::sleep(read_delay).await;
                                        }
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                bytes.fetch_add(n as u64, Ordering::Relaxed);
                                                let reply = respond(&buf[..n]);
                                                if !reply.is_empty()
                                                    && stream.write_all(&reply).await.is_err()
                                                {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                    closed.fetch_add(1, Ordering::Relaxed);
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            closed,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn info(&self, name: &str) -> BackendInfo {
        BackendInfo::new(name, self.addr.ip().to_string(), self.addr.port())
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn closed_count(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Loopback listener that never accepts and whose accept backlog is full,
/// so further connection attempts hang until the dialer gives up.
#[allow(dead_code)]
pub struct StalledBackend {
    pub addr: SocketAddr,
    _listener: TcpListener,
    _queued: Vec<TcpStream>,
}

#[allow(dead_code)]
impl StalledBackend {
    pub async fn spawn() -> io::Result<Self> {
        let socket = TcpSocket::new_v4()?;
        socket.bind("127.0.0.1:0".parse().unwrap())?;
        let listener = socket.listen(1)?;
        let addr = listener.local_addr()?;

        let mut queued = Vec::new();
        for _ in 0..64 {
            match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
                Ok(stream) => queued.push(stream?),
                // The kernel is dropping SYNs now.
                Err(_) => {
                    return Ok(Self {
                        addr,
                        _listener: listener,
                        _queued: queued,
                    })
                }
            }
        }
        Err(io::Error::other("accept backlog never filled"))
    }

    pub fn info(&self, name: &str, connect_timeout: Duration) -> BackendInfo {
        BackendInfo::with_timeout(name, self.addr.ip().to_string(), self.addr.port(), connect_timeout)
    }
}

#[allow(dead_code)]
pub struct UdpBackend {
    pub addr: SocketAddr,
    pub received: Arc<Mutex<Vec<Vec<u8>>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl UdpBackend {
    /// Answer every datagram with `reply`, sent back to its source.
    pub async fn spawn(reply: &'static [u8]) -> io::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let received_clone = Arc::clone(&received);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 65_535];
            loop {
                tokio::select! {
                    recv = socket.recv_from(&mut buf) => {
                        let Ok((n, from)) = recv else { break };
                        received_clone.lock().unwrap().push(buf[..n].to_vec());
                        let _ = socket.send_to(reply, from).await;
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn info(&self, name: &str) -> BackendInfo {
        BackendInfo::new(name, self.addr.ip().to_string(), self.addr.port())
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for UdpBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

// ============================================================================
// Strategy
// ============================================================================

/// Round-robin over fixed backends, recording every health signal.
#[allow(dead_code)]
#[derive(Default)]
pub struct RecordingStrategy {
    backends: Vec<Arc<BackendInfo>>,
    next: AtomicUsize,
    selections: AtomicUsize,
    disconnects: Mutex<HashMap<String, usize>>,
}

#[allow(dead_code)]
impl RecordingStrategy {
    pub fn new(backends: Vec<BackendInfo>) -> Arc<Self> {
        Arc::new(Self {
            backends: backends.into_iter().map(Arc::new).collect(),
            ..Default::default()
        })
    }

    pub fn selections(&self) -> usize {
        self.selections.load(Ordering::Relaxed)
    }

    pub fn disconnects(&self, name: &str) -> usize {
        self.disconnects
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

impl BalancingStrategy for RecordingStrategy {
    fn select_backend(&self, _key: &str) -> Option<Arc<BackendInfo>> {
        if self.backends.is_empty() {
            return None;
        }
        self.selections.fetch_add(1, Ordering::Relaxed);
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.backends.len();
        Some(Arc::clone(&self.backends[index]))
    }

    fn disconnected_from(&self, backend: &BackendInfo) {
        *self
            .disconnects
            .lock()
            .unwrap()
            .entry(backend.name.clone())
            .or_default() += 1;
    }

    fn backends(&self) -> Vec<Arc<BackendInfo>> {
        self.backends.clone()
    }
}

// ============================================================================
// Relays
// ============================================================================

#[allow(dead_code)]
pub struct RelayHandle {
    pub listen_addr: SocketAddr,
    pub listener: Arc<Listener>,
    task: JoinHandle<()>,
}

#[allow(dead_code)]
impl RelayHandle {
    pub async fn spawn(strategy: Arc<dyn BalancingStrategy>) -> io::Result<Self> {
        Self::spawn_with_idle(strategy, IdleConfig::default()).await
    }

    pub async fn spawn_with_idle(
        strategy: Arc<dyn BalancingStrategy>,
        idle: IdleConfig,
    ) -> io::Result<Self> {
        let mut config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        config.idle = idle;

        let listener = Arc::new(Listener::bind(config, strategy, TransportKind::Portable).await?);
        let listen_addr = listener.local_addr()?;

        let run = Arc::clone(&listener);
        let task = tokio::spawn(async move {
            let _ = run.run().await;
        });

        Ok(Self {
            listen_addr,
            listener,
            task,
        })
    }

    pub fn active(&self) -> u64 {
        self.listener.stats().connections_active.load(Ordering::Relaxed)
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[allow(dead_code)]
pub struct DatagramRelayHandle {
    pub listen_addr: SocketAddr,
    pub listener: Arc<DatagramListener>,
    pub task: JoinHandle<()>,
}

#[allow(dead_code)]
impl DatagramRelayHandle {
    pub async fn spawn(
        strategy: Arc<dyn BalancingStrategy>,
        shaper: Option<Arc<dyn TrafficShaper>>,
    ) -> io::Result<Self> {
        let mut config = DatagramListenerConfig::new("127.0.0.1:0".parse().unwrap());
        config.reply_timeout = Duration::from_secs(1);

        let listener = Arc::new(
            DatagramListener::bind(config, strategy, shaper, TransportKind::Portable).await?,
        );
        let listen_addr = listener.local_addr()?;

        let run = Arc::clone(&listener);
        let task = tokio::spawn(async move {
            let _ = run.run().await;
        });

        Ok(Self {
            listen_addr,
            listener,
            task,
        })
    }
}

impl Drop for DatagramRelayHandle {
    fn drop(&mut self) {
        self.listener.close();
    }
}

/// Relay one client connection to `backend` directly, bypassing the listener.
/// Returns the client end and the session task.
#[allow(dead_code)]
pub async fn spawn_session(
    relay: TcpRelay,
    backend: BackendInfo,
) -> io::Result<(TcpStream, JoinHandle<SessionSummary>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let (accepted, _) = accepted?;

    let session = tokio::spawn(async move { relay.run(accepted, Arc::new(backend)).await });
    Ok((client?, session))
}
