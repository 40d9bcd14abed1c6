//! Connection lifecycle utilities.
//!
//! Every relayed TCP connection has exactly one writer: a task that owns the
//! write half and processes commands posted to it in order. Anything that
//! wants to write to, flush, or close the connection goes through a
//! [`ConnectionHandle`], which makes cross-connection writes (client side
//! writing into the backend connection and vice versa) plain message sends.
//!
//! Two teardown disciplines are offered:
//! - [`close_on_flush`]: queued writes complete first, then the connection closes
//! - [`close`]: the connection closes immediately, queued writes are discarded

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::trace;

enum Command {
    Write {
        data: Bytes,
        done: oneshot::Sender<io::Result<()>>,
    },
    CloseOnFlush,
}

struct Shared {
    peer: SocketAddr,
    active: AtomicBool,
    closed: watch::Sender<bool>,
    pending: AtomicUsize,
    max_pending: AtomicUsize,
    last_read: Mutex<Instant>,
    last_write: Mutex<Instant>,
}

impl Shared {
    fn shut(&self) {
        self.active.store(false, Ordering::Release);
        self.closed.send_replace(true);
    }
}

/// Handle to the write side of a relayed TCP connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    /// Spawn the writer task owning `writer` and return a handle to it.
    pub fn spawn<W>(writer: W, peer: SocketAddr) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let now = Instant::now();
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            peer,
            active: AtomicBool::new(true),
            closed,
            pending: AtomicUsize::new(0),
            max_pending: AtomicUsize::new(0),
            last_read: Mutex::new(now),
            last_write: Mutex::new(now),
        });

        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(writer, rx, Arc::clone(&shared)));

        Self { shared, commands }
    }

    /// Remote address of the connection.
    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    /// Whether the connection still accepts writes.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Write and flush `data`, resolving once the write has completed.
    ///
    /// An empty buffer only flushes; it answers idleness and is
    /// not counted as a pending message.
    pub async fn write(&self, data: Bytes) -> io::Result<()> {
        if !self.is_active() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            ));
        }

        let counted = !data.is_empty();
        if counted {
            let pending = self.shared.pending.fetch_add(1, Ordering::AcqRel) + 1;
            self.shared.max_pending.fetch_max(pending, Ordering::AcqRel);
        }

        let (done, completion) = oneshot::channel();
        if self.commands.send(Command::Write { data, done }).is_err() {
            if counted {
                self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            }
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            ));
        }

        match completion.await {
            Ok(result) => result,
            Err(_) => {
                // The writer stopped with this command still queued.
                if counted {
                    self.shared.pending.fetch_sub(1, Ordering::AcqRel);
                }
                Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "connection closed before write completed",
                ))
            }
        }
    }

    /// Queue a flush-only write without waiting for it.
    pub fn flush(&self) {
        if self.is_active() {
            let (done, _) = oneshot::channel();
            let _ = self.commands.send(Command::Write {
                data: Bytes::new(),
                done,
            });
        }
    }

    /// Close once every write queued so far has been flushed.
    pub fn close_on_flush(&self) {
        if self.is_active() {
            let _ = self.commands.send(Command::CloseOnFlush);
        }
    }

    /// Close immediately, discarding queued writes.
    pub fn close(&self) {
        self.shared.shut();
    }

    /// Resolve once the connection has been closed by either discipline.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        wait_closed(&mut rx).await;
    }

    /// Record read activity for idle detection.
    pub fn mark_read(&self) {
        if let Ok(mut last) = self.shared.last_read.lock() {
            *last = Instant::now();
        }
    }

    /// Time of the last read recorded with [`mark_read`](Self::mark_read).
    pub fn last_read(&self) -> Instant {
        match self.shared.last_read.lock() {
            Ok(last) => *last,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Time of the last completed write.
    pub fn last_write(&self) -> Instant {
        match self.shared.last_write.lock() {
            Ok(last) => *last,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Writes issued but not yet completed.
    pub fn pending_writes(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// High-water mark of [`pending_writes`](Self::pending_writes).
    pub fn max_pending_writes(&self) -> usize {
        self.shared.max_pending.load(Ordering::Acquire)
    }
}

/// Close `connection` after pending writes flush. A missing connection is ignored.
pub fn close_on_flush(connection: Option<&ConnectionHandle>) {
    if let Some(connection) = connection {
        connection.close_on_flush();
    }
}

/// Close `connection` immediately. A missing connection is ignored.
pub fn close(connection: Option<&ConnectionHandle>) {
    if let Some(connection) = connection {
        connection.close();
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

async fn run_writer<W>(
    mut writer: W,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    let mut closed = shared.closed.subscribe();

    loop {
        let command = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break,
            command = commands.recv() => command,
        };

        match command {
            Some(Command::Write { data, done }) => {
                let counted = !data.is_empty();
                let result = tokio::select! {
                    biased;
                    _ = wait_closed(&mut closed) => Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "connection closed",
                    )),
                    result = write_and_flush(&mut writer, &data) => result,
                };

                if counted {
                    shared.pending.fetch_sub(1, Ordering::AcqRel);
                }

                let failed = result.is_err();
                if !failed {
                    if let Ok(mut last) = shared.last_write.lock() {
                        *last = Instant::now();
                    }
                }
                let _ = done.send(result);

                if failed {
                    break;
                }
            }
            Some(Command::CloseOnFlush) => {
                let _ = writer.shutdown().await;
                break;
            }
            None => break,
        }
    }

    trace!(peer = %shared.peer, "Writer stopped");
    shared.shut();
}

async fn write_and_flush<W>(writer: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if !data.is_empty() {
        writer.write_all(data).await?;
    }
    writer.flush().await
}

/// Shared client-facing datagram socket.
///
/// Closing the handle stops the inbound relay loop; the socket itself is
/// released once the last in-flight relay unit drops its clone.
#[derive(Clone)]
pub struct DatagramHandle {
    socket: Arc<UdpSocket>,
    closed: Arc<watch::Sender<bool>>,
}

impl DatagramHandle {
    pub fn new(socket: UdpSocket) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            socket: Arc::new(socket),
            closed: Arc::new(closed),
        }
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Send `data` to `target` unless the handle has been closed.
    pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "datagram socket closed",
            ));
        }
        self.socket.send_to(data, target).await
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        wait_closed(&mut rx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[tokio::test]
    async fn test_write_then_close_on_flush_delivers_everything() {
        let (client, mut server) = tokio::io::duplex(64);
        let handle = ConnectionHandle::spawn(client, peer());

        handle.write(Bytes::from_static(b"hello ")).await.unwrap();
        let h = handle.clone();
        let pending = tokio::spawn(async move { h.write(Bytes::from_static(b"world")).await });
        tokio::task::yield_now().await;
        handle.close_on_flush();

        pending.await.unwrap().unwrap();
        handle.closed().await;
        assert!(!handle.is_active());

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello world");
    }

    #[tokio::test]
    async fn test_close_discards_and_rejects_writes() {
        let (client, _server) = tokio::io::duplex(64);
        let handle = ConnectionHandle::spawn(client, peer());

        handle.close();
        handle.closed().await;

        let err = handle.write(Bytes::from_static(b"late")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_close_preempts_blocked_write() {
        // Tiny pipe nobody reads: the write below can never complete.
        let (client, _server) = tokio::io::duplex(4);
        let handle = ConnectionHandle::spawn(client, peer());

        let h = handle.clone();
        let blocked = tokio::spawn(async move { h.write(Bytes::from(vec![0u8; 1024])).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.pending_writes(), 1);

        handle.close();
        assert!(blocked.await.unwrap().is_err());
        assert_eq!(handle.pending_writes(), 0);
    }

    #[tokio::test]
    async fn test_write_queued_behind_close_on_flush_is_released() {
        let (client, mut server) = tokio::io::duplex(64);
        let handle = ConnectionHandle::spawn(client, peer());

        handle.close_on_flush();
        let err = handle.write(Bytes::from_static(b"late")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(handle.pending_writes(), 0);

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_empty_write_is_not_counted() {
        let (client, _server) = tokio::io::duplex(64);
        let handle = ConnectionHandle::spawn(client, peer());

        handle.write(Bytes::new()).await.unwrap();
        assert_eq!(handle.max_pending_writes(), 0);

        handle.write(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(handle.max_pending_writes(), 1);
        assert_eq!(handle.pending_writes(), 0);
    }

    #[tokio::test]
    async fn test_optional_helpers_ignore_missing_connection() {
        close(None);
        close_on_flush(None);

        let (client, _server) = tokio::io::duplex(64);
        let handle = ConnectionHandle::spawn(client, peer());
        close(Some(&handle));
        handle.closed().await;
    }

    #[tokio::test]
    async fn test_datagram_handle_close() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let handle = DatagramHandle::new(socket);
        let target = handle.local_addr().unwrap();

        assert!(handle.send_to(b"x", target).await.is_ok());

        handle.close();
        handle.closed().await;
        assert!(handle.is_closed());
        assert!(handle.send_to(b"x", target).await.is_err());
    }
}
