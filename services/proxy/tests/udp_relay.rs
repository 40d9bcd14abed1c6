mod harness;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use harness::{wait_until, DatagramRelayHandle, RecordingStrategy, UdpBackend, TEST_TIMEOUT};
use strait_proxy::proxy::{GlobalTrafficShaper, TrafficShaper};
use tokio::net::UdpSocket;
use tokio::time::timeout;

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

#[tokio::test]
async fn datagram_reply_reaches_original_sender() {
    let backend = UdpBackend::spawn(b"reply").await.unwrap();
    let strategy = RecordingStrategy::new(vec![backend.info("dns")]);
    let relay = DatagramRelayHandle::spawn(strategy.clone(), None).await.unwrap();

    let client = client().await;
    client.send_to(b"payload", relay.listen_addr).await.unwrap();

    let mut buf = [0u8; 64];
    let (n, from) = timeout(TEST_TIMEOUT, client.recv_from(&mut buf))
        .await
        .expect("no reply relayed")
        .unwrap();
    assert_eq!(&buf[..n], b"reply");
    assert_eq!(from, relay.listen_addr);
    assert_eq!(backend.received(), vec![b"payload".to_vec()]);

    let stats = relay.listener.stats();
    assert!(wait_until(|| stats.ephemeral_open.load(Ordering::Relaxed) == 0).await);
    assert_eq!(stats.replies_relayed.load(Ordering::Relaxed), 1);
    assert_eq!(strategy.selections(), 1);
}

#[tokio::test]
async fn each_datagram_selects_a_backend() {
    let first = UdpBackend::spawn(b"one").await.unwrap();
    let second = UdpBackend::spawn(b"two").await.unwrap();
    let strategy = RecordingStrategy::new(vec![first.info("first"), second.info("second")]);
    let relay = DatagramRelayHandle::spawn(strategy.clone(), None).await.unwrap();

    let client = client().await;
    let mut replies = Vec::new();
    for _ in 0..2 {
        client.send_to(b"ping", relay.listen_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = timeout(TEST_TIMEOUT, client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        replies.push(buf[..n].to_vec());
    }

    replies.sort();
    assert_eq!(replies, vec![b"one".to_vec(), b"two".to_vec()]);
    assert_eq!(first.received().len(), 1);
    assert_eq!(second.received().len(), 1);
}

#[tokio::test]
async fn no_backend_closes_listening_socket() {
    let strategy = RecordingStrategy::new(vec![]);
    let mut relay = DatagramRelayHandle::spawn(strategy, None).await.unwrap();

    let client = client().await;
    client.send_to(b"payload", relay.listen_addr).await.unwrap();

    // The receive loop stops on its own once the socket is closed.
    timeout(TEST_TIMEOUT, &mut relay.task)
        .await
        .expect("listener kept running")
        .unwrap();
    assert_eq!(
        relay.listener.stats().selection_failures.load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn shaper_limits_forwarded_bytes() {
    let backend = UdpBackend::spawn(b"ok").await.unwrap();
    let strategy = RecordingStrategy::new(vec![backend.info("shaped")]);
    // 1000 B/s with a one second bucket: the first kilobyte passes, the
    // second waits for a refill.
    let shaper: Arc<dyn TrafficShaper> =
        Arc::new(GlobalTrafficShaper::new(1000, 0, Duration::from_secs(1)));
    let relay = DatagramRelayHandle::spawn(strategy, Some(shaper)).await.unwrap();

    let client = client().await;
    let payload = vec![7u8; 1000];
    let start = Instant::now();

    for _ in 0..2 {
        client.send_to(&payload, relay.listen_addr).await.unwrap();
    }
    for _ in 0..2 {
        let mut buf = [0u8; 16];
        timeout(TEST_TIMEOUT, client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
    }

    assert!(start.elapsed() >= Duration::from_millis(900));
    assert_eq!(backend.received().len(), 2);
}
