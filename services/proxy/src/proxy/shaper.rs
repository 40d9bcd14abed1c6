//! Traffic shaping for relayed datagrams.
//!
//! A shaper is a stage placed in front of a socket: sends wait on
//! [`TrafficShaper::shape_write`], received payloads wait on
//! [`TrafficShaper::shape_read`] before they are relayed on. One
//! [`GlobalTrafficShaper`] is shared by every shaped socket, so its limits
//! apply to the process as a whole.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::trace;

/// Default interval over which the configured rate is accounted.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Rate-limiting stage for a socket's traffic.
#[async_trait]
pub trait TrafficShaper: Send + Sync {
    /// Suspend until `bytes` may be sent.
    async fn shape_write(&self, bytes: usize);

    /// Suspend until `bytes` that were received may be passed on.
    async fn shape_read(&self, bytes: usize);
}

struct BucketState {
    available: f64,
    last_refill: Instant,
}

/// Token bucket refilled at `rate` bytes per second, holding at most one
/// check interval's worth of tokens.
struct Bucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl Bucket {
    fn new(rate: u64, check_interval: Duration) -> Self {
        let rate = rate as f64;
        let capacity = (rate * check_interval.as_secs_f64()).max(1.0);
        Self {
            rate,
            capacity,
            state: Mutex::new(BucketState {
                available: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        self.credit(state);
        state.available = state.available.min(self.capacity);
    }

    /// Add the tokens accrued since the last refill, without the capacity cap.
    fn credit(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.available += elapsed * self.rate;
        state.last_refill = now;
    }

    /// Waiters are served in arrival order. A request larger than the bucket
    /// waits for exactly its deficit and leaves the bucket empty.
    async fn acquire(&self, bytes: usize) {
        let bytes = bytes as f64;
        let mut state = self.state.lock().await;
        self.refill(&mut state);

        if state.available < bytes {
            let deficit = bytes - state.available;
            let wait = Duration::from_secs_f64(deficit / self.rate);
            trace!(wait_ms = wait.as_millis() as u64, "Traffic shaping delay");
            sleep(wait).await;
            // Uncapped: the wait covers the deficit exactly.
            self.credit(&mut state);
        }

        state.available = (state.available - bytes).max(0.0);
    }
}

/// Process-wide shaper with independent write and read limits.
pub struct GlobalTrafficShaper {
    write: Option<Bucket>,
    read: Option<Bucket>,
}

impl GlobalTrafficShaper {
    /// Limits are in bytes per second; 0 disables that direction.
    pub fn new(write_limit: u64, read_limit: u64, check_interval: Duration) -> Self {
        let bucket = |limit: u64| (limit > 0).then(|| Bucket::new(limit, check_interval));
        Self {
            write: bucket(write_limit),
            read: bucket(read_limit),
        }
    }

    /// Shared shaper for the given limits, or `None` when both are unlimited.
    pub fn from_limits(write_limit: u64, read_limit: u64) -> Option<Arc<dyn TrafficShaper>> {
        if write_limit == 0 && read_limit == 0 {
            return None;
        }
        Some(Arc::new(Self::new(
            write_limit,
            read_limit,
            DEFAULT_CHECK_INTERVAL,
        )))
    }
}

#[async_trait]
impl TrafficShaper for GlobalTrafficShaper {
    async fn shape_write(&self, bytes: usize) {
        if let Some(bucket) = &self.write {
            bucket.acquire(bytes).await;
        }
    }

    async fn shape_read(&self, bytes: usize) {
        if let Some(bucket) = &self.read {
            bucket.acquire(bytes).await;
        }
    }
}
