//! Concrete balancing strategies.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::{debug, warn};

use crate::{BackendInfo, BalancingStrategy};

fn shared(backends: Vec<BackendInfo>) -> Vec<Arc<BackendInfo>> {
    backends.into_iter().map(Arc::new).collect()
}

/// Rotates through backends in declaration order.
pub struct RoundRobinStrategy {
    backends: Vec<Arc<BackendInfo>>,
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new(backends: Vec<BackendInfo>) -> Self {
        Self {
            backends: shared(backends),
            counter: AtomicUsize::new(0),
        }
    }
}

impl BalancingStrategy for RoundRobinStrategy {
    fn select_backend(&self, _key: &str) -> Option<Arc<BackendInfo>> {
        if self.backends.is_empty() {
            return None;
        }

        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % self.backends.len();
        Some(Arc::clone(&self.backends[idx]))
    }

    fn disconnected_from(&self, _backend: &BackendInfo) {}

    fn backends(&self) -> Vec<Arc<BackendInfo>> {
        self.backends.clone()
    }
}

/// Picks a backend uniformly at random.
pub struct RandomStrategy {
    backends: Vec<Arc<BackendInfo>>,
}

impl RandomStrategy {
    pub fn new(backends: Vec<BackendInfo>) -> Self {
        Self {
            backends: shared(backends),
        }
    }
}

impl BalancingStrategy for RandomStrategy {
    fn select_backend(&self, _key: &str) -> Option<Arc<BackendInfo>> {
        if self.backends.is_empty() {
            return None;
        }

        let idx = rand::rng().random_range(0..self.backends.len());
        Some(Arc::clone(&self.backends[idx]))
    }

    fn disconnected_from(&self, _backend: &BackendInfo) {}

    fn backends(&self) -> Vec<Arc<BackendInfo>> {
        self.backends.clone()
    }
}

struct Tracked {
    backend: Arc<BackendInfo>,
    connections: usize,
}

/// Picks the backend with the fewest live sessions.
///
/// `select_backend` counts a session against the chosen backend and
/// `disconnected_from` releases it, so every selection must be paired with
/// exactly one disconnect notification.
pub struct LeastConnectionsStrategy {
    backends: Mutex<Vec<Tracked>>,
}

impl LeastConnectionsStrategy {
    pub fn new(backends: Vec<BackendInfo>) -> Self {
        let tracked = shared(backends)
            .into_iter()
            .map(|backend| Tracked {
                backend,
                connections: 0,
            })
            .collect();

        Self {
            backends: Mutex::new(tracked),
        }
    }

    /// Live session count for the backend named `name`.
    pub fn connections(&self, name: &str) -> Option<usize> {
        let backends = self.backends.lock().ok()?;
        backends
            .iter()
            .find(|t| t.backend.name == name)
            .map(|t| t.connections)
    }
}

impl BalancingStrategy for LeastConnectionsStrategy {
    fn select_backend(&self, _key: &str) -> Option<Arc<BackendInfo>> {
        let mut backends = match self.backends.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let least = backends.iter_mut().min_by_key(|t| t.connections)?;
        least.connections += 1;

        debug!(
            backend = %least.backend,
            connections = least.connections,
            "Selected least loaded backend"
        );

        Some(Arc::clone(&least.backend))
    }

    fn disconnected_from(&self, backend: &BackendInfo) {
        let mut backends = match self.backends.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match backends.iter_mut().find(|t| *t.backend == *backend) {
            Some(tracked) => tracked.connections = tracked.connections.saturating_sub(1),
            None => warn!(backend = %backend, "Disconnect from unknown backend"),
        }
    }

    fn backends(&self) -> Vec<Arc<BackendInfo>> {
        match self.backends.lock() {
            Ok(backends) => backends.iter().map(|t| Arc::clone(&t.backend)).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|t| Arc::clone(&t.backend))
                .collect(),
        }
    }
}
