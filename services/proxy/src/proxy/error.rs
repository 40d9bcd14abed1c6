//! Relay error taxonomy.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while relaying a session or datagram.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Socket-level failure (reset, broken pipe, refused, ...).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The balancing strategy had no backend to offer.
    #[error("unable to select a backend server")]
    NoBackend,

    /// Dialing the backend did not complete in time.
    #[error("connect to {backend} timed out after {timeout:?}")]
    ConnectTimeout { backend: String, timeout: Duration },

    /// Backend host did not resolve to any address.
    #[error("backend {backend} did not resolve to an address")]
    Resolve { backend: String },

    /// A relay task panicked or was cancelled.
    #[error("relay task failed: {0}")]
    Task(String),
}

impl RelayError {
    /// I/O-class faults are ordinary disconnects: closed, never logged as errors.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ConnectTimeout { .. })
    }
}

impl From<tokio::task::JoinError> for RelayError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

/// Log a fault the way the relay handlers do: quietly for I/O, loudly otherwise.
pub(crate) fn report(err: &RelayError) {
    if err.is_io() {
        tracing::debug!(error = %err, "Connection fault");
    } else {
        tracing::error!(error = ?err, "{}", err);
    }
}
