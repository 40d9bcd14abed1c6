//! Idle detection for client connections.
//!
//! The monitor only reports idleness; the caller decides what to do about it
//! (the TCP relay sends an empty flush and keeps the session open).

use std::time::Duration;

use tokio::time::{sleep_until, Instant};

use super::lifecycle::ConnectionHandle;

/// Idle periods; `None` disables that kind of detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdleConfig {
    /// No read for this long.
    pub reader_idle: Option<Duration>,
    /// No completed write for this long.
    pub writer_idle: Option<Duration>,
    /// Neither read nor write for this long.
    pub all_idle: Option<Duration>,
}

impl IdleConfig {
    pub fn is_enabled(&self) -> bool {
        self.reader_idle.is_some() || self.writer_idle.is_some() || self.all_idle.is_some()
    }
}

/// Kind of idleness observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    ReaderIdle,
    WriterIdle,
    AllIdle,
}

impl IdleState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReaderIdle => "READER_IDLE",
            Self::WriterIdle => "WRITER_IDLE",
            Self::AllIdle => "ALL_IDLE",
        }
    }
}

/// Watches one connection's activity timestamps.
pub struct IdleMonitor {
    config: IdleConfig,
    reader_fired: Option<Instant>,
    writer_fired: Option<Instant>,
    all_fired: Option<Instant>,
}

impl IdleMonitor {
    pub fn new(config: IdleConfig) -> Self {
        Self {
            config,
            reader_fired: None,
            writer_fired: None,
            all_fired: None,
        }
    }

    /// Resolve with the next idle event. Pending forever when disabled.
    ///
    /// Each event fires at most once per idle period: after firing, the
    /// period restarts from the later of the last activity and the event.
    pub async fn next_event(&mut self, connection: &ConnectionHandle) -> IdleState {
        loop {
            let last_read = connection.last_read();
            let last_write = connection.last_write();
            let last_any = last_read.max(last_write);

            let candidates = [
                (IdleState::ReaderIdle, self.config.reader_idle, last_read, self.reader_fired),
                (IdleState::WriterIdle, self.config.writer_idle, last_write, self.writer_fired),
                (IdleState::AllIdle, self.config.all_idle, last_any, self.all_fired),
            ];

            let next = candidates
                .iter()
                .filter_map(|(state, period, activity, fired)| {
                    let period = (*period)?;
                    let base = match fired {
                        Some(fired) => (*activity).max(*fired),
                        None => *activity,
                    };
                    Some((*state, base + period))
                })
                .min_by_key(|(_, deadline)| *deadline);

            let Some((state, deadline)) = next else {
                return std::future::pending().await;
            };

            let now = Instant::now();
            if deadline <= now {
                match state {
                    IdleState::ReaderIdle => self.reader_fired = Some(now),
                    IdleState::WriterIdle => self.writer_fired = Some(now),
                    IdleState::AllIdle => self.all_fired = Some(now),
                }
                return state;
            }

            sleep_until(deadline).await;
        }
    }
}
