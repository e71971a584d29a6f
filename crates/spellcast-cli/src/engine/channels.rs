//! Outward worker channels.
//!
//! Both are `broadcast` channels: publishing never waits, and a subscriber
//! that falls behind loses the oldest items instead of stalling the loop.

use spellcast_core::events::Telemetry;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Buffered log lines per subscriber.
pub const LOG_CAPACITY: usize = 256;

/// Buffered telemetry items per subscriber.
pub const TELEMETRY_CAPACITY: usize = 64;

/// Operator-facing log lines, mirrored into `tracing`.
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: broadcast::Sender<String>,
}

impl LogSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LOG_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn info(&self, line: impl Into<String>) {
        let line = line.into();
        info!(target: "spellcast::worker", "{}", line);
        self.publish(line);
    }

    pub fn warn(&self, line: impl Into<String>) {
        let line = line.into();
        warn!(target: "spellcast::worker", "{}", line);
        self.publish(line);
    }

    pub fn error(&self, line: impl Into<String>) {
        let line = line.into();
        error!(target: "spellcast::worker", "{}", line);
        self.publish(line);
    }

    fn publish(&self, line: String) {
        // Err only means nobody is listening
        let _ = self.tx.send(line);
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Structured per-tick observations.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    tx: broadcast::Sender<Telemetry>,
}

impl TelemetrySink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(TELEMETRY_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Telemetry> {
        self.tx.subscribe()
    }

    pub fn publish(&self, telemetry: Telemetry) {
        let _ = self.tx.send(telemetry);
    }
}

impl Default for TelemetrySink {
    fn default() -> Self {
        Self::new()
    }
}
