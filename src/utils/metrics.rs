//! Observability and Metrics
//!
//! This module provides metrics collection for channels, the framing layer
//! and the pools underneath them.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Global metrics collector for channel operations
#[derive(Debug)]
pub struct Metrics {
    /// Channels armed by the accept loop
    pub channels_accepted: AtomicU64,
    /// Channels armed by a client connect
    pub channels_connected: AtomicU64,
    /// Currently active channels
    pub channels_active: AtomicU64,
    /// Failed connect attempts
    pub connect_failures: AtomicU64,
    /// Logical messages whose sends completed
    pub messages_sent: AtomicU64,
    /// Logical messages reassembled and delivered
    pub messages_received: AtomicU64,
    /// Payload bytes of completed sends
    pub bytes_sent: AtomicU64,
    /// Payload bytes of delivered messages
    pub bytes_received: AtomicU64,
    /// Frames written to sockets
    pub frames_written: AtomicU64,
    /// Keep-alive frames written
    pub keepalives_sent: AtomicU64,
    /// Writes that failed and closed their channel
    pub send_failures: AtomicU64,
    /// Reads that failed and closed their channel
    pub receive_failures: AtomicU64,
    /// Sends held back by a full write queue
    pub backpressure_events: AtomicU64,
    /// Pool borrows that had to wait for a release
    pub pool_waits: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            channels_accepted: AtomicU64::new(0),
            channels_connected: AtomicU64::new(0),
            channels_active: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
            keepalives_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            receive_failures: AtomicU64::new(0),
            backpressure_events: AtomicU64::new(0),
            pool_waits: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a channel armed by the accept loop
    pub fn channel_accepted(&self) {
        self.channels_accepted.fetch_add(1, Ordering::Relaxed);
        self.channels_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a channel armed by a client connect
    pub fn channel_connected(&self) {
        self.channels_connected.fetch_add(1, Ordering::Relaxed);
        self.channels_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a channel closed
    pub fn channel_closed(&self) {
        let _ = self
            .channels_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Record a failed connect attempt
    pub fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed logical send
    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a delivered message
    pub fn message_received(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a frame written to a socket
    pub fn frame_written(&self) {
        self.frames_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a keep-alive frame
    pub fn keepalive_sent(&self) {
        self.keepalives_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed write
    pub fn send_failed(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed read
    pub fn receive_failed(&self) {
        self.receive_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send held back by the write queue
    pub fn backpressure(&self) {
        self.backpressure_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a pool borrow that had to wait
    pub fn pool_wait(&self) {
        self.pool_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            channels_accepted: self.channels_accepted.load(Ordering::Relaxed),
            channels_connected: self.channels_connected.load(Ordering::Relaxed),
            channels_active: self.channels_active.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            keepalives_sent: self.keepalives_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            receive_failures: self.receive_failures.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
            pool_waits: self.pool_waits.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            channels_accepted = snapshot.channels_accepted,
            channels_connected = snapshot.channels_connected,
            channels_active = snapshot.channels_active,
            connect_failures = snapshot.connect_failures,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            frames_written = snapshot.frames_written,
            keepalives_sent = snapshot.keepalives_sent,
            send_failures = snapshot.send_failures,
            receive_failures = snapshot.receive_failures,
            backpressure_events = snapshot.backpressure_events,
            pool_waits = snapshot.pool_waits,
            uptime_seconds = snapshot.uptime_seconds,
            "Channel metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub channels_accepted: u64,
    pub channels_connected: u64,
    pub channels_active: u64,
    pub connect_failures: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_written: u64,
    pub keepalives_sent: u64,
    pub send_failures: u64,
    pub receive_failures: u64,
    pub backpressure_events: u64,
    pub pool_waits: u64,
    pub uptime_seconds: u64,
}

/// Global metrics instance (lazy static for simplicity)
static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Initialize metrics collection (call once at startup)
pub fn init_metrics() {
    let _ = global_metrics();
    info!("Metrics collection initialized");
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_counters() {
        let metrics = Metrics::new();
        metrics.channel_accepted();
        metrics.channel_connected();
        metrics.channel_closed();
        metrics.channel_closed();
        metrics.channel_closed();

        let snap = metrics.snapshot();
        assert_eq!(snap.channels_accepted, 1);
        assert_eq!(snap.channels_connected, 1);
        assert_eq!(snap.channels_active, 0, "active count never underflows");
    }

    #[test]
    fn test_message_counters() {
        let metrics = Metrics::new();
        metrics.message_sent(10);
        metrics.message_sent(5);
        metrics.message_received(7);

        let snap = metrics.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.bytes_sent, 15);
        assert_eq!(snap.bytes_received, 7);
    }
}
