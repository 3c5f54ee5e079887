//! # Error Types
//!
//! Error handling for the framing layer and the channels built on it.
//!
//! This module defines all error variants that can occur while framing,
//! sending, receiving, pooling and managing channels.
//!
//! ## Error Categories
//! - **Transport Errors**: connect, send and receive failures on a socket
//! - **Lifecycle Errors**: operations on idle, closed or disposed resources
//! - **Framing Errors**: malformed or oversized frame headers
//! - **Flow Control**: transient backpressure on the write queue
//!
//! Incomplete headers or content are never errors. The decoder simply waits
//! for more bytes.
//!
//! ## Example Usage
//! ```rust
//! use packet_channel::error::{ProtocolError, Result};
//! use tracing::{error, info};
//!
//! fn parse_port(value: &str) -> Result<u16> {
//!     value
//!         .parse::<u16>()
//!         .map_err(|e| ProtocolError::ConfigError(format!("invalid port: {e}")))
//! }
//!
//! fn main() {
//!     match parse_port("9000") {
//!         Ok(port) => info!(port, "Port parsed"),
//!         Err(e) => error!(error=%e, "Bad port"),
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common error cases.
pub mod constants {
    /// Framing errors
    pub const ERR_INVALID_HEADER: &str = "Invalid frame header";
    pub const ERR_CONTENT_OVERRUN: &str = "Frame content exceeds the remaining message length";
    pub const ERR_TOTAL_MISMATCH: &str = "Frame total length disagrees with the message in progress";
    pub const ERR_TOO_MANY_PENDING: &str = "Too many partially received messages";

    /// Connection errors
    pub const ERR_NOT_CONNECTED: &str = "Channel is not connected";
    pub const ERR_CONNECT_COOLDOWN: &str = "Channel is down and the reconnect cooldown has not elapsed";
    pub const ERR_WRITER_GONE: &str = "Channel writer has stopped";

    /// Pool errors
    pub const ERR_POOL_DISPOSED: &str = "Object pool has been disposed";

    /// Large-buffer store errors
    pub const ERR_UNKNOWN_HANDLE: &str = "Unknown buffer handle";
}

// ProtocolError is the primary error type for all channel operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connect failed: {0}")]
    ConnectFailure(String),

    #[error("Send failed: {0}")]
    SendFailure(String),

    #[error("Receive failed: {0}")]
    ReceiveFailure(String),

    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Write queue is full")]
    Backpressure,

    #[error("Object pool has been disposed")]
    PoolDisposed,

    #[error("Channel is not connected: {0}")]
    NotConnected(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid frame header: {0}")]
    InvalidHeader(String),

    #[error("Message too large: {0} bytes")]
    OversizedPacket(u64),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Buffer store error: {0}")]
    StoreError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether an I/O failure is one of the transient kinds a read or write
    /// may report without the connection being broken.
    pub fn is_transient(&self) -> bool {
        match self {
            ProtocolError::Io(e) => is_transient_io(e),
            ProtocolError::Backpressure => true,
            _ => false,
        }
    }
}

/// Transient socket conditions that are retried instead of failing the channel.
pub(crate) fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let would_block = ProtocolError::Io(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(would_block.is_transient());
        assert!(ProtocolError::Backpressure.is_transient());

        let reset = ProtocolError::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(!reset.is_transient());
        assert!(!ProtocolError::PoolDisposed.is_transient());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(ProtocolError::PoolDisposed.to_string(), constants::ERR_POOL_DISPOSED);
        assert_eq!(
            ProtocolError::OversizedPacket(42).to_string(),
            "Message too large: 42 bytes"
        );
    }
}
