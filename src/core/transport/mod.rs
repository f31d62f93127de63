//! Transport layer
//!
//! A transport is a byte pipe with no protocol knowledge:
//! - Serial ports via `tokio-serial`
//! - Any `AsyncRead + AsyncWrite` stream (in-memory pairs for tests and
//!   the virtual device)

mod serial;
mod stream;

pub use serial::{list_ports, PortInfo, SerialConfig, SerialFlowControl, SerialParity, SerialTransport};
pub use stream::{memory_pair, StreamTransport};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Port already in use
    #[error("Port already in use: {0}")]
    PortInUse(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Disconnected
    #[error("Disconnected")]
    Disconnected,
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Write calls
    pub writes: u64,
    /// Reads that returned data
    pub reads: u64,
    /// Errors count
    pub errors: u64,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
}

/// Byte-oriented connection to a device
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send {
    /// Read up to `max_bytes`.
    ///
    /// Returns an empty buffer when nothing arrives within `timeout`. Never
    /// blocks past the timeout.
    async fn read(&mut self, max_bytes: usize, timeout: Duration) -> Result<Bytes, TransportError>;

    /// Write all of `data`, returning the number of bytes written
    async fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Release the endpoint. Further reads and writes fail with `NotConnected`.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if open
    fn is_open(&self) -> bool;

    /// Get connection info string
    fn connection_info(&self) -> String;

    /// Get statistics
    fn stats(&self) -> TransportStats;
}
