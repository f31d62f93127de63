//! # Harpcom Core Library
//!
//! Host-side engine for the Harp binary protocol:
//! - Frame codec with checksum verification and stream resynchronization
//! - Serial and in-memory transports behind one async trait
//! - Device sessions correlating requests with replies, with retries
//! - Bounded delivery of unsolicited device events
//! - Core register catalog and an emulated device for tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use harpcom_core::{DeviceSession, SerialConfig, SessionConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let serial = SerialConfig::new("/dev/ttyUSB0", 1_000_000);
//!     let session = DeviceSession::open_serial(serial, SessionConfig::default())?;
//!
//!     println!("Device clock: {}", session.harp_seconds().await?);
//!
//!     session.enable_heartbeat().await?;
//!     while let Some(event) = session.poll_event(Duration::from_secs(2)).await {
//!         println!("Event: {event}");
//!     }
//!
//!     session.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes, OutputFormat};
pub use crate::config::{AppConfig, LogFormat, LoggingConfig};
pub use crate::core::device_info::DeviceInfo;
pub use crate::core::error::{HarpError, HarpResult};
pub use crate::core::event_queue::{EventQueue, OverflowPolicy};
pub use crate::core::protocol::{
    DataType, DecodeError, EncodeError, Frame, HarpCodec, HarpTimestamp, MessageType, Payload,
};
pub use crate::core::registers::{OperationControl, OperationMode, RegisterCatalog};
pub use crate::core::session::{DeviceSession, SessionConfig, SessionStats};
pub use crate::core::simulator::{FaultConfig, VirtualDevice, VirtualDeviceConfig};
pub use crate::core::transport::{
    memory_pair, SerialConfig, SerialTransport, StreamTransport, Transport, TransportError,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
