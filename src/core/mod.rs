//! Core module containing the Harp protocol engine
//!
//! This module provides:
//! - Frame model, payload typing and the binary codec
//! - Transport layer (serial ports, in-memory streams)
//! - Core register catalog
//! - Device session with request/reply correlation and event delivery
//! - Virtual device for tests and offline use

pub mod device_info;
pub mod error;
pub mod event_queue;
pub mod protocol;
pub mod registers;
pub mod session;
pub mod simulator;
pub mod transport;
