//! Harp frame model

use super::types::{DataType, HarpTimestamp, MessageType, Payload};
use bytes::Bytes;
use std::fmt;

/// Port value addressing the device itself
pub const DEVICE_PORT: u8 = 255;

/// One decoded (or to-be-encoded) Harp message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type
    pub message_type: MessageType,
    /// Register address
    pub address: u8,
    /// Port identifier
    pub port: u8,
    /// Element type of the payload
    pub payload_type: DataType,
    /// Device timestamp, present on timestamped frames
    pub timestamp: Option<HarpTimestamp>,
    /// Raw little-endian payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame from raw parts
    pub fn new(
        message_type: MessageType,
        address: u8,
        port: u8,
        payload_type: DataType,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            message_type,
            address,
            port,
            payload_type,
            timestamp: None,
            payload: payload.into(),
        }
    }

    /// Read request (no payload)
    pub fn read(address: u8, data_type: DataType) -> Self {
        Self::new(MessageType::Read, address, DEVICE_PORT, data_type, Bytes::new())
    }

    /// Write request carrying `payload`
    pub fn write(address: u8, payload: &Payload) -> Self {
        Self::new(
            MessageType::Write,
            address,
            DEVICE_PORT,
            payload.data_type(),
            payload.to_bytes(),
        )
    }

    /// Frame of any type carrying a typed payload
    pub fn with_payload(message_type: MessageType, address: u8, payload: &Payload) -> Self {
        Self::new(
            message_type,
            address,
            DEVICE_PORT,
            payload.data_type(),
            payload.to_bytes(),
        )
    }

    /// Set the timestamp
    #[must_use]
    pub fn timestamped(mut self, timestamp: HarpTimestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Set the port
    #[must_use]
    pub fn port(mut self, port: u8) -> Self {
        self.port = port;
        self
    }

    /// Number of payload elements
    pub fn element_count(&self) -> usize {
        self.payload.len() / self.payload_type.size()
    }

    /// True when the payload carries more than one element
    pub fn is_array(&self) -> bool {
        self.element_count() > 1
    }

    /// Decode the payload according to its type tag
    pub fn value(&self) -> Option<Payload> {
        Payload::from_bytes(self.payload_type, &self.payload)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} addr={} port={} {}[{}]",
            self.message_type,
            self.address,
            self.port,
            self.payload_type,
            self.element_count()
        )?;
        if let Some(ts) = self.timestamp {
            write!(f, " t={ts}")?;
        }
        match self.value() {
            Some(value) if !self.payload.is_empty() => write!(f, " {value}"),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_request_has_no_payload() {
        let frame = Frame::read(8, DataType::U32);
        assert_eq!(frame.message_type, MessageType::Read);
        assert_eq!(frame.port, DEVICE_PORT);
        assert!(frame.payload.is_empty());
        assert_eq!(frame.element_count(), 0);
    }

    #[test]
    fn test_write_request_typed_value() {
        let frame = Frame::write(8, &Payload::from(3_000_000_000u32));
        assert_eq!(frame.payload_type, DataType::U32);
        assert_eq!(frame.value(), Some(Payload::U32(vec![3_000_000_000])));
        assert!(!frame.is_array());
    }

    #[test]
    fn test_display() {
        let frame = Frame::with_payload(MessageType::Event, 8, &Payload::from(42u32))
            .timestamped(HarpTimestamp::new(42, 0));
        assert_eq!(frame.to_string(), "Event addr=8 port=255 U32[1] t=42.000000s [42]");
    }
}
