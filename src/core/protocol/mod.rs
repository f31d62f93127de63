//! Harp protocol implementation
//!
//! Provides the frame model, payload type tagging, checksum and the
//! streaming codec used by the device session.

pub mod checksum;
pub mod codec;
pub mod frame;
pub mod types;

pub use codec::{decode, decode_with_limit, encode, DecodeError, EncodeError, HarpCodec};
pub use frame::{Frame, DEVICE_PORT};
pub use types::{DataType, HarpTimestamp, MessageType, Payload};
