//! Harp binary frame codec
//!
//! Layout (all multi-byte fields little-endian):
//!
//! ```text
//! type | length | address | port | payload type | [timestamp: u32 s, u16 ticks] | payload | checksum
//! ```
//!
//! `length` counts every byte after itself, checksum included. A length byte
//! of 255 marks the extended form, where the real length follows as a U16.
//!
//! [`encode`] and [`decode`] are pure. [`HarpCodec`] wraps them as a
//! `tokio_util` codec that resynchronizes by dropping one byte after a
//! corrupt frame and reports a single error per corrupt run.

use super::checksum;
use super::frame::Frame;
use super::types::{DataType, HarpTimestamp, MessageType};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Address, port and payload type bytes
const ADDRESSING_SIZE: usize = 3;
/// Checksum size
const CHECKSUM_SIZE: usize = 1;
/// Length byte value announcing the extended form
pub const EXTENDED_LENGTH: u8 = 255;
/// Timestamp flag in the payload type byte
pub const TIMESTAMP_FLAG: u8 = 0x10;
/// Smallest possible frame: type, length, address, port, payload type, checksum
pub const MIN_FRAME_SIZE: usize = 2 + ADDRESSING_SIZE + CHECKSUM_SIZE;
/// Default upper bound on accepted frame sizes
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024;

/// Encoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// Payload is not a whole number of elements
    #[error("payload of {len} bytes is not a whole number of {data_type} elements")]
    PayloadSize {
        /// Declared element type
        data_type: DataType,
        /// Payload length in bytes
        len: usize,
    },

    /// Frame does not fit the extended length field
    #[error("frame body of {0} bytes exceeds the maximum encodable length")]
    TooLong(usize),

    /// Sink error
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for EncodeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// More bytes are needed before a verdict is possible
    #[error("incomplete frame: {needed} more bytes needed")]
    Incomplete {
        /// Missing byte count (lower bound)
        needed: usize,
    },

    /// First byte is not a known message type
    #[error("invalid message type 0x{0:02x}")]
    InvalidMessageType(u8),

    /// Payload type byte is not a known type
    #[error("invalid payload type 0x{0:02x}")]
    InvalidPayloadType(u8),

    /// Declared length is too small for the header it implies
    #[error("declared length {declared} is too small")]
    InvalidLength {
        /// Declared length
        declared: usize,
    },

    /// Declared frame exceeds the configured maximum
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Declared frame size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Payload is not a whole number of elements
    #[error("payload of {len} bytes is not a whole number of {data_type} elements")]
    PayloadSize {
        /// Declared element type
        data_type: DataType,
        /// Payload length in bytes
        len: usize,
    },

    /// Trailing checksum does not match
    #[error("checksum mismatch: expected 0x{expected:02x}, got 0x{actual:02x}")]
    Checksum {
        /// Computed checksum
        expected: u8,
        /// Received checksum
        actual: u8,
    },

    /// Source error
    #[error("I/O error: {0}")]
    Io(String),
}

impl DecodeError {
    /// True when the bytes so far are a valid prefix
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete { .. })
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Encode the payload type byte
pub fn payload_type_byte(data_type: DataType, timestamped: bool) -> u8 {
    if timestamped {
        data_type.to_bits() | TIMESTAMP_FLAG
    } else {
        data_type.to_bits()
    }
}

/// Parse the payload type byte into element type and timestamp flag
pub fn parse_payload_type(byte: u8) -> Option<(DataType, bool)> {
    let timestamped = byte & TIMESTAMP_FLAG != 0;
    DataType::from_bits(byte & !TIMESTAMP_FLAG).map(|t| (t, timestamped))
}

/// Encode a frame into a complete wire message
pub fn encode(frame: &Frame) -> Result<Vec<u8>, EncodeError> {
    let mut out = BytesMut::new();
    encode_into(frame, &mut out)?;
    Ok(out.to_vec())
}

/// Encode a frame, appending to `dst`
pub fn encode_into(frame: &Frame, dst: &mut BytesMut) -> Result<(), EncodeError> {
    let size = frame.payload_type.size();
    if frame.payload.len() % size != 0 {
        return Err(EncodeError::PayloadSize {
            data_type: frame.payload_type,
            len: frame.payload.len(),
        });
    }

    let timestamp_len = if frame.timestamp.is_some() { HarpTimestamp::SIZE } else { 0 };
    let body_len = ADDRESSING_SIZE + timestamp_len + frame.payload.len() + CHECKSUM_SIZE;
    if body_len > usize::from(u16::MAX) {
        return Err(EncodeError::TooLong(body_len));
    }

    let start = dst.len();
    dst.reserve(body_len + 4);
    dst.put_u8(frame.message_type.to_u8());
    if body_len < usize::from(EXTENDED_LENGTH) {
        dst.put_u8(body_len as u8);
    } else {
        dst.put_u8(EXTENDED_LENGTH);
        dst.put_u16_le(body_len as u16);
    }
    dst.put_u8(frame.address);
    dst.put_u8(frame.port);
    dst.put_u8(payload_type_byte(frame.payload_type, frame.timestamp.is_some()));
    if let Some(ts) = frame.timestamp {
        dst.put_slice(&ts.to_bytes());
    }
    dst.put_slice(&frame.payload);
    let sum = checksum::sum8(&dst[start..]);
    dst.put_u8(sum);
    Ok(())
}

/// Decode one frame from the start of `bytes` with the default size limit.
///
/// Returns the frame and the number of bytes it occupied.
pub fn decode(bytes: &[u8]) -> Result<(Frame, usize), DecodeError> {
    decode_with_limit(bytes, DEFAULT_MAX_FRAME_SIZE)
}

/// Length of the frame at the start of `bytes` when its declared length is
/// plausible and every byte of it is buffered.
fn buffered_frame_len(bytes: &[u8], max_frame_size: usize) -> Option<usize> {
    let (body_len, body_start) = match *bytes.get(1)? {
        EXTENDED_LENGTH => (usize::from(u16::from_le_bytes([*bytes.get(2)?, *bytes.get(3)?])), 4),
        length => (usize::from(length), 2),
    };
    let total = body_start + body_len;
    (body_len >= ADDRESSING_SIZE + CHECKSUM_SIZE && total <= max_frame_size && bytes.len() >= total)
        .then_some(total)
}

/// Decode one frame from the start of `bytes`.
///
/// A fully buffered frame is checked against its checksum before anything
/// else. Otherwise header fields are validated as soon as they are available
/// so junk is rejected without waiting for a full frame's worth of bytes.
pub fn decode_with_limit(bytes: &[u8], max_frame_size: usize) -> Result<(Frame, usize), DecodeError> {
    if let Some(total) = buffered_frame_len(bytes, max_frame_size) {
        checksum::verify(&bytes[..total])
            .map_err(|(expected, actual)| DecodeError::Checksum { expected, actual })?;
    }

    let Some(&type_byte) = bytes.first() else {
        return Err(DecodeError::Incomplete { needed: MIN_FRAME_SIZE });
    };
    let message_type =
        MessageType::from_u8(type_byte).ok_or(DecodeError::InvalidMessageType(type_byte))?;

    let Some(&length_byte) = bytes.get(1) else {
        return Err(DecodeError::Incomplete { needed: MIN_FRAME_SIZE - bytes.len() });
    };
    let (body_len, body_start) = if length_byte == EXTENDED_LENGTH {
        if bytes.len() < 4 {
            return Err(DecodeError::Incomplete { needed: 4 - bytes.len() });
        }
        (usize::from(u16::from_le_bytes([bytes[2], bytes[3]])), 4)
    } else {
        (usize::from(length_byte), 2)
    };

    if body_len < ADDRESSING_SIZE + CHECKSUM_SIZE {
        return Err(DecodeError::InvalidLength { declared: body_len });
    }
    let total = body_start + body_len;
    if total > max_frame_size {
        return Err(DecodeError::FrameTooLarge { size: total, max: max_frame_size });
    }

    let Some(&payload_type_raw) = bytes.get(body_start + 2) else {
        return Err(DecodeError::Incomplete { needed: total - bytes.len() });
    };
    let (payload_type, timestamped) =
        parse_payload_type(payload_type_raw).ok_or(DecodeError::InvalidPayloadType(payload_type_raw))?;
    let timestamp_len = if timestamped { HarpTimestamp::SIZE } else { 0 };
    let overhead = ADDRESSING_SIZE + timestamp_len + CHECKSUM_SIZE;
    if body_len < overhead {
        return Err(DecodeError::InvalidLength { declared: body_len });
    }
    let payload_len = body_len - overhead;
    if payload_len % payload_type.size() != 0 {
        return Err(DecodeError::PayloadSize { data_type: payload_type, len: payload_len });
    }

    if bytes.len() < total {
        return Err(DecodeError::Incomplete { needed: total - bytes.len() });
    }
    let raw = &bytes[..total];

    let address = raw[body_start];
    let port = raw[body_start + 1];
    let mut cursor = body_start + ADDRESSING_SIZE;
    let timestamp = if timestamped {
        let mut ts = [0u8; HarpTimestamp::SIZE];
        ts.copy_from_slice(&raw[cursor..cursor + HarpTimestamp::SIZE]);
        cursor += HarpTimestamp::SIZE;
        Some(HarpTimestamp::from_bytes(&ts))
    } else {
        None
    };
    let payload = Bytes::copy_from_slice(&raw[cursor..cursor + payload_len]);

    Ok((
        Frame {
            message_type,
            address,
            port,
            payload_type,
            timestamp,
            payload,
        },
        total,
    ))
}

/// Streaming Harp codec
#[derive(Debug, Clone)]
pub struct HarpCodec {
    max_frame_size: usize,
    resyncing: bool,
    discarded: u64,
}

impl HarpCodec {
    /// Create a codec with the default frame size limit
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a codec with a custom frame size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.max(MIN_FRAME_SIZE),
            resyncing: false,
            discarded: 0,
        }
    }

    /// Total bytes dropped while resynchronizing
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// True while scanning for the next frame start after a corrupt frame
    pub fn is_resyncing(&self) -> bool {
        self.resyncing
    }

    /// Drop one byte from a buffer whose partial frame has stopped growing.
    ///
    /// Returns false when there was nothing to drop.
    pub fn skip_stalled(&mut self, src: &mut BytesMut) -> bool {
        if src.is_empty() {
            return false;
        }
        src.advance(1);
        self.discarded += 1;
        self.resyncing = !src.is_empty();
        true
    }
}

impl Default for HarpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for HarpCodec {
    type Item = Frame;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
        loop {
            if src.is_empty() {
                return Ok(None);
            }
            match decode_with_limit(src, self.max_frame_size) {
                Ok((frame, used)) => {
                    src.advance(used);
                    self.resyncing = false;
                    return Ok(Some(frame));
                }
                Err(err) if err.is_incomplete() => return Ok(None),
                Err(err) => {
                    src.advance(1);
                    self.discarded += 1;
                    let first = !self.resyncing;
                    // A run ends with the buffered bytes
                    self.resyncing = !src.is_empty();
                    if first {
                        return Err(err);
                    }
                }
            }
        }
    }
}

impl Encoder<&Frame> for HarpCodec {
    type Error = EncodeError;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), EncodeError> {
        encode_into(frame, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::types::Payload;

    fn timestamped_event() -> Frame {
        Frame::with_payload(MessageType::Event, 8, &Payload::from(1234u32))
            .timestamped(HarpTimestamp::new(1234, 99))
    }

    #[test]
    fn test_encode_read_request() {
        let bytes = encode(&Frame::read(0, DataType::U16)).unwrap();
        assert_eq!(bytes, vec![0x01, 0x04, 0x00, 0xFF, 0x02, 0x06]);
    }

    #[test]
    fn test_encode_rejects_partial_elements() {
        let frame = Frame::new(MessageType::Write, 8, 255, DataType::U32, vec![1u8, 2, 3]);
        assert_eq!(
            encode(&frame),
            Err(EncodeError::PayloadSize { data_type: DataType::U32, len: 3 })
        );
    }

    #[test]
    fn test_timestamped_layout() {
        let bytes = encode(&timestamped_event()).unwrap();
        // 3 addressing + 6 timestamp + 4 payload + 1 checksum
        assert_eq!(bytes[1], 14);
        assert_eq!(bytes[4], 0x14);
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[5..9], &1234u32.to_le_bytes());
    }

    #[test]
    fn test_round_trip() {
        let frames = [
            Frame::read(16, DataType::U8),
            Frame::write(8, &Payload::from(3_000_000_000u32)),
            timestamped_event(),
            Frame::with_payload(MessageType::ReadError, 40, &Payload::S64(vec![-1, i64::MAX])).port(3),
            Frame::with_payload(MessageType::Write, 33, &Payload::Float(vec![1.5, -2.25])),
        ];
        for frame in frames {
            let bytes = encode(&frame).unwrap();
            let (decoded, used) = decode(&bytes).unwrap();
            assert_eq!(used, bytes.len());
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_extended_length() {
        let frame = Frame::with_payload(MessageType::Write, 12, &Payload::U8(vec![0xAB; 300]));
        let bytes = encode(&frame).unwrap();
        assert_eq!(bytes[1], EXTENDED_LENGTH);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 304);
        let (decoded, used) = decode(&bytes).unwrap();
        assert_eq!(used, 308);
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_incomplete_prefix() {
        let bytes = encode(&timestamped_event()).unwrap();
        for cut in 0..bytes.len() {
            let err = decode(&bytes[..cut]).unwrap_err();
            assert!(err.is_incomplete(), "prefix of {cut} bytes gave {err:?}");
        }
    }

    #[test]
    fn test_decode_rejects_junk_early() {
        assert_eq!(decode(&[0x00]), Err(DecodeError::InvalidMessageType(0x00)));
        assert_eq!(decode(&[0x01, 0x02]), Err(DecodeError::InvalidLength { declared: 2 }));
        assert_eq!(
            decode(&[0x01, 0x04, 0x00, 0xFF, 0x03]),
            Err(DecodeError::InvalidPayloadType(0x03))
        );
        // Timestamp flag set but no room for a timestamp
        assert_eq!(
            decode(&[0x03, 0x05, 0x00, 0xFF, 0x11]),
            Err(DecodeError::InvalidLength { declared: 5 })
        );
        assert_eq!(
            decode(&[0x02, 0x07, 0x00, 0xFF, 0x04]),
            Err(DecodeError::PayloadSize { data_type: DataType::U32, len: 3 })
        );
    }

    #[test]
    fn test_frame_size_limit() {
        let frame = Frame::with_payload(MessageType::Write, 12, &Payload::U8(vec![0; 64]));
        let bytes = encode(&frame).unwrap();
        assert!(matches!(
            decode_with_limit(&bytes, 32),
            Err(DecodeError::FrameTooLarge { max: 32, .. })
        ));
    }

    #[test]
    fn test_single_byte_flip_never_decodes() {
        let bytes = encode(&timestamped_event()).unwrap();
        for index in 0..bytes.len() {
            for bit in 0..8 {
                let mut corrupt = bytes.clone();
                corrupt[index] ^= 1 << bit;
                let result = decode(&corrupt);
                assert!(result.is_err(), "flip at {index}:{bit} decoded");
                // Only a length flip can change which bytes the checksum covers
                if index != 1 {
                    assert!(matches!(result, Err(DecodeError::Checksum { .. })));
                }
            }
        }
    }

    #[test]
    fn test_codec_resync_reports_one_error_per_run() {
        let valid = encode(&timestamped_event()).unwrap();
        let mut buf = BytesMut::new();
        buf.put_slice(&[0x00, 0x00, 0x00]);
        buf.put_slice(&valid);

        let mut codec = HarpCodec::new();
        assert!(codec.decode(&mut buf).is_err());
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(timestamped_event()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.discarded(), 3);
        assert!(!codec.is_resyncing());
    }

    #[test]
    fn test_codec_reports_each_separate_corrupt_run() {
        // Read of register 0 with a bad checksum; no suffix looks like a frame start
        let corrupt = [0x01u8, 0x04, 0x00, 0xFF, 0x01, 0x00];
        let mut codec = HarpCodec::new();
        let mut errors = Vec::new();
        for _ in 0..2 {
            let mut buf = BytesMut::from(&corrupt[..]);
            loop {
                match codec.decode(&mut buf) {
                    Ok(Some(frame)) => panic!("decoded {frame}"),
                    Ok(None) => break,
                    Err(err) => errors.push(err),
                }
            }
            assert!(buf.is_empty());
            assert!(!codec.is_resyncing());
        }
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| matches!(e, DecodeError::Checksum { .. })));
        assert_eq!(codec.discarded(), 12);
    }

    #[test]
    fn test_codec_byte_at_a_time() {
        let valid = encode(&timestamped_event()).unwrap();
        let mut codec = HarpCodec::new();
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for byte in valid.iter().chain(valid.iter()) {
            buf.put_u8(*byte);
            if let Some(frame) = codec.decode(&mut buf).unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_skip_stalled() {
        // Looks like the start of a 200-byte frame that never completes
        let mut buf = BytesMut::from(&[0x01u8, 200, 0x00, 0xFF, 0x01][..]);
        let mut codec = HarpCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(codec.skip_stalled(&mut buf));
        assert_eq!(buf.len(), 4);
        assert!(codec.is_resyncing());
    }
}
