//! Harp message and payload type tags
//!
//! Every frame carries a message type byte and a payload type byte. The
//! payload type packs the element width in its low nibble together with
//! signed/float markers and the has-timestamp flag.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Harp message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Read request, or its successful reply
    Read,
    /// Write request, or its successful reply
    Write,
    /// Unsolicited device event
    Event,
    /// Device rejected a read
    ReadError,
    /// Device rejected a write
    WriteError,
}

impl MessageType {
    /// Bit set on the wire for the error variants
    pub const ERROR_FLAG: u8 = 0x08;

    /// Get message type from its wire value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Read),
            0x02 => Some(Self::Write),
            0x03 => Some(Self::Event),
            0x09 => Some(Self::ReadError),
            0x0A => Some(Self::WriteError),
            _ => None,
        }
    }

    /// Wire value
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Read => 0x01,
            Self::Write => 0x02,
            Self::Event => 0x03,
            Self::ReadError => 0x01 | Self::ERROR_FLAG,
            Self::WriteError => 0x02 | Self::ERROR_FLAG,
        }
    }

    /// True for `ReadError` and `WriteError`
    pub fn is_error(self) -> bool {
        matches!(self, Self::ReadError | Self::WriteError)
    }

    /// True for the types a host may send as a request
    pub fn is_request(self) -> bool {
        matches!(self, Self::Read | Self::Write)
    }

    /// Whether a frame of this type answers a request of type `request`
    pub fn answers(self, request: MessageType) -> bool {
        match request {
            Self::Read => matches!(self, Self::Read | Self::ReadError),
            Self::Write => matches!(self, Self::Write | Self::WriteError),
            _ => false,
        }
    }

    /// Get name of message type
    pub fn name(&self) -> &'static str {
        match self {
            Self::Read => "Read",
            Self::Write => "Write",
            Self::Event => "Event",
            Self::ReadError => "ReadError",
            Self::WriteError => "WriteError",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Element type of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Unsigned 8-bit
    U8,
    /// Signed 8-bit
    S8,
    /// Unsigned 16-bit
    U16,
    /// Signed 16-bit
    S16,
    /// Unsigned 32-bit
    U32,
    /// Signed 32-bit
    S32,
    /// Unsigned 64-bit
    U64,
    /// Signed 64-bit
    S64,
    /// IEEE-754 single precision
    Float,
}

impl DataType {
    const SIGNED: u8 = 0x80;
    const FLOAT: u8 = 0x40;

    /// All element types
    pub fn all() -> &'static [DataType] {
        &[
            DataType::U8,
            DataType::S8,
            DataType::U16,
            DataType::S16,
            DataType::U32,
            DataType::S32,
            DataType::U64,
            DataType::S64,
            DataType::Float,
        ]
    }

    /// Element size in bytes
    pub fn size(self) -> usize {
        match self {
            DataType::U8 | DataType::S8 => 1,
            DataType::U16 | DataType::S16 => 2,
            DataType::U32 | DataType::S32 | DataType::Float => 4,
            DataType::U64 | DataType::S64 => 8,
        }
    }

    /// Wire bits, without the timestamp flag
    pub fn to_bits(self) -> u8 {
        match self {
            DataType::U8 => 0x01,
            DataType::S8 => Self::SIGNED | 0x01,
            DataType::U16 => 0x02,
            DataType::S16 => Self::SIGNED | 0x02,
            DataType::U32 => 0x04,
            DataType::S32 => Self::SIGNED | 0x04,
            DataType::U64 => 0x08,
            DataType::S64 => Self::SIGNED | 0x08,
            DataType::Float => Self::FLOAT | 0x04,
        }
    }

    /// Parse wire bits. The timestamp flag must already be masked off.
    pub fn from_bits(bits: u8) -> Option<Self> {
        Self::all().iter().copied().find(|t| t.to_bits() == bits)
    }

    /// Get name of data type
    pub fn name(&self) -> &'static str {
        match self {
            DataType::U8 => "U8",
            DataType::S8 => "S8",
            DataType::U16 => "U16",
            DataType::S16 => "S16",
            DataType::U32 => "U32",
            DataType::S32 => "S32",
            DataType::U64 => "U64",
            DataType::S64 => "S64",
            DataType::Float => "Float",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "u8" => Ok(Self::U8),
            "s8" | "i8" => Ok(Self::S8),
            "u16" => Ok(Self::U16),
            "s16" | "i16" => Ok(Self::S16),
            "u32" => Ok(Self::U32),
            "s32" | "i32" => Ok(Self::S32),
            "u64" => Ok(Self::U64),
            "s64" | "i64" => Ok(Self::S64),
            "float" | "f32" | "float32" => Ok(Self::Float),
            other => Err(format!("unknown data type '{other}'")),
        }
    }
}

/// Device timestamp carried by timestamped frames
///
/// Seconds plus a sub-second count of 32 µs ticks (0..=31249).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct HarpTimestamp {
    /// Whole seconds
    pub seconds: u32,
    /// Sub-second ticks of 32 µs
    pub ticks: u16,
}

impl HarpTimestamp {
    /// Microseconds per tick
    pub const TICK_MICROS: u32 = 32;
    /// Encoded size on the wire
    pub const SIZE: usize = 6;

    /// Create a timestamp
    pub fn new(seconds: u32, ticks: u16) -> Self {
        Self { seconds, ticks }
    }

    /// Build from total microseconds, truncating to tick resolution
    pub fn from_micros(micros: u64) -> Self {
        let seconds = (micros / 1_000_000) as u32;
        let ticks = ((micros % 1_000_000) / u64::from(Self::TICK_MICROS)) as u16;
        Self { seconds, ticks }
    }

    /// Total microseconds
    pub fn as_micros(&self) -> u64 {
        u64::from(self.seconds) * 1_000_000 + u64::from(self.ticks) * u64::from(Self::TICK_MICROS)
    }

    /// Seconds as floating point
    pub fn as_secs_f64(&self) -> f64 {
        self.as_micros() as f64 / 1_000_000.0
    }

    /// Little-endian wire encoding
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..4].copy_from_slice(&self.seconds.to_le_bytes());
        out[4..].copy_from_slice(&self.ticks.to_le_bytes());
        out
    }

    /// Parse the little-endian wire encoding
    pub fn from_bytes(raw: &[u8; Self::SIZE]) -> Self {
        Self {
            seconds: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            ticks: u16::from_le_bytes([raw[4], raw[5]]),
        }
    }
}

impl fmt::Display for HarpTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let micros = u32::from(self.ticks) * Self::TICK_MICROS;
        write!(f, "{}.{:06}s", self.seconds, micros)
    }
}

/// Strongly typed payload value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values")]
pub enum Payload {
    /// Unsigned 8-bit elements
    U8(Vec<u8>),
    /// Signed 8-bit elements
    S8(Vec<i8>),
    /// Unsigned 16-bit elements
    U16(Vec<u16>),
    /// Signed 16-bit elements
    S16(Vec<i16>),
    /// Unsigned 32-bit elements
    U32(Vec<u32>),
    /// Signed 32-bit elements
    S32(Vec<i32>),
    /// Unsigned 64-bit elements
    U64(Vec<u64>),
    /// Signed 64-bit elements
    S64(Vec<i64>),
    /// Float elements
    Float(Vec<f32>),
}

macro_rules! le_elements {
    ($bytes:expr, $ty:ty) => {{
        const SIZE: usize = std::mem::size_of::<$ty>();
        $bytes
            .chunks_exact(SIZE)
            .map(|chunk| {
                let mut raw = [0u8; SIZE];
                raw.copy_from_slice(chunk);
                <$ty>::from_le_bytes(raw)
            })
            .collect()
    }};
}

macro_rules! payload_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Payload {
                fn from(value: $ty) -> Self {
                    Payload::$variant(vec![value])
                }
            }

            impl From<Vec<$ty>> for Payload {
                fn from(values: Vec<$ty>) -> Self {
                    Payload::$variant(values)
                }
            }
        )*
    };
}

payload_from!(
    u8 => U8,
    i8 => S8,
    u16 => U16,
    i16 => S16,
    u32 => U32,
    i32 => S32,
    u64 => U64,
    i64 => S64,
    f32 => Float,
);

impl Payload {
    /// Element type of this payload
    pub fn data_type(&self) -> DataType {
        match self {
            Payload::U8(_) => DataType::U8,
            Payload::S8(_) => DataType::S8,
            Payload::U16(_) => DataType::U16,
            Payload::S16(_) => DataType::S16,
            Payload::U32(_) => DataType::U32,
            Payload::S32(_) => DataType::S32,
            Payload::U64(_) => DataType::U64,
            Payload::S64(_) => DataType::S64,
            Payload::Float(_) => DataType::Float,
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        match self {
            Payload::U8(v) => v.len(),
            Payload::S8(v) => v.len(),
            Payload::U16(v) => v.len(),
            Payload::S16(v) => v.len(),
            Payload::U32(v) => v.len(),
            Payload::S32(v) => v.len(),
            Payload::U64(v) => v.len(),
            Payload::S64(v) => v.len(),
            Payload::Float(v) => v.len(),
        }
    }

    /// True when there are no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when more than one element is carried
    pub fn is_array(&self) -> bool {
        self.len() > 1
    }

    /// Little-endian wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * self.data_type().size());
        match self {
            Payload::U8(v) => out.extend_from_slice(v),
            Payload::S8(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Payload::U16(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Payload::S16(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Payload::U32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Payload::S32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Payload::U64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Payload::S64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            Payload::Float(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
        }
        out
    }

    /// Decode raw bytes as elements of `data_type`.
    ///
    /// Returns `None` when the length is not a whole number of elements.
    pub fn from_bytes(data_type: DataType, bytes: &[u8]) -> Option<Self> {
        if bytes.len() % data_type.size() != 0 {
            return None;
        }
        let payload = match data_type {
            DataType::U8 => Payload::U8(bytes.to_vec()),
            DataType::S8 => Payload::S8(le_elements!(bytes, i8)),
            DataType::U16 => Payload::U16(le_elements!(bytes, u16)),
            DataType::S16 => Payload::S16(le_elements!(bytes, i16)),
            DataType::U32 => Payload::U32(le_elements!(bytes, u32)),
            DataType::S32 => Payload::S32(le_elements!(bytes, i32)),
            DataType::U64 => Payload::U64(le_elements!(bytes, u64)),
            DataType::S64 => Payload::S64(le_elements!(bytes, i64)),
            DataType::Float => Payload::Float(le_elements!(bytes, f32)),
        };
        Some(payload)
    }

    /// Parse textual values (as typed on a command line) into a payload
    pub fn parse_values<S: AsRef<str>>(data_type: DataType, values: &[S]) -> Result<Self, String> {
        fn parse_all<T: FromStr, S: AsRef<str>>(values: &[S]) -> Result<Vec<T>, String> {
            values
                .iter()
                .map(|v| {
                    let text = v.as_ref();
                    text.parse::<T>().map_err(|_| format!("invalid value '{text}'"))
                })
                .collect()
        }

        Ok(match data_type {
            DataType::U8 => Payload::U8(parse_all(values)?),
            DataType::S8 => Payload::S8(parse_all(values)?),
            DataType::U16 => Payload::U16(parse_all(values)?),
            DataType::S16 => Payload::S16(parse_all(values)?),
            DataType::U32 => Payload::U32(parse_all(values)?),
            DataType::S32 => Payload::S32(parse_all(values)?),
            DataType::U64 => Payload::U64(parse_all(values)?),
            DataType::S64 => Payload::S64(parse_all(values)?),
            DataType::Float => Payload::Float(parse_all(values)?),
        })
    }

    /// Borrow U8 elements
    pub fn as_u8(&self) -> Option<&[u8]> {
        match self {
            Payload::U8(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow U16 elements
    pub fn as_u16(&self) -> Option<&[u16]> {
        match self {
            Payload::U16(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow U32 elements
    pub fn as_u32(&self) -> Option<&[u32]> {
        match self {
            Payload::U32(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow U64 elements
    pub fn as_u64(&self) -> Option<&[u64]> {
        match self {
            Payload::U64(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::U8(v) => write!(f, "{v:?}"),
            Payload::S8(v) => write!(f, "{v:?}"),
            Payload::U16(v) => write!(f, "{v:?}"),
            Payload::S16(v) => write!(f, "{v:?}"),
            Payload::U32(v) => write!(f, "{v:?}"),
            Payload::S32(v) => write!(f, "{v:?}"),
            Payload::U64(v) => write!(f, "{v:?}"),
            Payload::S64(v) => write!(f, "{v:?}"),
            Payload::Float(v) => write!(f, "{v:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_wire_values() {
        assert_eq!(MessageType::ReadError.to_u8(), 9);
        assert_eq!(MessageType::WriteError.to_u8(), 10);
        assert_eq!(MessageType::from_u8(0x03), Some(MessageType::Event));
        assert_eq!(MessageType::from_u8(0x00), None);
        assert_eq!(MessageType::from_u8(0x0B), None);
    }

    #[test]
    fn test_reply_correlation_kinds() {
        assert!(MessageType::Read.answers(MessageType::Read));
        assert!(MessageType::ReadError.answers(MessageType::Read));
        assert!(!MessageType::Write.answers(MessageType::Read));
        assert!(!MessageType::Event.answers(MessageType::Read));
        assert!(MessageType::WriteError.answers(MessageType::Write));
    }

    #[test]
    fn test_data_type_bits() {
        assert_eq!(DataType::S16.to_bits(), 0x82);
        assert_eq!(DataType::Float.to_bits(), 0x44);
        for ty in DataType::all() {
            assert_eq!(DataType::from_bits(ty.to_bits()), Some(*ty));
        }
        assert_eq!(DataType::from_bits(0x03), None);
        assert_eq!(DataType::from_bits(0xC4), None);
    }

    #[test]
    fn test_data_type_from_str() {
        assert_eq!("U32".parse::<DataType>(), Ok(DataType::U32));
        assert_eq!("f32".parse::<DataType>(), Ok(DataType::Float));
        assert!("u24".parse::<DataType>().is_err());
    }

    #[test]
    fn test_timestamp_micros() {
        let ts = HarpTimestamp::from_micros(3_000_000_000 * 1_000_000 + 500_000);
        assert_eq!(ts.seconds, 3_000_000_000);
        assert_eq!(ts.ticks, 15_625);
        assert_eq!(ts.as_micros() % 1_000_000, 500_000);
        assert_eq!(HarpTimestamp::from_bytes(&ts.to_bytes()), ts);
        assert_eq!(ts.to_string(), "3000000000.500000s");
    }

    #[test]
    fn test_payload_little_endian() {
        let payload = Payload::from(3_000_000_000u32);
        assert_eq!(payload.to_bytes(), 3_000_000_000u32.to_le_bytes().to_vec());
        assert_eq!(Payload::from_bytes(DataType::U32, &payload.to_bytes()), Some(payload));
    }

    #[test]
    fn test_payload_rejects_partial_elements() {
        assert_eq!(Payload::from_bytes(DataType::U32, &[1, 2, 3]), None);
        assert_eq!(Payload::from_bytes(DataType::U16, &[1, 2, 3]), None);
        assert!(Payload::from_bytes(DataType::U64, &[0; 16]).is_some_and(|p| p.is_array()));
    }

    #[test]
    fn test_parse_values() {
        let payload = Payload::parse_values(DataType::S16, &["-3", "7"]).unwrap();
        assert_eq!(payload, Payload::S16(vec![-3, 7]));
        assert!(Payload::parse_values(DataType::U8, &["300"]).is_err());
    }
}
