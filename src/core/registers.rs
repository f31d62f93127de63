//! Core register catalog
//!
//! Every Harp device exposes the same block of common registers at
//! addresses 0..=17 (0..=31 are reserved). The catalog is immutable and is
//! used to validate requests before anything reaches the wire.

use super::protocol::{DataType, Frame, Payload};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Device identifier
pub const WHO_AM_I: u8 = 0;
/// Hardware version, major
pub const HW_VERSION_H: u8 = 1;
/// Hardware version, minor
pub const HW_VERSION_L: u8 = 2;
/// Assembly version
pub const ASSEMBLY_VERSION: u8 = 3;
/// Harp core version, major
pub const CORE_VERSION_H: u8 = 4;
/// Harp core version, minor
pub const CORE_VERSION_L: u8 = 5;
/// Firmware version, major
pub const FIRMWARE_VERSION_H: u8 = 6;
/// Firmware version, minor
pub const FIRMWARE_VERSION_L: u8 = 7;
/// Harp time, whole seconds
pub const TIMESTAMP_SECOND: u8 = 8;
/// Harp time, 32 µs ticks
pub const TIMESTAMP_MICRO: u8 = 9;
/// Operation mode and heartbeat control
pub const OPERATION_CTRL: u8 = 10;
/// Reset and persistence control
pub const RESET_DEF: u8 = 11;
/// Device name (25 byte string)
pub const DEVICE_NAME: u8 = 12;
/// Serial number
pub const SERIAL_NUMBER: u8 = 13;
/// Clock synchronization configuration
pub const CLOCK_CONFIG: u8 = 14;
/// Timestamp offset
pub const TIMESTAMP_OFFSET: u8 = 15;
/// 128-bit unique identifier
pub const UUID: u8 = 16;
/// Build tag
pub const TAG: u8 = 17;

/// Number of core registers
pub const CORE_REGISTER_COUNT: usize = 18;
/// First address available to application registers
pub const FIRST_APP_ADDRESS: u8 = 32;

/// Register access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    /// Read only
    ReadOnly,
    /// Write only
    WriteOnly,
    /// Read and write
    ReadWrite,
}

impl Access {
    /// Whether reads are allowed
    pub fn readable(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    /// Whether writes are allowed
    pub fn writable(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => write!(f, "R"),
            Self::WriteOnly => write!(f, "W"),
            Self::ReadWrite => write!(f, "RW"),
        }
    }
}

/// Catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Register {
    /// Address
    pub address: u8,
    /// Register name
    pub name: &'static str,
    /// Element type
    pub data_type: DataType,
    /// Element count
    pub count: usize,
    /// Access mode
    pub access: Access,
}

impl Register {
    const fn new(address: u8, name: &'static str, data_type: DataType, count: usize, access: Access) -> Self {
        Self {
            address,
            name,
            data_type,
            count,
            access,
        }
    }

    /// Payload size in bytes
    pub fn byte_size(&self) -> usize {
        self.data_type.size() * self.count
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

use Access::{ReadOnly, ReadWrite};

static CORE_REGISTERS: [Register; CORE_REGISTER_COUNT] = [
    Register::new(WHO_AM_I, "WHO_AM_I", DataType::U16, 1, ReadOnly),
    Register::new(HW_VERSION_H, "HW_VERSION_H", DataType::U8, 1, ReadOnly),
    Register::new(HW_VERSION_L, "HW_VERSION_L", DataType::U8, 1, ReadOnly),
    Register::new(ASSEMBLY_VERSION, "ASSEMBLY_VERSION", DataType::U8, 1, ReadOnly),
    Register::new(CORE_VERSION_H, "CORE_VERSION_H", DataType::U8, 1, ReadOnly),
    Register::new(CORE_VERSION_L, "CORE_VERSION_L", DataType::U8, 1, ReadOnly),
    Register::new(FIRMWARE_VERSION_H, "FIRMWARE_VERSION_H", DataType::U8, 1, ReadOnly),
    Register::new(FIRMWARE_VERSION_L, "FIRMWARE_VERSION_L", DataType::U8, 1, ReadOnly),
    Register::new(TIMESTAMP_SECOND, "TIMESTAMP_SECOND", DataType::U32, 1, ReadWrite),
    Register::new(TIMESTAMP_MICRO, "TIMESTAMP_MICRO", DataType::U16, 1, ReadWrite),
    Register::new(OPERATION_CTRL, "OPERATION_CTRL", DataType::U8, 1, ReadWrite),
    Register::new(RESET_DEF, "RESET_DEF", DataType::U8, 1, ReadWrite),
    Register::new(DEVICE_NAME, "DEVICE_NAME", DataType::U8, 25, ReadWrite),
    Register::new(SERIAL_NUMBER, "SERIAL_NUMBER", DataType::U16, 1, ReadWrite),
    Register::new(CLOCK_CONFIG, "CLOCK_CONFIG", DataType::U8, 1, ReadWrite),
    Register::new(TIMESTAMP_OFFSET, "TIMESTAMP_OFFSET", DataType::U8, 1, ReadWrite),
    Register::new(UUID, "UUID", DataType::U8, 16, ReadOnly),
    Register::new(TAG, "TAG", DataType::U8, 8, ReadOnly),
];

/// Request rejected before transmission
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessViolation {
    /// Register cannot be read
    #[error("register {name} ({address}) is not readable")]
    NotReadable {
        /// Address
        address: u8,
        /// Register name
        name: &'static str,
    },

    /// Register cannot be written
    #[error("register {name} ({address}) is read-only")]
    NotWritable {
        /// Address
        address: u8,
        /// Register name
        name: &'static str,
    },

    /// Requested element type differs from the declared one
    #[error("register {name} ({address}) holds {expected}, not {requested}")]
    TypeMismatch {
        /// Address
        address: u8,
        /// Register name
        name: &'static str,
        /// Declared type
        expected: DataType,
        /// Requested type
        requested: DataType,
    },

    /// Write carries the wrong number of elements
    #[error("register {name} ({address}) holds {expected} elements, got {actual}")]
    ElementCount {
        /// Address
        address: u8,
        /// Register name
        name: &'static str,
        /// Declared count
        expected: usize,
        /// Supplied count
        actual: usize,
    },
}

impl AccessViolation {
    /// Address of the offending request
    pub fn address(&self) -> u8 {
        match self {
            Self::NotReadable { address, .. }
            | Self::NotWritable { address, .. }
            | Self::TypeMismatch { address, .. }
            | Self::ElementCount { address, .. } => *address,
        }
    }
}

/// Immutable lookup over the core registers
#[derive(Debug, Clone, Copy)]
pub struct RegisterCatalog {
    registers: &'static [Register],
}

impl RegisterCatalog {
    /// The common register set shared by every Harp device
    pub fn core() -> Self {
        Self {
            registers: &CORE_REGISTERS,
        }
    }

    /// Look up a register by address
    pub fn lookup(&self, address: u8) -> Option<&'static Register> {
        self.registers.iter().find(|r| r.address == address)
    }

    /// Look up a register by name (case-insensitive)
    pub fn by_name(&self, name: &str) -> Option<&'static Register> {
        self.registers.iter().find(|r| r.name.eq_ignore_ascii_case(name))
    }

    /// Iterate over all entries in address order
    pub fn iter(&self) -> impl Iterator<Item = &'static Register> {
        self.registers.iter()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.registers.len()
    }

    /// True for an empty catalog
    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Build a validated read request.
    ///
    /// Addresses outside the catalog are device-specific and pass unchecked.
    pub fn read(&self, address: u8, data_type: DataType) -> Result<Frame, AccessViolation> {
        if let Some(reg) = self.lookup(address) {
            if !reg.access.readable() {
                return Err(AccessViolation::NotReadable {
                    address,
                    name: reg.name,
                });
            }
            Self::check_type(reg, data_type)?;
        }
        Ok(Frame::read(address, data_type))
    }

    /// Build a validated write request
    pub fn write(&self, address: u8, value: &Payload) -> Result<Frame, AccessViolation> {
        if let Some(reg) = self.lookup(address) {
            if !reg.access.writable() {
                return Err(AccessViolation::NotWritable {
                    address,
                    name: reg.name,
                });
            }
            Self::check_type(reg, value.data_type())?;
            if value.len() != reg.count {
                return Err(AccessViolation::ElementCount {
                    address,
                    name: reg.name,
                    expected: reg.count,
                    actual: value.len(),
                });
            }
        }
        Ok(Frame::write(address, value))
    }

    fn check_type(reg: &Register, requested: DataType) -> Result<(), AccessViolation> {
        if reg.data_type == requested {
            Ok(())
        } else {
            Err(AccessViolation::TypeMismatch {
                address: reg.address,
                name: reg.name,
                expected: reg.data_type,
                requested,
            })
        }
    }
}

impl Default for RegisterCatalog {
    fn default() -> Self {
        Self::core()
    }
}

/// Device operation mode (OPERATION_CTRL bits 0-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationMode {
    /// Events disabled
    Standby,
    /// Normal operation
    Active,
    /// Reserved encoding
    Reserved,
    /// Speed mode
    Speed,
}

impl OperationMode {
    /// Decode from the two low bits
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::Standby,
            1 => Self::Active,
            2 => Self::Reserved,
            _ => Self::Speed,
        }
    }

    /// Two-bit encoding
    pub fn to_bits(self) -> u8 {
        match self {
            Self::Standby => 0,
            Self::Active => 1,
            Self::Reserved => 2,
            Self::Speed => 3,
        }
    }
}

impl std::str::FromStr for OperationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standby" => Ok(Self::Standby),
            "active" => Ok(Self::Active),
            "speed" => Ok(Self::Speed),
            other => Err(format!("unknown operation mode '{other}'")),
        }
    }
}

/// Bit view of the OPERATION_CTRL register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OperationControl(pub u8);

impl OperationControl {
    const DUMP: u8 = 1 << 3;
    const MUTE_RPL: u8 = 1 << 4;
    const VISUALEN: u8 = 1 << 5;
    const OPLEDEN: u8 = 1 << 6;
    const ALIVE_EN: u8 = 1 << 7;

    fn with_bit(self, mask: u8, on: bool) -> Self {
        if on {
            Self(self.0 | mask)
        } else {
            Self(self.0 & !mask)
        }
    }

    /// Operation mode
    pub fn mode(self) -> OperationMode {
        OperationMode::from_bits(self.0)
    }

    /// Replace the operation mode
    #[must_use]
    pub fn with_mode(self, mode: OperationMode) -> Self {
        Self((self.0 & !0x03) | mode.to_bits())
    }

    /// Register dump requested
    pub fn dump(self) -> bool {
        self.0 & Self::DUMP != 0
    }

    /// Set or clear the dump request
    #[must_use]
    pub fn with_dump(self, on: bool) -> Self {
        self.with_bit(Self::DUMP, on)
    }

    /// Replies muted
    pub fn mute_replies(self) -> bool {
        self.0 & Self::MUTE_RPL != 0
    }

    /// Set or clear reply muting
    #[must_use]
    pub fn with_mute_replies(self, on: bool) -> Self {
        self.with_bit(Self::MUTE_RPL, on)
    }

    /// Visual indicators enabled
    pub fn visual_indicators(self) -> bool {
        self.0 & Self::VISUALEN != 0
    }

    /// Set or clear visual indicators
    #[must_use]
    pub fn with_visual_indicators(self, on: bool) -> Self {
        self.with_bit(Self::VISUALEN, on)
    }

    /// Operation LED enabled
    pub fn operation_led(self) -> bool {
        self.0 & Self::OPLEDEN != 0
    }

    /// Set or clear the operation LED
    #[must_use]
    pub fn with_operation_led(self, on: bool) -> Self {
        self.with_bit(Self::OPLEDEN, on)
    }

    /// Heartbeat events enabled
    pub fn heartbeat(self) -> bool {
        self.0 & Self::ALIVE_EN != 0
    }

    /// Set or clear heartbeat events
    #[must_use]
    pub fn with_heartbeat(self, on: bool) -> Self {
        self.with_bit(Self::ALIVE_EN, on)
    }

    /// Whether a device in this state emits heartbeat events
    pub fn emits_heartbeat(self) -> bool {
        self.heartbeat() && self.mode() == OperationMode::Active && !self.mute_replies()
    }
}

impl fmt::Display for OperationControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} heartbeat={} muted={} visual={} led={}",
            self.mode(),
            self.heartbeat(),
            self.mute_replies(),
            self.visual_indicators(),
            self.operation_led()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::MessageType;

    #[test]
    fn test_catalog_covers_core_block() {
        let catalog = RegisterCatalog::core();
        assert_eq!(catalog.len(), CORE_REGISTER_COUNT);
        for (index, reg) in catalog.iter().enumerate() {
            assert_eq!(usize::from(reg.address), index);
        }
        assert_eq!(catalog.lookup(UUID).map(|r| r.byte_size()), Some(16));
        assert_eq!(catalog.by_name("timestamp_second").map(|r| r.address), Some(8));
        assert!(catalog.lookup(40).is_none());
    }

    #[test]
    fn test_write_read_only_rejected() {
        let catalog = RegisterCatalog::core();
        let err = catalog.write(WHO_AM_I, &Payload::from(1u16)).unwrap_err();
        assert_eq!(err, AccessViolation::NotWritable { address: 0, name: "WHO_AM_I" });
        assert!(catalog.write(UUID, &Payload::U8(vec![0; 16])).is_err());
    }

    #[test]
    fn test_type_and_count_checked() {
        let catalog = RegisterCatalog::core();
        assert!(matches!(
            catalog.read(TIMESTAMP_SECOND, DataType::U16),
            Err(AccessViolation::TypeMismatch { expected: DataType::U32, .. })
        ));
        assert!(matches!(
            catalog.write(TIMESTAMP_SECOND, &Payload::U32(vec![1, 2])),
            Err(AccessViolation::ElementCount { expected: 1, actual: 2, .. })
        ));
        let frame = catalog.write(TIMESTAMP_SECOND, &Payload::from(3_000_000_000u32)).unwrap();
        assert_eq!(frame.message_type, MessageType::Write);
    }

    #[test]
    fn test_application_addresses_unchecked() {
        let catalog = RegisterCatalog::core();
        assert!(catalog.read(40, DataType::Float).is_ok());
        assert!(catalog.write(41, &Payload::S16(vec![-1, 2, 3])).is_ok());
    }

    #[test]
    fn test_operation_control_bits() {
        let ctrl = OperationControl(0)
            .with_mode(OperationMode::Active)
            .with_heartbeat(true);
        assert_eq!(ctrl.0, 0x81);
        assert!(ctrl.emits_heartbeat());
        assert!(!ctrl.with_mute_replies(true).emits_heartbeat());
        assert!(!ctrl.with_mode(OperationMode::Standby).emits_heartbeat());
        assert_eq!(ctrl.with_heartbeat(false).0, 0x01);
        assert!(OperationControl(0x08).dump());
    }
}
