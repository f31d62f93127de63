//! Device identity summary read from the core registers

use super::error::{HarpError, HarpResult};
use super::registers;
use super::session::DeviceSession;
use serde::Serialize;
use std::fmt;

/// Identity and version information of a Harp device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// WHO_AM_I identifier
    pub who_am_i: u16,
    /// Hardware version (major, minor)
    pub hardware_version: (u8, u8),
    /// Assembly version
    pub assembly_version: u8,
    /// Harp core version (major, minor)
    pub core_version: (u8, u8),
    /// Firmware version (major, minor)
    pub firmware_version: (u8, u8),
    /// Serial number
    pub serial_number: u16,
    /// Device name, NUL padding stripped
    pub device_name: String,
    /// 128-bit UUID as 32 hex digits, if the device supports it
    pub uuid: Option<String>,
    /// Build tag, if the device supports it
    pub tag: Option<String>,
    /// Device clock, whole seconds
    pub harp_seconds: u32,
}

/// Render a 128-bit identifier as 32 lowercase hex digits
pub fn format_uuid(value: u128) -> String {
    uuid::Uuid::from_u128(value).simple().to_string()
}

/// Decode a NUL-padded byte string
pub fn padded_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

// Optional registers: only a missing register is tolerated.
fn optional<T>(result: HarpResult<T>) -> HarpResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(HarpError::Device { .. } | HarpError::Timeout { .. } | HarpError::UnexpectedPayload { .. }) => {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

impl DeviceInfo {
    /// Read every identity register
    pub async fn read(session: &DeviceSession) -> HarpResult<Self> {
        let who_am_i = session.read_u16(registers::WHO_AM_I).await?;
        let hardware_version = (
            session.read_u8(registers::HW_VERSION_H).await?,
            session.read_u8(registers::HW_VERSION_L).await?,
        );
        let assembly_version = session.read_u8(registers::ASSEMBLY_VERSION).await?;
        let core_version = (
            session.read_u8(registers::CORE_VERSION_H).await?,
            session.read_u8(registers::CORE_VERSION_L).await?,
        );
        let firmware_version = (
            session.read_u8(registers::FIRMWARE_VERSION_H).await?,
            session.read_u8(registers::FIRMWARE_VERSION_L).await?,
        );
        let serial_number = session.read_u16(registers::SERIAL_NUMBER).await?;
        let name = session
            .read_value(registers::DEVICE_NAME, super::protocol::DataType::U8)
            .await?;
        let device_name = padded_string(name.as_u8().unwrap_or_default());
        let uuid = optional(session.read_uuid().await)?.map(format_uuid);
        let tag = optional(session.read_tag().await)?.map(|bytes| padded_string(&bytes));
        let harp_seconds = session.harp_seconds().await?;

        Ok(Self {
            who_am_i,
            hardware_version,
            assembly_version,
            core_version,
            firmware_version,
            serial_number,
            device_name,
            uuid,
            tag,
            harp_seconds,
        })
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Device name:      {}", self.device_name)?;
        writeln!(f, "WHO_AM_I:         {}", self.who_am_i)?;
        writeln!(
            f,
            "Hardware version: {}.{}",
            self.hardware_version.0, self.hardware_version.1
        )?;
        writeln!(f, "Assembly version: {}", self.assembly_version)?;
        writeln!(f, "Core version:     {}.{}", self.core_version.0, self.core_version.1)?;
        writeln!(
            f,
            "Firmware version: {}.{}",
            self.firmware_version.0, self.firmware_version.1
        )?;
        writeln!(f, "Serial number:    {}", self.serial_number)?;
        writeln!(f, "UUID:             {}", self.uuid.as_deref().unwrap_or("-"))?;
        writeln!(f, "Tag:              {}", self.tag.as_deref().unwrap_or("-"))?;
        write!(f, "Harp seconds:     {}", self.harp_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_uuid_matches_hex() {
        let value = 0x0123_4567_89ab_cdef_u128 | (0xfedc_ba98_7654_3210_u128 << 64);
        let text = format_uuid(value);
        assert_eq!(text.len(), 32);
        assert_eq!(text, format!("{value:032x}"));
        assert_eq!(format_uuid(0xCAFE), "0000000000000000000000000000cafe");
    }

    #[test]
    fn test_padded_string() {
        assert_eq!(padded_string(b"pico\0\0\0"), "pico");
        assert_eq!(padded_string(b""), "");
        assert_eq!(padded_string(b"v1.2.0"), "v1.2.0");
    }
}
